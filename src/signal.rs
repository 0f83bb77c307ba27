//! Refcounted signals and the async signal handler dispatcher.
//!
//! Signals are the fault and completion channels of the queue engine: the GPU (or the
//! KMD on its behalf) stores an error bitmask into a queue's inactive signal, and the
//! dispatcher routes the observed value to the handler registered for it.
//!
//! A signal outlives the queue that created it — handlers hold a clone of the signal
//! and may store into it after the queue itself has been freed. That is the property
//! the destructor handshake relies on.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::event::QueueEvent;

/// Comparison applied between the observed signal value and a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCondition {
    Eq,
    Ne,
    Lt,
    Gte,
}

impl SignalCondition {
    pub fn satisfied(self, observed: i64, compare: i64) -> bool {
        match self {
            SignalCondition::Eq => observed == compare,
            SignalCondition::Ne => observed != compare,
            SignalCondition::Lt => observed < compare,
            SignalCondition::Gte => observed >= compare,
        }
    }
}

/// How a blocking wait should burn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Park the thread until the signal is stored.
    Blocked,
    /// Spin with thread yields; lower wakeup latency, higher CPU cost.
    Active,
}

#[derive(Debug)]
struct SignalInner {
    value: AtomicI64,
    gate: Mutex<()>,
    cond: Condvar,
    /// Interrupt-mode signals poke the shared per-process event on every store.
    event: Option<Arc<QueueEvent>>,
}

/// A reference-counted signal value.
///
/// Clones share the same underlying value; the storage lives as long as any clone does.
#[derive(Debug, Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    /// Creates a polled (default) signal.
    pub fn new(initial: i64) -> Self {
        Self::build(initial, None)
    }

    /// Creates an interrupt-backed signal that pokes `event` on every store.
    pub fn with_event(initial: i64, event: Arc<QueueEvent>) -> Self {
        Self::build(initial, Some(event))
    }

    fn build(initial: i64, event: Option<Arc<QueueEvent>>) -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                value: AtomicI64::new(initial),
                gate: Mutex::new(()),
                cond: Condvar::new(),
                event,
            }),
        }
    }

    pub fn load_relaxed(&self) -> i64 {
        self.inner.value.load(Ordering::Relaxed)
    }

    pub fn load_acquire(&self) -> i64 {
        self.inner.value.load(Ordering::Acquire)
    }

    pub fn store_relaxed(&self, value: i64) {
        self.inner.value.store(value, Ordering::Relaxed);
        self.wake();
    }

    /// Store with release ordering: prior writes become visible to any observer that
    /// acquires this value.
    pub fn store_release(&self, value: i64) {
        self.inner.value.store(value, Ordering::Release);
        self.wake();
    }

    pub fn and_relaxed(&self, mask: i64) {
        self.inner.value.fetch_and(mask, Ordering::Relaxed);
        self.wake();
    }

    fn wake(&self) {
        // Lock the gate so a waiter between its value check and its park cannot miss
        // the notification.
        let _g = self.inner.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cond.notify_all();
        if let Some(event) = &self.inner.event {
            event.set();
        }
    }

    /// Waits until `cond(observed, compare)` holds, returning the observed value.
    pub fn wait(&self, cond: SignalCondition, compare: i64, state: WaitState) -> i64 {
        loop {
            let observed = self.load_acquire();
            if cond.satisfied(observed, compare) {
                return observed;
            }
            match state {
                WaitState::Active => thread::yield_now(),
                WaitState::Blocked => {
                    let guard = self.inner.gate.lock().unwrap_or_else(|e| e.into_inner());
                    let observed = self.load_acquire();
                    if cond.satisfied(observed, compare) {
                        return observed;
                    }
                    // Timed wait: stores always notify under the gate, but a bounded
                    // park keeps a lost waiter recoverable.
                    let _ = self
                        .inner
                        .cond
                        .wait_timeout(guard, Duration::from_millis(10))
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Like [`wait`](Self::wait) with [`WaitState::Blocked`], but gives up once
    /// `timeout` elapses, returning `None`.
    ///
    /// Used where the waiter has a second exit condition to re-check (the destructor
    /// handshake: a handler's final store may itself be overwritten by the pulse).
    pub fn wait_bounded(
        &self,
        cond: SignalCondition,
        compare: i64,
        timeout: Duration,
    ) -> Option<i64> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let observed = self.load_acquire();
            if cond.satisfied(observed, compare) {
                return Some(observed);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let guard = self.inner.gate.lock().unwrap_or_else(|e| e.into_inner());
            let observed = self.load_acquire();
            if cond.satisfied(observed, compare) {
                return Some(observed);
            }
            let _ = self
                .inner
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// True when both handles refer to the same signal storage.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// What the handler wants done with its registration after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerDisposition {
    /// Re-arm on the same condition.
    KeepArmed,
    /// Drop the registration; the handler (or its owner) re-registers if needed.
    Unarm,
}

/// An async signal handler. Receives the observed signal value.
pub type AsyncSignalHandler = Box<dyn FnMut(i64) -> HandlerDisposition + Send>;

struct Registration {
    signal: Signal,
    cond: SignalCondition,
    compare: i64,
    handler: AsyncSignalHandler,
}

struct DispatcherShared {
    pending: Mutex<Vec<Registration>>,
    wake: QueueEvent,
    stop: AtomicBool,
}

/// Dispatches async signal handlers from a dedicated worker thread.
///
/// Registrations are single-shot: once the condition is observed and the handler runs,
/// the registration survives only if the handler returns
/// [`HandlerDisposition::KeepArmed`]. A handler may register a replacement (same signal,
/// different wait value) from inside the callback.
pub struct AsyncSignalDispatcher {
    shared: Arc<DispatcherShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncSignalDispatcher {
    pub fn spawn() -> Arc<Self> {
        let shared = Arc::new(DispatcherShared {
            pending: Mutex::new(Vec::new()),
            wake: QueueEvent::new(),
            stop: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("aql-signal-dispatch".into())
            .spawn(move || Self::run(worker_shared))
            .expect("failed to spawn signal dispatcher thread");
        Arc::new(AsyncSignalDispatcher {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Arms `handler` to run when `signal`'s value satisfies `cond` against `compare`.
    pub fn register(
        &self,
        signal: Signal,
        cond: SignalCondition,
        compare: i64,
        handler: AsyncSignalHandler,
    ) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration {
                signal,
                cond,
                compare,
                handler,
            });
        self.shared.wake.set();
    }

    fn run(shared: Arc<DispatcherShared>) {
        let mut active: Vec<Registration> = Vec::new();
        while !shared.stop.load(Ordering::Acquire) {
            {
                let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                active.append(&mut pending);
            }

            let mut i = 0;
            while i < active.len() {
                let observed = active[i].signal.load_acquire();
                if active[i].cond.satisfied(observed, active[i].compare) {
                    let mut reg = active.swap_remove(i);
                    match (reg.handler)(observed) {
                        HandlerDisposition::KeepArmed => active.push(reg),
                        HandlerDisposition::Unarm => drop(reg),
                    }
                    // The swapped-in element still needs a look; don't advance.
                } else {
                    i += 1;
                }
            }

            // Interrupt delivery and new registrations set the wake event; the timeout
            // bounds latency for polled (default) signals.
            shared.wake.wait_timeout(Duration::from_millis(1));
        }
        tracing::debug!(dropped = active.len(), "signal dispatcher stopping");
    }
}

impl Drop for AsyncSignalDispatcher {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.set();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = worker.join();
        }
    }
}
