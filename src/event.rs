//! Per-process queue event.
//!
//! Interrupt-mode queues share a single kernel event: every interrupt-backed signal
//! belonging to any queue in the process pokes the same event, and the async dispatcher
//! waits on it. The event is reference counted — created when the first interrupt-mode
//! queue attaches, destroyed when the last one detaches.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// An auto-reset event in the style of the kernel event the KMD signals.
#[derive(Debug, Default)]
pub struct QueueEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl QueueEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking one pending [`wait_timeout`](Self::wait_timeout).
    pub fn set(&self) {
        let mut signaled = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }

    /// Waits until the event is signaled or the timeout elapses, consuming the
    /// signaled state. Returns true when the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !*signaled {
            let (guard, _) = self
                .cond
                .wait_timeout_while(signaled, timeout, |s| !*s)
                .unwrap_or_else(|e| e.into_inner());
            signaled = guard;
        }
        let was = *signaled;
        *signaled = false;
        was
    }
}

#[derive(Default)]
struct PoolState {
    event: Option<Arc<QueueEvent>>,
    queues: u32,
}

static POOL: Mutex<PoolState> = Mutex::new(PoolState {
    event: None,
    queues: 0,
});

/// RAII share of the per-process queue event.
///
/// Holds the event alive for the lifetime of one interrupt-mode queue.
pub struct QueueEventGuard {
    event: Arc<QueueEvent>,
}

impl QueueEventGuard {
    pub fn event(&self) -> &Arc<QueueEvent> {
        &self.event
    }
}

impl Drop for QueueEventGuard {
    fn drop(&mut self) {
        let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
        pool.queues -= 1;
        if pool.queues == 0 {
            pool.event = None;
        }
    }
}

/// Attaches one interrupt-mode queue to the shared event, creating it on the 0→1
/// transition.
pub fn acquire_queue_event() -> QueueEventGuard {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.queues += 1;
    let event = pool
        .event
        .get_or_insert_with(|| Arc::new(QueueEvent::new()))
        .clone();
    QueueEventGuard { event }
}

/// Number of interrupt-mode queues currently sharing the event. The event object
/// exists exactly when this is non-zero.
pub fn queue_event_refcount() -> u32 {
    POOL.lock().unwrap_or_else(|e| e.into_inner()).queues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wait_consumes_signal() {
        let ev = QueueEvent::new();
        ev.set();
        assert!(ev.wait_timeout(Duration::from_millis(1)));
        // Auto-reset: a second wait times out.
        assert!(!ev.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn pool_refcounts_shared_event() {
        let before = queue_event_refcount();
        let a = acquire_queue_event();
        let b = acquire_queue_event();
        assert_eq!(queue_event_refcount(), before + 2);
        assert!(Arc::ptr_eq(a.event(), b.event()));
        drop(a);
        assert_eq!(queue_event_refcount(), before + 1);
        drop(b);
        assert_eq!(queue_event_refcount(), before);
    }
}
