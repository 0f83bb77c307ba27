//! The AQL compute queue.
//!
//! [`AqlQueue`] owns one hardware command queue: the packet ring, the KMD attachment,
//! the doorbell, and the two async fault channels the device raises into it. Producers
//! reserve slots through the write-index surface, fill packets, and ring the doorbell;
//! the device consumes slots and advances the read index. When a dispatch needs more
//! private memory than is provisioned, the scratch fault handler re-sizes the backing
//! store in place and resumes the queue without the producer ever noticing.
//!
//! Teardown is a cooperative handshake: each fault handler owns a TERMINATE/DONE pair,
//! and the destructor pulses the corresponding signal until the handler acknowledges,
//! because a handler may be holding the queue pointer at any moment.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::agent::{AgentProperties, AllocFlags, ComputeAgent, Profile, RegionKind, ScratchInfo};
use crate::doorbell::{self, DoorbellKind};
use crate::error::{CuMaskStatus, QueueError};
use crate::event::{self, QueueEventGuard};
use crate::kmd::{
    CreateQueueArgs, CreatedQueue, DoorbellMmio, KernelDriver, QueuePriority, SharedIndex,
};
use crate::packet::{
    FenceScope, PacketType, HEADER_SCRELEASE_SCOPE_SHIFT, HEADER_SCRELEASE_SCOPE_WIDTH,
    PACKET_DWORDS, VENDOR_FORMAT_PM4_IB,
};
use crate::pm4;
use crate::record::{QueueProperties, QueueRecord, QUEUE_TYPE_COOPERATIVE};
use crate::ring::{self, RingBuffer};
use crate::scratch;
use crate::signal::{AsyncSignalDispatcher, HandlerDisposition, Signal, SignalCondition};

// Per-handler state bits.
const HANDLER_SCRATCH_RETRY: u32 = 1;
const HANDLER_TERMINATE: u32 = 2;
const HANDLER_DONE: u32 = 4;

// Fault codes posted into the inactive signal.
const FAULT_LARGE_SCRATCH_RECLAIM: i64 = 512;
const FAULT_INSUFFICIENT_SCRATCH_MASK: i64 = 0x401;
const FAULT_WAVE32_BIT: i64 = 0x400;
/// High bit of the inactive signal: scratch retry wakeups and the destructor's pulse
/// value.
const SIG_RETRY_BIT: i64 = crate::agent::SCRATCH_RETRY_WAKEUP_BIT;

const PM4_IB_BYTES: usize = 0x1000;

/// GFX8 microcode below this version needs a SYSTEM release fence patched into the
/// faulting dispatch so single-use scratch stores are flushed.
const GFX8_SCRATCH_FLUSH_MCODE: u32 = 729;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime flags affecting queue construction.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// KMD node the queue attaches to.
    pub node_id: u32,
    /// Use interrupt-backed signals sharing the per-process event instead of polled
    /// signals.
    pub use_interrupt_wait: bool,
    /// Require a private-segment aperture at construction.
    pub check_flat_scratch: bool,
    /// Skip the initial CU mask application.
    pub cu_mask_skip_init: bool,
    /// Process-global CU mask ANDed into every user mask.
    pub global_cu_mask: Vec<u32>,
}

/// Callback invoked (with the queue already suspended) when a runtime fault is
/// promoted to an error. Receives the error kind and the public queue id.
pub type QueueErrorCallback = Box<dyn Fn(QueueError, u64) + Send + Sync>;

/// PM4 indirect buffer shared by all [`AqlQueue::execute_pm4`] calls on a queue.
struct Pm4IndirectBuffer {
    buf: NonNull<u8>,
    size: usize,
    agent: Arc<dyn ComputeAgent>,
}

// The buffer is only written under the queue's IB mutex.
unsafe impl Send for Pm4IndirectBuffer {}
unsafe impl Sync for Pm4IndirectBuffer {}

impl Pm4IndirectBuffer {
    fn allocate(agent: &Arc<dyn ComputeAgent>) -> Result<Pm4IndirectBuffer, QueueError> {
        let buf = agent
            .system_alloc(PM4_IB_BYTES, 0x1000, AllocFlags::EXECUTABLE)
            .ok_or(QueueError::OutOfResources)?;
        Ok(Pm4IndirectBuffer {
            buf,
            size: PM4_IB_BYTES,
            agent: Arc::clone(agent),
        })
    }
}

impl Drop for Pm4IndirectBuffer {
    fn drop(&mut self) {
        self.agent.system_dealloc(self.buf);
    }
}

/// Raw queue pointer handed to fault handlers.
///
/// Validity is guaranteed by the termination protocol: the destructor does not free
/// the queue until both handlers have reported DONE, and a handler never touches the
/// queue again after setting DONE.
#[derive(Clone, Copy)]
struct QueuePtr(*const QueueCore);

unsafe impl Send for QueuePtr {}

struct QueueCore {
    record: Arc<QueueRecord>,
    ring: RingBuffer,
    agent: Arc<dyn ComputeAgent>,
    kmd: Arc<dyn KernelDriver>,
    dispatcher: Arc<AsyncSignalDispatcher>,

    props: AgentProperties,
    isa_major: u32,
    profile: Profile,
    doorbell_kind: DoorbellKind,
    queue_full_workaround: bool,

    doorbell: Arc<dyn DoorbellMmio>,
    kmd_queue_id: u64,
    public_id: u64,

    active: AtomicBool,
    suspended: AtomicBool,
    priority: Mutex<QueuePriority>,

    scratch: Mutex<ScratchInfo>,
    errors_callback: Option<QueueErrorCallback>,

    dynamic_scratch_state: AtomicU32,
    exception_state: AtomicU32,
    inactive_signal: Signal,
    exception_signal: Signal,

    cu_mask: Mutex<Vec<u32>>,
    global_cu_mask: Vec<u32>,

    pm4_ib: Pm4IndirectBuffer,
    pm4_ib_lock: Mutex<()>,

    _event_guard: Option<QueueEventGuard>,
}

/// A user-mode AQL compute queue attached to one hardware queue slot.
pub struct AqlQueue {
    core: Box<QueueCore>,
}

impl AqlQueue {
    /// Builds the queue: allocates the ring, attaches to the KMD, programs the scratch
    /// SRD, and arms the fault handlers. Any failure unwinds every acquisition made so
    /// far.
    pub fn create(
        agent: Arc<dyn ComputeAgent>,
        kmd: Arc<dyn KernelDriver>,
        dispatcher: Arc<AsyncSignalDispatcher>,
        req_size_pkts: u32,
        mut scratch: ScratchInfo,
        errors_callback: Option<QueueErrorCallback>,
        config: QueueConfig,
    ) -> Result<AqlQueue, QueueError> {
        let props = agent.properties();
        let isa_major = agent.isa_major_version();
        let profile = agent.profile();

        // GFX7/8 cannot take a doorbell equal to last_doorbell + queue_size; the ring
        // is doubled and doorbells run modulo the doubled size.
        let queue_full_workaround = isa_major == 7 || isa_major == 8;
        let doorbell_kind = DoorbellKind::from_raw(props.doorbell_type)
            .ok_or(QueueError::InvalidQueueCreation)?;

        let packets = ring::clamp_and_validate(req_size_pkts, queue_full_workaround)?;
        let ring = RingBuffer::allocate(&agent, packets, queue_full_workaround)?;

        let event_guard = config.use_interrupt_wait.then(event::acquire_queue_event);
        let (inactive_signal, exception_signal) = match &event_guard {
            Some(guard) => (
                Signal::with_event(0, Arc::clone(guard.event())),
                Signal::with_event(0, Arc::clone(guard.event())),
            ),
            None => (Signal::new(0), Signal::new(0)),
        };

        let max_cu_id = props.cu_count() - 1;
        let max_wave_id = props.max_waves_per_simd * props.num_simd_per_cu - 1;
        let record = Arc::new(QueueRecord::new(
            ring.base_ptr().cast(),
            packets,
            inactive_signal.clone(),
            max_cu_id,
            max_wave_id,
        ));

        for region in agent.regions() {
            let base_hi = (region.base >> 32) as u32;
            match region.kind {
                RegionKind::Lds => record
                    .group_segment_aperture_base_hi
                    .store(base_hi, Ordering::Relaxed),
                RegionKind::Scratch => record
                    .private_segment_aperture_base_hi
                    .store(base_hi, Ordering::Relaxed),
                RegionKind::System => {}
            }
        }
        debug_assert_ne!(
            record.group_segment_aperture_base_hi.load(Ordering::Relaxed),
            0,
            "no group region found"
        );
        if config.check_flat_scratch {
            debug_assert_ne!(
                record
                    .private_segment_aperture_base_hi
                    .load(Ordering::Relaxed),
                0,
                "no private region found"
            );
        }

        // Allocated ahead of the KMD attach so everything after `create_queue` is
        // infallible and failure unwind stays pure RAII.
        let pm4_ib = Pm4IndirectBuffer::allocate(&agent)?;

        let write_index = if doorbell_kind == DoorbellKind::NativeAql {
            SharedIndex::new(&record.write_dispatch_id)
        } else {
            // Legacy doorbells publish through the software proxy.
            SharedIndex::new(&record.max_legacy_doorbell_dispatch_id_plus_1)
        };
        let CreatedQueue { queue_id, doorbell } = kmd
            .create_queue(CreateQueueArgs {
                node_id: config.node_id,
                priority: QueuePriority::Normal,
                percent: 100,
                ring: ring.view(),
                ring_bytes: ring.alloc_bytes() as u64,
                read_index: SharedIndex::new(&record.read_dispatch_id),
                write_index,
                event: event_guard.as_ref().map(|g| Arc::clone(g.event())),
                error_reason: kmd
                    .supports_exception_debugging()
                    .then(|| exception_signal.clone()),
            })
            .map_err(|_| QueueError::OutOfResources)?;

        // Bind an id unique for the process lifetime.
        let public_id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        record.hsa_queue.id.store(public_id, Ordering::Relaxed);
        record
            .hsa_queue
            .doorbell_handle
            .store(public_id, Ordering::Relaxed);

        scratch.queue_retry_signal = Some(inactive_signal.clone());
        scratch::update_scratch_srd(&record, &scratch, isa_major, profile, &props);

        let handle_exceptions = !kmd.supports_exception_debugging();

        let core = Box::new(QueueCore {
            record,
            ring,
            agent,
            kmd,
            dispatcher,
            props,
            isa_major,
            profile,
            doorbell_kind,
            queue_full_workaround,
            doorbell,
            kmd_queue_id: queue_id,
            public_id,
            active: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            priority: Mutex::new(QueuePriority::Normal),
            scratch: Mutex::new(scratch),
            errors_callback,
            dynamic_scratch_state: AtomicU32::new(0),
            // Without a dedicated exception channel the scratch handler decodes
            // exceptions itself and the exception handler never arms.
            exception_state: AtomicU32::new(if handle_exceptions { HANDLER_DONE } else { 0 }),
            inactive_signal,
            exception_signal,
            cu_mask: Mutex::new(Vec::new()),
            global_cu_mask: config.global_cu_mask,
            pm4_ib,
            pm4_ib_lock: Mutex::new(()),
            _event_guard: event_guard,
        });

        let ptr = QueuePtr(&*core);
        QueueCore::arm_scratch_handler(&core, ptr, 0, handle_exceptions);
        if !handle_exceptions {
            QueueCore::arm_exception_handler(&core, ptr);
        }

        if !config.cu_mask_skip_init {
            if let Err(err) = core.set_cu_masking(&[]) {
                tracing::warn!(?err, queue = public_id, "initial CU mask application failed");
            }
        }

        core.active.store(true, Ordering::Release);
        tracing::debug!(
            queue = public_id,
            packets,
            ?doorbell_kind,
            workaround = queue_full_workaround,
            "queue created"
        );
        Ok(AqlQueue { core })
    }

    /// Detaches and tears the queue down.
    ///
    /// Cooperative queues are owned by the agent's GWS pool from
    /// [`enable_gws`](Self::enable_gws) on: their GWS slots are returned and the
    /// hardware queue is left to the pool.
    pub fn destroy(self) {
        if self.core.record.is_cooperative() {
            self.core.agent.gws_release();
            std::mem::forget(self);
            return;
        }
        // Dropping runs the handler termination handshake and frees the resources.
    }

    // --- producer surface -------------------------------------------------------

    pub fn load_read_index_acquire(&self) -> u64 {
        self.core.record.read_dispatch_id.load(Ordering::Acquire)
    }

    pub fn load_read_index_relaxed(&self) -> u64 {
        self.core.record.read_dispatch_id.load(Ordering::Relaxed)
    }

    pub fn load_write_index_acquire(&self) -> u64 {
        self.core.record.write_dispatch_id.load(Ordering::Acquire)
    }

    pub fn load_write_index_relaxed(&self) -> u64 {
        self.core.record.write_dispatch_id.load(Ordering::Relaxed)
    }

    pub fn store_write_index_relaxed(&self, value: u64) {
        self.core
            .record
            .write_dispatch_id
            .store(value, Ordering::Relaxed);
    }

    pub fn store_write_index_release(&self, value: u64) {
        self.core
            .record
            .write_dispatch_id
            .store(value, Ordering::Release);
    }

    pub fn cas_write_index_acquire(&self, expected: u64, value: u64) -> u64 {
        self.cas_write_index(expected, value, Ordering::Acquire, Ordering::Acquire)
    }

    pub fn cas_write_index_acq_rel(&self, expected: u64, value: u64) -> u64 {
        self.cas_write_index(expected, value, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn cas_write_index_release(&self, expected: u64, value: u64) -> u64 {
        self.cas_write_index(expected, value, Ordering::Release, Ordering::Relaxed)
    }

    pub fn cas_write_index_relaxed(&self, expected: u64, value: u64) -> u64 {
        self.cas_write_index(expected, value, Ordering::Relaxed, Ordering::Relaxed)
    }

    fn cas_write_index(
        &self,
        expected: u64,
        value: u64,
        success: Ordering,
        failure: Ordering,
    ) -> u64 {
        match self
            .core
            .record
            .write_dispatch_id
            .compare_exchange(expected, value, success, failure)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub fn add_write_index_acquire(&self, value: u64) -> u64 {
        self.core
            .record
            .write_dispatch_id
            .fetch_add(value, Ordering::Acquire)
    }

    pub fn add_write_index_acq_rel(&self, value: u64) -> u64 {
        self.core
            .record
            .write_dispatch_id
            .fetch_add(value, Ordering::AcqRel)
    }

    pub fn add_write_index_release(&self, value: u64) -> u64 {
        self.core
            .record
            .write_dispatch_id
            .fetch_add(value, Ordering::Release)
    }

    pub fn add_write_index_relaxed(&self, value: u64) -> u64 {
        self.core
            .record
            .write_dispatch_id
            .fetch_add(value, Ordering::Relaxed)
    }

    /// Rings the doorbell with `value`, relaxed with respect to prior packet writes.
    pub fn store_relaxed(&self, value: i64) {
        doorbell::ring_doorbell_relaxed(
            &self.core.record,
            &*self.core.doorbell,
            self.core.doorbell_kind,
            self.core.queue_full_workaround,
            value,
        );
    }

    /// Rings the doorbell with `value`, ordered after every prior packet write.
    pub fn store_release(&self, value: i64) {
        doorbell::ring_doorbell_release(
            &self.core.record,
            &*self.core.doorbell,
            self.core.doorbell_kind,
            self.core.queue_full_workaround,
            value,
        );
    }

    // --- lifecycle --------------------------------------------------------------

    /// Detaches the queue from the hardware. Idempotent: only the transitioning call
    /// reaches the KMD.
    pub fn inactivate(&self) -> Result<(), QueueError> {
        self.core.inactivate()
    }

    /// Parks the queue at 0% of its time slice.
    pub fn suspend(&self) {
        self.core.suspend();
    }

    /// Changes the queue priority. Rejected while the queue is suspended.
    pub fn set_priority(&self, priority: QueuePriority) -> Result<(), QueueError> {
        if self.core.suspended.load(Ordering::Relaxed) {
            return Err(QueueError::InvalidQueue);
        }
        let mut current = lock(&self.core.priority);
        *current = priority;
        self.core
            .kmd
            .update_queue(self.core.kmd_queue_id, 100, priority)
            .map_err(|_| QueueError::OutOfResources)
    }

    /// Allocates GWS slots and flips the queue into cooperative mode.
    pub fn enable_gws(&self, gws_slot_count: u32) -> Result<(), QueueError> {
        self.core
            .kmd
            .alloc_queue_gws(self.core.kmd_queue_id, gws_slot_count)
            .map_err(|_| QueueError::OutOfResources)?;
        self.core
            .record
            .hsa_queue
            .queue_type
            .store(QUEUE_TYPE_COOPERATIVE, Ordering::Relaxed);
        Ok(())
    }

    // --- tuning -----------------------------------------------------------------

    /// Applies a CU mask. An empty `cu_mask` resets to all CUs enabled. Returns
    /// [`CuMaskStatus::Reduced`] when requested bits were removed by the process
    /// global mask.
    pub fn set_cu_masking(&self, cu_mask: &[u32]) -> Result<CuMaskStatus, QueueError> {
        self.core.set_cu_masking(cu_mask)
    }

    /// Copies the cached CU mask into `out`, zero-filling dwords past the stored
    /// size.
    pub fn get_cu_masking(&self, out: &mut [u32]) {
        let cached = lock(&self.core.cu_mask);
        debug_assert!(!cached.is_empty(), "no current CU mask");
        let n = cached.len().min(out.len());
        out[..n].copy_from_slice(&cached[..n]);
        out[n..].fill(0);
    }

    /// Injects a PM4 command through one AQL slot and waits for it to be consumed.
    pub fn execute_pm4(&self, cmd: &[u32]) {
        self.core.execute_pm4(cmd);
    }

    // --- introspection ----------------------------------------------------------

    pub fn public_id(&self) -> u64 {
        self.core.public_id
    }

    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Relaxed)
    }

    pub fn record(&self) -> &Arc<QueueRecord> {
        &self.core.record
    }

    pub fn ring_view(&self) -> crate::kmd::RingView {
        self.core.ring.view()
    }

    /// Snapshot of the queue's current scratch grant.
    pub fn scratch_info(&self) -> ScratchInfo {
        lock(&self.core.scratch).clone()
    }

    pub fn inactive_signal(&self) -> &Signal {
        &self.core.inactive_signal
    }

    pub fn exception_signal(&self) -> &Signal {
        &self.core.exception_signal
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl QueueCore {
    fn inactivate(&self) -> Result<(), QueueError> {
        if self.active.swap(false, Ordering::Relaxed) {
            self.kmd.destroy_queue(self.kmd_queue_id)?;
            // Subsequent frees must observe hardware quiescence.
            fence(Ordering::Acquire);
        }
        Ok(())
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
        let priority = *lock(&self.priority);
        if let Err(err) = self.kmd.update_queue(self.kmd_queue_id, 0, priority) {
            tracing::error!(?err, queue = self.public_id, "queue suspend failed");
        }
    }

    fn set_cu_masking(&self, cu_mask: &[u32]) -> Result<CuMaskStatus, QueueError> {
        let cu_count = self.props.cu_count();
        let (mask, clipped) = merge_cu_mask(cu_mask, &self.global_cu_mask, cu_count);

        let mut cached = lock(&self.cu_mask);
        // Skip the KMD for the implicit all-ones mask applied at queue init.
        if !cached.is_empty() || !cu_mask.is_empty() || !self.global_cu_mask.is_empty() {
            self.kmd
                .set_queue_cu_mask(self.kmd_queue_id, &mask)
                .map_err(|_| QueueError::Error)?;
        }
        *cached = mask;
        Ok(if clipped {
            CuMaskStatus::Reduced
        } else {
            CuMaskStatus::Applied
        })
    }

    fn execute_pm4(&self, cmd: &[u32]) {
        // The IB is a shared resource; one injection at a time.
        let _ib = lock(&self.pm4_ib_lock);

        // Obtain a queue slot for a single AQL packet, waiting out a full ring.
        let write_idx = self
            .record
            .write_dispatch_id
            .fetch_add(1, Ordering::AcqRel);
        while write_idx.wrapping_sub(self.record.read_dispatch_id.load(Ordering::Relaxed))
            >= u64::from(self.record.size())
        {
            thread::yield_now();
        }

        debug_assert!(cmd.len() * 4 < self.pm4_ib.size, "PM4 exceeds IB size");
        unsafe {
            std::ptr::copy_nonoverlapping(
                cmd.as_ptr(),
                self.pm4_ib.buf.as_ptr().cast::<u32>(),
                cmd.len(),
            );
        }

        let ib_jump = pm4::indirect_buffer(
            self.pm4_ib.buf.as_ptr() as u64,
            cmd.len() as u32,
            self.isa_major,
        );

        let mut slot_data = [0u32; PACKET_DWORDS];
        if self.isa_major <= 8 {
            // Pure PM4 in the slot: [NOP pad | INDIRECT_BUFFER | RELEASE_MEM]. The
            // RELEASE_MEM advances the read index and invalidates the slot header, so
            // it must come last.
            const NOP_PAD_DW: usize =
                PACKET_DWORDS - pm4::INDIRECT_BUFFER_SIZE_DW - pm4::RELEASE_MEM_SIZE_DW;
            slot_data[0] = pm4::nop_header(NOP_PAD_DW as u32, self.isa_major);
            slot_data[NOP_PAD_DW..NOP_PAD_DW + pm4::INDIRECT_BUFFER_SIZE_DW]
                .copy_from_slice(&ib_jump);
            slot_data[NOP_PAD_DW + pm4::INDIRECT_BUFFER_SIZE_DW..]
                .copy_from_slice(&pm4::release_mem_aql(self.isa_major));
        } else {
            // Vendor-specific AQL packet embedding the IB jump.
            slot_data[0] = (PacketType::VendorSpecific as u32)
                | (u32::from(VENDOR_FORMAT_PM4_IB) << 16);
            slot_data[1..1 + pm4::INDIRECT_BUFFER_SIZE_DW].copy_from_slice(&ib_jump);
            slot_data[5] = 0xa; // dw_cnt_remain
        }

        // Publish payload first, header dword last.
        self.ring.slot(write_idx).publish(&slot_data);

        doorbell::ring_doorbell_release(
            &self.record,
            &*self.doorbell,
            self.doorbell_kind,
            self.queue_full_workaround,
            write_idx as i64,
        );

        // Wait until the command processor retires the slot.
        while self.record.read_dispatch_id.load(Ordering::Relaxed) <= write_idx {
            thread::yield_now();
        }
    }

    fn arm_scratch_handler(core: &QueueCore, ptr: QueuePtr, wait_value: i64, handle_exceptions: bool) {
        core.dispatcher.register(
            core.inactive_signal.clone(),
            SignalCondition::Ne,
            wait_value,
            Box::new(move |value| {
                QueueCore::dynamic_scratch_handler(ptr, value, handle_exceptions)
            }),
        );
    }

    fn arm_exception_handler(core: &QueueCore, ptr: QueuePtr) {
        core.dispatcher.register(
            core.exception_signal.clone(),
            SignalCondition::Ne,
            0,
            Box::new(move |value| QueueCore::exception_handler(ptr, value)),
        );
    }

    /// Handler for the queue-inactive fault channel.
    ///
    /// `handle_exceptions` is fixed at registration: true when this channel also
    /// carries hardware exceptions (no dedicated exception signal).
    fn dynamic_scratch_handler(
        ptr: QueuePtr,
        mut error_code: i64,
        handle_exceptions: bool,
    ) -> HandlerDisposition {
        let queue = unsafe { &*ptr.0 };
        let mut error: Option<QueueError> = None;
        let mut change_wait = false;
        let mut wait_value: i64 = 0;

        if queue.dynamic_scratch_state.load(Ordering::Relaxed) & HANDLER_SCRATCH_RETRY != 0 {
            // The retry wakeup arrived; fold the marker bit away and re-arm on
            // "anything but idle" afterwards.
            queue
                .dynamic_scratch_state
                .fetch_and(!HANDLER_SCRATCH_RETRY, Ordering::Relaxed);
            change_wait = true;
            wait_value = 0;
            queue.inactive_signal.and_relaxed(!SIG_RETRY_BIT);
            error_code &= !SIG_RETRY_BIT;
        }

        if queue.dynamic_scratch_state.load(Ordering::Relaxed) & HANDLER_TERMINATE == 0 {
            if error_code == FAULT_LARGE_SCRATCH_RECLAIM {
                // The single-use grant retired; hand the backing store back and
                // resume with no scratch assigned.
                let mut scratch = lock(&queue.scratch);
                queue.agent.release_queue_scratch(&mut scratch);
                scratch.reset_allocation();
                scratch::update_scratch_srd(
                    &queue.record,
                    &scratch,
                    queue.isa_major,
                    queue.profile,
                    &queue.props,
                );
                drop(scratch);
                queue.inactive_signal.store_relaxed(0);
                queue
                    .record
                    .clear_property(QueueProperties::USE_SCRATCH_ONCE, Ordering::Release);
                fence(Ordering::Release);
                return HandlerDisposition::KeepArmed;
            }

            if error_code & FAULT_INSUFFICIENT_SCRATCH_MASK != 0 {
                error = Self::grow_scratch(queue, error_code, &mut change_wait, &mut wait_value);
            } else if handle_exceptions {
                error = Some(decode_queue_fault(error_code));
            } else {
                // Exceptions ride the dedicated channel; clear this one so the
                // exception handler can observe its own signal.
                queue.inactive_signal.store_relaxed(0);
            }

            match error {
                None => {
                    if change_wait {
                        Self::arm_scratch_handler(queue, ptr, wait_value, handle_exceptions);
                        return HandlerDisposition::Unarm;
                    }
                    return HandlerDisposition::KeepArmed;
                }
                Some(error) => {
                    tracing::warn!(?error, queue = queue.public_id, code = error_code, "queue fault");
                    queue.suspend();
                    if let Some(callback) = &queue.errors_callback {
                        callback(error, queue.public_id);
                    }
                }
            }
        }

        // Terminating, or an error was surfaced. The signal clone is taken before DONE
        // becomes visible: once it is, the queue may be freed, and only the signal's
        // own refcount keeps the wakeup path alive.
        let signal = queue.inactive_signal.clone();
        queue
            .dynamic_scratch_state
            .store(HANDLER_DONE, Ordering::Release);
        signal.store_release(-1);
        HandlerDisposition::Unarm
    }

    /// Re-sizes and re-acquires scratch for the dispatch stalled at the read index.
    fn grow_scratch(
        queue: &QueueCore,
        error_code: i64,
        change_wait: &mut bool,
        wait_value: &mut i64,
    ) -> Option<QueueError> {
        let mut scratch = lock(&queue.scratch);
        queue.agent.release_queue_scratch(&mut scratch);

        let read_index = queue.record.read_dispatch_id.load(Ordering::Acquire);
        let slot = unsafe { queue.record.packet(read_index) };
        if slot.packet_type(Ordering::Acquire) != PacketType::KernelDispatch as u8 {
            debug_assert!(false, "invalid packet under scratch fault");
            return Some(QueueError::Error);
        }
        let pkt = slot.dispatch_snapshot();
        if pkt.workgroup_size_x == 0 || pkt.workgroup_size_y == 0 || pkt.workgroup_size_z == 0 {
            debug_assert!(false, "zero workgroup dimension under scratch fault");
            return Some(QueueError::Error);
        }

        scratch::size_for_dispatch(
            &mut scratch,
            &pkt,
            error_code & FAULT_WAVE32_BIT != 0,
            &queue.props,
            queue.record.max_cu_id,
        );

        scratch.retry = false;
        queue.agent.acquire_queue_scratch(&mut scratch);

        if scratch.retry {
            // Transient shortage: sleep until the agent pokes the retry signal.
            queue
                .dynamic_scratch_state
                .fetch_or(HANDLER_SCRATCH_RETRY, Ordering::Relaxed);
            *change_wait = true;
            *wait_value = error_code;
            return None;
        }
        if scratch.queue_base == 0 {
            return Some(QueueError::OutOfResources);
        }

        if scratch.large {
            queue
                .record
                .set_property(QueueProperties::USE_SCRATCH_ONCE, Ordering::Relaxed);
            // Older GFX8 microcode does not flush single-use scratch stores unless the
            // dispatch carries a SYSTEM release fence.
            if queue.isa_major == 8
                && queue.agent.microcode_version() < GFX8_SCRATCH_FLUSH_MCODE
            {
                slot.patch_header(|header| {
                    let cleared = header
                        & !(((1 << HEADER_SCRELEASE_SCOPE_WIDTH) - 1)
                            << HEADER_SCRELEASE_SCOPE_SHIFT);
                    cleared | ((FenceScope::System as u16) << HEADER_SCRELEASE_SCOPE_SHIFT)
                });
            }
        }

        scratch::update_scratch_srd(
            &queue.record,
            &scratch,
            queue.isa_major,
            queue.profile,
            &queue.props,
        );
        drop(scratch);
        // Restart the queue.
        queue.inactive_signal.store_release(0);
        None
    }

    /// Handler for the dedicated hardware exception channel.
    fn exception_handler(ptr: QueuePtr, error_code: i64) -> HandlerDisposition {
        let queue = unsafe { &*ptr.0 };

        if queue.exception_state.load(Ordering::Relaxed) & HANDLER_TERMINATE != 0 {
            let signal = queue.exception_signal.clone();
            queue.exception_state.store(HANDLER_DONE, Ordering::Release);
            signal.store_release(0);
            return HandlerDisposition::Unarm;
        }

        let error = decode_exception_code(error_code);
        tracing::warn!(?error, queue = queue.public_id, code = error_code, "queue exception");
        queue.suspend();
        if let Some(callback) = &queue.errors_callback {
            callback(error, queue.public_id);
        }

        let signal = queue.exception_signal.clone();
        queue.exception_state.store(HANDLER_DONE, Ordering::Release);
        signal.store_release(0);
        HandlerDisposition::Unarm
    }
}

impl Drop for QueueCore {
    fn drop(&mut self) {
        // Retire the scratch handler synchronously: pulse the signal until the
        // handler observes TERMINATE and acknowledges with DONE. The wait is bounded
        // because the pulse can overwrite the handler's final store after DONE is
        // already visible; the loop condition is what actually gates teardown.
        self.dynamic_scratch_state
            .fetch_or(HANDLER_TERMINATE, Ordering::AcqRel);
        while self.dynamic_scratch_state.load(Ordering::Acquire) & HANDLER_DONE == 0 {
            self.inactive_signal.store_release(SIG_RETRY_BIT);
            let _ = self.inactive_signal.wait_bounded(
                SignalCondition::Ne,
                SIG_RETRY_BIT,
                std::time::Duration::from_millis(1),
            );
        }

        // Same handshake for the exception handler (already DONE when it never armed).
        self.exception_state
            .fetch_or(HANDLER_TERMINATE, Ordering::AcqRel);
        while self.exception_state.load(Ordering::Acquire) & HANDLER_DONE == 0 {
            self.exception_signal.store_release(-1);
            let _ = self.exception_signal.wait_bounded(
                SignalCondition::Ne,
                -1,
                std::time::Duration::from_millis(1),
            );
        }

        if let Err(err) = self.inactivate() {
            tracing::error!(?err, queue = self.public_id, "queue detach failed");
        }
        let mut scratch = lock(&self.scratch);
        self.agent.release_queue_scratch(&mut scratch);
        drop(scratch);
        // Ring, signals, PM4 IB, and the event share drop with their fields.
    }
}

/// Decodes the inactive-signal fault bitmask (no dedicated exception channel).
fn decode_queue_fault(error_code: i64) -> QueueError {
    if error_code & 2 != 0 {
        QueueError::IncompatibleArguments // invalid dimensions
    } else if error_code & 4 != 0 {
        QueueError::InvalidAllocation // invalid group memory
    } else if error_code & 8 != 0 {
        QueueError::InvalidCodeObject
    } else if error_code & (32 | 256) != 0 {
        QueueError::InvalidPacketFormat // 32 generic, 256 vendor specific
    } else if error_code & 64 != 0 {
        QueueError::InvalidArgument // group too large
    } else if error_code & 128 != 0 {
        QueueError::InvalidIsa // out of VGPRs
    } else if error_code & 0x2000_0000 != 0 {
        QueueError::MemoryApertureViolation
    } else if error_code & 0x4000_0000 != 0 {
        QueueError::IllegalInstruction
    } else if error_code & 0x8000_0000 != 0 {
        // Debug trap. Fatal in intent, informational in effect.
        QueueError::Exception
    } else {
        debug_assert!(false, "undefined queue error code {error_code:#x}");
        QueueError::Error
    }
}

/// Exception-channel codes (`EC_*`), delivered as `1 << (code - 1)` bit positions.
const EXCEPTION_CODE_TABLE: &[(u32, QueueError)] = &[
    (1, QueueError::Exception),  // wave abort
    (2, QueueError::Exception),  // wave trap
    (3, QueueError::Exception),  // wave math error
    (4, QueueError::IllegalInstruction),
    (5, QueueError::MemoryFault),
    (6, QueueError::MemoryApertureViolation),
    (16, QueueError::IncompatibleArguments), // dispatch dim invalid
    (17, QueueError::InvalidAllocation),     // group segment size invalid
    (18, QueueError::InvalidCodeObject),
    (20, QueueError::InvalidPacketFormat), // unsupported packet
    (21, QueueError::InvalidArgument),     // workgroup size invalid
    (22, QueueError::InvalidIsa),          // register demand invalid
    (23, QueueError::InvalidPacketFormat), // vendor packet unsupported
    (31, QueueError::Error),               // preemption error
    (33, QueueError::MemoryApertureViolation),
    (34, QueueError::Error), // device RAS error
    (35, QueueError::Error), // device fatal halt
    (36, QueueError::Error), // device reset
    (50, QueueError::Error), // device removed
];

fn decode_exception_code(error_code: i64) -> QueueError {
    for (code, kind) in EXCEPTION_CODE_TABLE {
        if error_code & (1i64 << (code - 1)) != 0 {
            return *kind;
        }
    }
    debug_assert!(false, "undefined queue exception code {error_code:#x}");
    QueueError::Error
}

/// Merges a user CU mask with the process-global mask and the physical CU count.
///
/// Returns the applied mask and whether requested bits were clipped away.
fn merge_cu_mask(user: &[u32], global: &[u32], cu_count: u32) -> (Vec<u32>, bool) {
    let mask_dwords = ((cu_count + 31) / 32) as usize;
    let tail_mask = if cu_count % 32 == 0 {
        0
    } else {
        (1u32 << (cu_count % 32)) - 1
    };

    // An empty user mask resets to all CUs enabled.
    let mut mask: Vec<u32> = if user.is_empty() {
        vec![u32::MAX; mask_dwords]
    } else {
        user.to_vec()
    };

    let mut clipped = false;
    if !global.is_empty() {
        let limit = global.len().min(mask.len()).min(mask_dwords);
        // Bits requested beyond the merged range count as clipped.
        clipped |= mask[limit..].iter().any(|&w| w != 0);
        mask.truncate(limit);
        for (word, &global_word) in mask.iter_mut().zip(global) {
            clipped |= (*word & !global_word) != 0;
            *word &= global_word;
        }
    } else {
        let limit = mask.len().min(mask_dwords);
        mask.truncate(limit);
    }

    // Trim the last dword to the physical CU count.
    if mask.len() == mask_dwords && tail_mask != 0 {
        if let Some(last) = mask.last_mut() {
            *last &= tail_mask;
        }
    }

    (mask, clipped)
}
