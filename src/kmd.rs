//! The kernel-mode driver boundary.
//!
//! The KMD owns hardware queue slots and the doorbell apertures. The queue engine
//! reaches it through [`KernelDriver`], handing over raw views of the structures the
//! hardware will read: the packet ring and the read/write index words. Those views are
//! plain addresses on the real driver; the mock driver in the test suite uses them to
//! emulate GPU-side behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::QueueError;
use crate::event::QueueEvent;
use crate::packet::AqlPacket;
use crate::signal::Signal;

/// A shared 64-bit index word inside the queue record.
///
/// Both the engine and the device read and write through this address. The pointee is
/// guaranteed valid from `create_queue` until the matching `destroy_queue` returns;
/// in this crate the queue record is additionally kept alive by reference counting.
#[derive(Debug, Clone, Copy)]
pub struct SharedIndex {
    ptr: *const AtomicU64,
}

// The pointee is an atomic and the validity window is part of the KMD contract.
unsafe impl Send for SharedIndex {}
unsafe impl Sync for SharedIndex {}

impl SharedIndex {
    pub(crate) fn new(word: &AtomicU64) -> Self {
        SharedIndex { ptr: word }
    }

    pub fn load(&self, order: Ordering) -> u64 {
        unsafe { (*self.ptr).load(order) }
    }

    pub fn store(&self, value: u64, order: Ordering) {
        unsafe { (*self.ptr).store(value, order) }
    }

    pub fn fetch_add(&self, value: u64, order: Ordering) -> u64 {
        unsafe { (*self.ptr).fetch_add(value, order) }
    }
}

/// The packet ring as the device sees it: a base address and a power-of-two packet
/// count.
#[derive(Debug, Clone, Copy)]
pub struct RingView {
    base: *mut AqlPacket,
    packet_count: u32,
}

// Slots are atomic-dword packets; aliasing with the owning queue is by design.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}

impl RingView {
    pub(crate) fn new(base: *mut AqlPacket, packet_count: u32) -> Self {
        debug_assert!(packet_count.is_power_of_two());
        RingView { base, packet_count }
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base.cast()
    }

    /// The slot for dispatch index `index` (wrapped into the ring).
    ///
    /// # Safety
    ///
    /// The ring mapping must still be live (between `create_queue` and ring free).
    pub unsafe fn packet<'a>(&self, index: u64) -> &'a AqlPacket {
        let slot = (index & u64::from(self.packet_count - 1)) as usize;
        &*self.base.add(slot)
    }
}

/// MMIO doorbell page handed back by the KMD.
///
/// Stores carry release semantics: the implementation must not let prior ring writes
/// reorder past the doorbell write.
pub trait DoorbellMmio: Send + Sync {
    /// 64-bit store used by the native AQL doorbell.
    fn store_u64(&self, value: u64);
    /// 32-bit store used by both legacy doorbell variants.
    fn store_u32(&self, value: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    Low,
    Normal,
    High,
}

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Normal
    }
}

/// Arguments for [`KernelDriver::create_queue`].
pub struct CreateQueueArgs {
    pub node_id: u32,
    pub priority: QueuePriority,
    /// Initial queue percentage (always 100 at creation).
    pub percent: u32,
    pub ring: RingView,
    pub ring_bytes: u64,
    /// Where the device publishes consumption progress.
    pub read_index: SharedIndex,
    /// Where the device reads the producer's progress. For legacy doorbells this is
    /// the software proxy (`max_legacy_doorbell_dispatch_id_plus_1`), not the true
    /// write index.
    pub write_index: SharedIndex,
    /// Shared per-process event for interrupt-mode queues.
    pub event: Option<Arc<QueueEvent>>,
    /// Signal the KMD posts exception reasons into, when it supports exception
    /// debugging.
    pub error_reason: Option<Signal>,
}

/// Successful queue attach.
pub struct CreatedQueue {
    pub queue_id: u64,
    pub doorbell: Arc<dyn DoorbellMmio>,
}

/// Contract the queue engine requires from the kernel-mode driver.
pub trait KernelDriver: Send + Sync {
    /// Whether the KMD routes hardware exceptions to a dedicated signal
    /// (`CreateQueueArgs::error_reason`).
    fn supports_exception_debugging(&self) -> bool;

    fn create_queue(&self, args: CreateQueueArgs) -> Result<CreatedQueue, QueueError>;
    fn destroy_queue(&self, queue_id: u64) -> Result<(), QueueError>;

    /// Re-attaches the queue at `percent` of its time slice with a new priority.
    /// `percent = 0` suspends the queue.
    fn update_queue(&self, queue_id: u64, percent: u32, priority: QueuePriority)
        -> Result<(), QueueError>;

    fn set_queue_cu_mask(&self, queue_id: u64, mask: &[u32]) -> Result<(), QueueError>;

    /// Allocates GWS slots for a cooperative queue; returns the first slot index.
    fn alloc_queue_gws(&self, queue_id: u64, slots: u32) -> Result<u32, QueueError>;
}
