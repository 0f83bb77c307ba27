//! The queue record shared with hardware.
//!
//! This is the cache-line-aligned structure the packet processor walks: dispatch
//! indices, the legacy doorbell proxy, scratch programming, and the fault signal all
//! live here. The producer owns `write_dispatch_id`, the device owns
//! `read_dispatch_id`; everything the two sides race on is an atomic.
//!
//! The record is reference counted: the KMD (and in tests, the mock GPU) holds it for
//! as long as the hardware queue exists, independent of the owning [`crate::AqlQueue`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::packet::AqlPacket;
use crate::signal::Signal;

bitflags! {
    /// `queue_properties` bit set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueProperties: u32 {
        /// Pointers in the record are 64-bit.
        const IS_PTR64 = 1 << 0;
        /// The current scratch grant is single-use; the device raises a reclaim fault
        /// after the dispatch retires.
        const USE_SCRATCH_ONCE = 1 << 1;
    }
}

/// Producer-visible queue kinds.
pub const QUEUE_TYPE_MULTI: u32 = 0;
pub const QUEUE_TYPE_COOPERATIVE: u32 = 2;

/// Producer-visible feature bits.
pub const QUEUE_FEATURE_KERNEL_DISPATCH: u32 = 1;

/// Producer-visible queue header (the HSA queue ABI prefix of the record).
#[repr(C)]
pub struct QueueHeader {
    pub queue_type: AtomicU32,
    pub features: u32,
    base_address: *mut AqlPacket,
    /// Opaque doorbell handle exposed to producers (the public queue id).
    pub doorbell_handle: AtomicU64,
    /// Ring capacity in packets; a power of two.
    pub size: u32,
    reserved1: u32,
    /// Runtime-unique queue id, bound after the KMD attach.
    pub id: AtomicU64,
}

/// The shared queue record.
#[repr(C, align(64))]
pub struct QueueRecord {
    pub hsa_queue: QueueHeader,
    pub read_dispatch_id_field_base_byte_offset: u32,
    _pad0: [u32; 5],

    // Producer-owned line.
    pub write_dispatch_id: AtomicU64,
    _pad1: [u64; 7],

    // Device-owned line.
    pub read_dispatch_id: AtomicU64,
    _pad2: [u64; 7],

    pub max_legacy_doorbell_dispatch_id_plus_1: AtomicU64,
    pub legacy_doorbell_lock: AtomicU32,
    pub queue_properties: AtomicU32,
    pub group_segment_aperture_base_hi: AtomicU32,
    pub private_segment_aperture_base_hi: AtomicU32,
    pub max_cu_id: u32,
    pub max_wave_id: u32,

    pub scratch_resource_descriptor: [AtomicU32; 4],
    pub compute_tmpring_size: AtomicU32,
    pub scratch_wave64_lane_byte_size: AtomicU32,
    pub scratch_backing_memory_location: AtomicU64,
    pub scratch_backing_memory_byte_size: AtomicU64,

    /// Raised by the device on fault; the payload is the raw error bitmask.
    pub queue_inactive_signal: Signal,
}

// `base_address` is a raw pointer into the ring, valid for the life of the hardware
// queue; all mutable state is atomic or refcounted.
unsafe impl Send for QueueRecord {}
unsafe impl Sync for QueueRecord {}

impl QueueRecord {
    pub(crate) fn new(
        ring_base: *mut AqlPacket,
        ring_packets: u32,
        inactive_signal: Signal,
        max_cu_id: u32,
        max_wave_id: u32,
    ) -> Self {
        let mut record = QueueRecord {
            hsa_queue: QueueHeader {
                queue_type: AtomicU32::new(QUEUE_TYPE_MULTI),
                features: QUEUE_FEATURE_KERNEL_DISPATCH,
                base_address: ring_base,
                doorbell_handle: AtomicU64::new(0),
                size: ring_packets,
                reserved1: 0,
                id: AtomicU64::new(u64::MAX),
            },
            read_dispatch_id_field_base_byte_offset: 0,
            _pad0: [0; 5],
            write_dispatch_id: AtomicU64::new(0),
            _pad1: [0; 7],
            read_dispatch_id: AtomicU64::new(0),
            _pad2: [0; 7],
            max_legacy_doorbell_dispatch_id_plus_1: AtomicU64::new(0),
            legacy_doorbell_lock: AtomicU32::new(0),
            queue_properties: AtomicU32::new(QueueProperties::IS_PTR64.bits()),
            group_segment_aperture_base_hi: AtomicU32::new(0),
            private_segment_aperture_base_hi: AtomicU32::new(0),
            max_cu_id,
            max_wave_id,
            scratch_resource_descriptor: Default::default(),
            compute_tmpring_size: AtomicU32::new(0),
            scratch_wave64_lane_byte_size: AtomicU32::new(0),
            scratch_backing_memory_location: AtomicU64::new(0),
            scratch_backing_memory_byte_size: AtomicU64::new(0),
            queue_inactive_signal: inactive_signal,
        };
        // Debugger contract: where to find the read index relative to the record.
        record.read_dispatch_id_field_base_byte_offset =
            std::mem::offset_of!(QueueRecord, read_dispatch_id) as u32;
        record
    }

    /// Ring capacity in packets.
    pub fn size(&self) -> u32 {
        self.hsa_queue.size
    }

    /// The slot currently at dispatch index `index`.
    ///
    /// # Safety
    ///
    /// The ring mapping must still be live.
    pub unsafe fn packet(&self, index: u64) -> &AqlPacket {
        let slot = (index & u64::from(self.hsa_queue.size - 1)) as usize;
        &*self.hsa_queue.base_address.add(slot)
    }

    pub fn properties(&self) -> QueueProperties {
        QueueProperties::from_bits_truncate(self.queue_properties.load(Ordering::Relaxed))
    }

    pub(crate) fn set_property(&self, prop: QueueProperties, order: Ordering) {
        self.queue_properties.fetch_or(prop.bits(), order);
    }

    pub(crate) fn clear_property(&self, prop: QueueProperties, order: Ordering) {
        self.queue_properties.fetch_and(!prop.bits(), order);
    }

    pub fn is_cooperative(&self) -> bool {
        self.hsa_queue.queue_type.load(Ordering::Relaxed) == QUEUE_TYPE_COOPERATIVE
    }
}
