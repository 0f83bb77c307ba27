//! Packet ring allocation.
//!
//! On GFX7/8 the hardware cannot accept a doorbell equal to `last_doorbell +
//! queue_size`, so the ring is virtually doubled: a `2P`-byte range whose two halves
//! map the same physical pages, letting doorbell values run modulo the doubled size.
//! The mapping trick is OS-specific and hidden behind [`RingMapper`]: an
//! anonymous-shared-memory mapper for FULL-profile devices, and a system-allocator
//! mapper that requests the doubled region from the agent otherwise.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::agent::{AllocFlags, ComputeAgent, Profile};
use crate::error::QueueError;
use crate::kmd::RingView;
use crate::packet::{AqlPacket, PACKET_BYTES};

/// Smallest ring the command processor accepts.
const MIN_RING_BYTES: u64 = 0x400;
/// Hardware limit on the primary queue size.
const MAX_RING_BYTES: u64 = 0x1_0000_0000;
/// Double mapping needs whole pages of backing store.
const PAGE_BYTES: u64 = 0x1000;

/// Minimum packet capacity for the given workaround mode.
pub fn min_packets(queue_full_workaround: bool) -> u32 {
    let mut min_bytes = MIN_RING_BYTES;
    if queue_full_workaround {
        min_bytes = min_bytes.max(PAGE_BYTES);
    }
    (min_bytes / PACKET_BYTES as u64) as u32
}

/// Maximum packet capacity for the given workaround mode.
pub fn max_packets(queue_full_workaround: bool) -> u32 {
    let mut max_bytes = MAX_RING_BYTES;
    if queue_full_workaround {
        // Double mapping halves the usable virtual range.
        max_bytes /= 2;
    }
    (max_bytes / PACKET_BYTES as u64) as u32
}

/// Clamps a requested packet capacity into the supported range and rejects
/// capacities whose byte size is not a power of two.
pub fn clamp_and_validate(req_packets: u32, queue_full_workaround: bool) -> Result<u32, QueueError> {
    let packets = req_packets
        .min(max_packets(queue_full_workaround))
        .max(min_packets(queue_full_workaround));
    let bytes = u64::from(packets) * PACKET_BYTES as u64;
    if !bytes.is_power_of_two() {
        return Err(QueueError::InvalidQueueCreation);
    }
    Ok(packets)
}

pub(crate) struct MappedRing {
    base: NonNull<u8>,
    alloc_bytes: usize,
}

/// OS- or allocator-backed mapping strategy for the ring.
pub(crate) trait RingMapper: Send + Sync {
    /// Maps a ring with `phys_bytes` of backing store; the returned allocation may be
    /// `phys_bytes` or `2 * phys_bytes` of virtual space depending on the strategy.
    fn map(&self, phys_bytes: usize, executable: bool) -> Option<MappedRing>;
    fn unmap(&self, ring: &MappedRing);
}

/// Anonymous shared memory mapped twice back-to-back (Linux, FULL profile).
#[cfg(target_os = "linux")]
struct ShmDoubleMapper;

#[cfg(target_os = "linux")]
impl RingMapper for ShmDoubleMapper {
    fn map(&self, phys_bytes: usize, executable: bool) -> Option<MappedRing> {
        use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
        use rustix::mm::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};

        debug_assert_eq!(phys_bytes % PAGE_BYTES as usize, 0);

        let fd = memfd_create("aql-ring", MemfdFlags::CLOEXEC).ok()?;
        ftruncate(&fd, phys_bytes as u64).ok()?;

        let alloc_bytes = phys_bytes * 2;
        // Reserve the doubled range, then pin both halves onto the shared object.
        let reserve = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                alloc_bytes,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .ok()?;

        let mut prot = ProtFlags::READ | ProtFlags::WRITE;
        if executable {
            prot |= ProtFlags::EXEC;
        }

        let lower = unsafe {
            mmap(reserve, phys_bytes, prot, MapFlags::SHARED | MapFlags::FIXED, &fd, 0)
        };
        let upper = unsafe {
            mmap(
                (reserve as *mut u8).add(phys_bytes).cast(),
                phys_bytes,
                prot,
                MapFlags::SHARED | MapFlags::FIXED,
                &fd,
                0,
            )
        };
        if lower.is_err() || upper.is_err() {
            unsafe {
                let _ = munmap(reserve, alloc_bytes);
            }
            return None;
        }

        // The fd is released here; both mappings keep the object alive.
        Some(MappedRing {
            base: NonNull::new(reserve.cast())?,
            alloc_bytes,
        })
    }

    fn unmap(&self, ring: &MappedRing) {
        unsafe {
            let _ = rustix::mm::munmap(ring.base.as_ptr().cast(), ring.alloc_bytes);
        }
    }
}

#[cfg(target_os = "linux")]
fn shm_double_mapper() -> Result<Box<dyn RingMapper>, QueueError> {
    Ok(Box::new(ShmDoubleMapper))
}

/// The anonymous-shared-memory trick has no portable equivalent; FULL-profile legacy
/// parts are not supported off Linux.
#[cfg(not(target_os = "linux"))]
fn shm_double_mapper() -> Result<Box<dyn RingMapper>, QueueError> {
    Err(QueueError::OutOfResources)
}

/// Single-block mapper going through the agent's system allocator, optionally
/// requesting the doubled layout from the allocator itself.
struct SystemRingMapper {
    agent: Arc<dyn ComputeAgent>,
    double_map: bool,
}

impl RingMapper for SystemRingMapper {
    fn map(&self, phys_bytes: usize, executable: bool) -> Option<MappedRing> {
        let mut flags = AllocFlags::empty();
        if executable {
            flags |= AllocFlags::EXECUTABLE;
        }
        if self.double_map {
            flags |= AllocFlags::DOUBLE_MAP;
        }
        let rounded = phys_bytes.next_multiple_of(PAGE_BYTES as usize);
        let base = self.agent.system_alloc(rounded, PAGE_BYTES as usize, flags)?;
        let alloc_bytes = if self.double_map { rounded * 2 } else { rounded };
        Some(MappedRing { base, alloc_bytes })
    }

    fn unmap(&self, ring: &MappedRing) {
        self.agent.system_dealloc(ring.base);
    }
}

/// The owned packet ring.
pub struct RingBuffer {
    mapping: MappedRing,
    mapper: Box<dyn RingMapper>,
    packet_count: u32,
}

// The ring is raw shared memory; slot contents are atomic dwords and the base pointer
// is stable for the buffer's lifetime.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocates a ring of `packet_count` slots (already validated power of two).
    ///
    /// The executable-pages requirement is waived on KV-class APUs, which forbid EXEC
    /// mappings.
    pub(crate) fn allocate(
        agent: &Arc<dyn ComputeAgent>,
        packet_count: u32,
        queue_full_workaround: bool,
    ) -> Result<RingBuffer, QueueError> {
        let executable = !agent.properties().is_kv;
        let phys_bytes = packet_count as usize * PACKET_BYTES;

        let mapper: Box<dyn RingMapper> = if agent.profile() == Profile::Full && queue_full_workaround
        {
            shm_double_mapper()?
        } else {
            Box::new(SystemRingMapper {
                agent: Arc::clone(agent),
                double_map: queue_full_workaround,
            })
        };

        let mapping = mapper
            .map(phys_bytes, executable)
            .ok_or(QueueError::OutOfResources)?;
        let ring = RingBuffer {
            mapping,
            mapper,
            packet_count,
        };
        ring.invalidate_all();
        Ok(ring)
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.mapping.base.as_ptr()
    }

    /// Bytes of virtual address space the ring occupies (`2P` when double mapped).
    pub fn alloc_bytes(&self) -> usize {
        self.mapping.alloc_bytes
    }

    pub fn view(&self) -> RingView {
        RingView::new(self.mapping.base.as_ptr().cast(), self.packet_count)
    }

    /// Fills every slot header with the INVALID packet type. Packet payloads are left
    /// untouched to help track use of unpublished slots.
    fn invalidate_all(&self) {
        let view = self.view();
        for i in 0..u64::from(self.packet_count) {
            unsafe { view.packet(i) }.invalidate();
        }
    }

    pub(crate) fn slot(&self, index: u64) -> &AqlPacket {
        unsafe { self.view().packet(index) }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.mapper.unmap(&self.mapping);
    }
}
