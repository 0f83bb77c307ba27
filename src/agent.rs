//! The compute agent contract.
//!
//! The queue engine never talks to a device directly; everything device-specific —
//! ISA generation, CU topology, system memory allocation, and the scratch pool — is
//! reached through [`ComputeAgent`]. Tests substitute a mock; the production agent
//! wraps the real device enumeration.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::signal::Signal;

bitflags! {
    /// Flags for [`ComputeAgent::system_alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Pages must be executable (PM4 indirect buffers, packet rings).
        const EXECUTABLE = 1 << 0;
        /// Request a virtually doubled allocation: the region is `2 * size` bytes and
        /// the two halves alias the same physical pages.
        const DOUBLE_MAP = 1 << 1;
    }
}

/// HSA memory profile of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Base,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    System,
    /// Group (LDS) segment window.
    Lds,
    /// Private (scratch) segment window.
    Scratch,
}

/// One memory aperture advertised by the agent.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegionDesc {
    pub kind: RegionKind,
    pub base: u64,
}

/// Device shape and capability bits consumed by the queue engine.
#[derive(Debug, Clone, Copy)]
pub struct AgentProperties {
    pub num_fcompute_cores: u32,
    pub num_simd_per_cu: u32,
    pub max_slots_scratch_cu: u32,
    pub num_shader_banks: u32,
    pub max_waves_per_simd: u32,
    /// Raw doorbell capability: 0 = GFX7 dword doorbell, 1 = legacy 64-bit index,
    /// 2 = native AQL doorbell.
    pub doorbell_type: u32,
    /// KV APU class devices forbid executable ring pages.
    pub is_kv: bool,
}

impl AgentProperties {
    pub fn cu_count(&self) -> u32 {
        self.num_fcompute_cores / self.num_simd_per_cu
    }
}

/// High bit the agent sets (together with the original fault code) when storing into
/// [`ScratchInfo::queue_retry_signal`] to wake a queue parked on a scratch retry.
pub const SCRATCH_RETRY_WAKEUP_BIT: i64 = i64::MIN;

/// Scratch sizing request/response exchanged with the agent's scratch pool.
#[derive(Debug, Clone, Default)]
pub struct ScratchInfo {
    /// Device address of the queue's scratch backing; zero when none is assigned.
    pub queue_base: u64,
    /// Total bytes provisioned (worst case over all scratch slots).
    pub size: u64,
    /// Bytes per lane, padded so a whole wave occupies a 1 KiB multiple.
    pub size_per_thread: u32,
    pub lanes_per_wave: u32,
    pub waves_per_group: u64,
    /// Scratch slots the faulting dispatch actually wants.
    pub wanted_slots: u64,
    /// Bytes needed to cover exactly `wanted_slots`.
    pub dispatch_size: u64,
    /// Process-address-space offset of the backing, programmed into the queue record.
    pub queue_process_offset: u64,
    /// Set by the agent when the grant is a large allocation that must be released
    /// after a single dispatch.
    pub large: bool,
    /// Set by the agent when the request should be retried later (transient
    /// contention on the scratch pool).
    pub retry: bool,
    /// Signal the agent stores into to wake the retry dance; the queue's inactive
    /// signal.
    pub queue_retry_signal: Option<Signal>,
}

impl ScratchInfo {
    /// Clears the grant back to "no scratch assigned".
    pub fn reset_allocation(&mut self) {
        self.queue_base = 0;
        self.size = 0;
        self.size_per_thread = 0;
        self.queue_process_offset = 0;
    }
}

/// Contract the queue engine requires from a compute agent.
pub trait ComputeAgent: Send + Sync {
    fn properties(&self) -> AgentProperties;
    fn isa_major_version(&self) -> u32;
    fn microcode_version(&self) -> u32;
    fn profile(&self) -> Profile;
    fn regions(&self) -> Vec<MemoryRegionDesc>;

    /// Allocates system memory visible to the device.
    fn system_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;
    fn system_dealloc(&self, ptr: NonNull<u8>);

    /// Attempts to assign scratch backing per the sizing in `scratch`. On return
    /// either `queue_base` is non-zero (granted), `retry` is set (try again when the
    /// retry signal fires), or both are clear (hard failure).
    fn acquire_queue_scratch(&self, scratch: &mut ScratchInfo);
    fn release_queue_scratch(&self, scratch: &mut ScratchInfo);

    /// Returns the agent's GWS slots for a cooperative queue being torn down.
    fn gws_release(&self);
}
