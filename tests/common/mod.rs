//! Shared mock device stack for the integration tests: a configurable compute agent,
//! a recording kernel driver, and helpers that play the GPU's side of the protocol
//! (consuming packets, raising faults).
#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use aql_queue::agent::{
    AgentProperties, AllocFlags, ComputeAgent, MemoryRegionDesc, Profile, RegionKind, ScratchInfo,
};
use aql_queue::error::QueueError;
use aql_queue::kmd::{
    CreateQueueArgs, CreatedQueue, DoorbellMmio, KernelDriver, QueuePriority, RingView, SharedIndex,
};
use aql_queue::packet::{KernelDispatchPacket, PacketType};
use aql_queue::queue::{AqlQueue, QueueConfig};
use aql_queue::signal::AsyncSignalDispatcher;

pub const LDS_APERTURE_BASE: u64 = 0x1000_0000_0000;
pub const SCRATCH_APERTURE_BASE: u64 = 0x2000_0000_0000;
pub const SCRATCH_GRANT_BASE: u64 = 0x4_0000_0000;

/// How the mock agent answers `acquire_queue_scratch`.
#[derive(Debug, Clone, Copy)]
pub enum ScratchPolicy {
    Grant { base: u64, large: bool },
    Retry,
    Fail,
}

pub struct MockAgent {
    props: AgentProperties,
    isa_major: u32,
    microcode: Mutex<u32>,
    profile: Profile,
    pub scratch_policy: Mutex<ScratchPolicy>,
    /// Snapshot of the `ScratchInfo` after each acquire call.
    pub acquires: Mutex<Vec<ScratchInfo>>,
    pub releases: AtomicU32,
    pub gws_releases: AtomicU32,
    allocs: Mutex<HashMap<usize, Layout>>,
}

impl MockAgent {
    pub fn new(isa_major: u32, doorbell_type: u32, profile: Profile) -> Arc<MockAgent> {
        Arc::new(MockAgent {
            props: AgentProperties {
                num_fcompute_cores: 64,
                num_simd_per_cu: 4,
                max_slots_scratch_cu: 32,
                num_shader_banks: 4,
                max_waves_per_simd: 10,
                doorbell_type,
                is_kv: false,
            },
            isa_major,
            microcode: Mutex::new(1000),
            profile,
            scratch_policy: Mutex::new(ScratchPolicy::Grant {
                base: SCRATCH_GRANT_BASE,
                large: false,
            }),
            acquires: Mutex::new(Vec::new()),
            releases: AtomicU32::new(0),
            gws_releases: AtomicU32::new(0),
            allocs: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_scratch_policy(&self, policy: ScratchPolicy) {
        *self.scratch_policy.lock().unwrap() = policy;
    }

    pub fn set_microcode_version(&self, version: u32) {
        *self.microcode.lock().unwrap() = version;
    }

    /// Allocations handed out and not yet returned.
    pub fn outstanding_allocs(&self) -> usize {
        self.allocs.lock().unwrap().len()
    }

    pub fn max_scratch_slots(&self) -> u64 {
        u64::from(self.props.cu_count()) * u64::from(self.props.max_slots_scratch_cu)
    }
}

impl ComputeAgent for MockAgent {
    fn properties(&self) -> AgentProperties {
        self.props
    }

    fn isa_major_version(&self) -> u32 {
        self.isa_major
    }

    fn microcode_version(&self) -> u32 {
        *self.microcode.lock().unwrap()
    }

    fn profile(&self) -> Profile {
        self.profile
    }

    fn regions(&self) -> Vec<MemoryRegionDesc> {
        vec![
            MemoryRegionDesc {
                kind: RegionKind::System,
                base: 0,
            },
            MemoryRegionDesc {
                kind: RegionKind::Lds,
                base: LDS_APERTURE_BASE,
            },
            MemoryRegionDesc {
                kind: RegionKind::Scratch,
                base: SCRATCH_APERTURE_BASE,
            },
        ]
    }

    fn system_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        // The mock has no way to alias pages; a doubled plain allocation stands in
        // for the allocator's double-map support.
        let real_size = if flags.contains(AllocFlags::DOUBLE_MAP) {
            size * 2
        } else {
            size
        };
        let layout = Layout::from_size_align(real_size, align).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.allocs.lock().unwrap().insert(ptr.as_ptr() as usize, layout);
        Some(ptr)
    }

    fn system_dealloc(&self, ptr: NonNull<u8>) {
        let layout = self
            .allocs
            .lock()
            .unwrap()
            .remove(&(ptr.as_ptr() as usize))
            .expect("dealloc of unknown pointer");
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }

    fn acquire_queue_scratch(&self, scratch: &mut ScratchInfo) {
        match *self.scratch_policy.lock().unwrap() {
            ScratchPolicy::Grant { base, large } => {
                scratch.queue_base = base;
                scratch.queue_process_offset = base;
                scratch.large = large;
                scratch.retry = false;
            }
            ScratchPolicy::Retry => {
                scratch.retry = true;
            }
            ScratchPolicy::Fail => {
                scratch.queue_base = 0;
                scratch.retry = false;
            }
        }
        self.acquires.lock().unwrap().push(scratch.clone());
    }

    fn release_queue_scratch(&self, _scratch: &mut ScratchInfo) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn gws_release(&self) {
        self.gws_releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Doorbell page that records every MMIO store in order.
#[derive(Default)]
pub struct RecordingDoorbell {
    pub writes32: Mutex<Vec<u32>>,
    pub writes64: Mutex<Vec<u64>>,
}

impl DoorbellMmio for RecordingDoorbell {
    fn store_u64(&self, value: u64) {
        self.writes64.lock().unwrap().push(value);
    }

    fn store_u32(&self, value: u32) {
        self.writes32.lock().unwrap().push(value);
    }
}

/// Everything the mock KMD learned about one created queue; doubles as the handle the
/// mock GPU uses to consume packets and post faults.
#[derive(Clone)]
pub struct AttachedQueue {
    pub queue_id: u64,
    pub ring: RingView,
    pub read_index: SharedIndex,
    pub write_index: SharedIndex,
    pub doorbell: Arc<RecordingDoorbell>,
}

pub struct MockKmd {
    supports_exceptions: bool,
    pub fail_create: AtomicBool,
    next_id: AtomicU64,
    pub created: Mutex<Vec<AttachedQueue>>,
    pub destroyed: Mutex<Vec<u64>>,
    /// `(queue_id, percent, priority)` per update call.
    pub updates: Mutex<Vec<(u64, u32, QueuePriority)>>,
    pub cu_masks: Mutex<Vec<(u64, Vec<u32>)>>,
    pub gws_allocs: Mutex<Vec<(u64, u32)>>,
}

impl MockKmd {
    pub fn new(supports_exceptions: bool) -> Arc<MockKmd> {
        Arc::new(MockKmd {
            supports_exceptions,
            fail_create: AtomicBool::new(false),
            next_id: AtomicU64::new(0x100),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            cu_masks: Mutex::new(Vec::new()),
            gws_allocs: Mutex::new(Vec::new()),
        })
    }

    pub fn last_attached(&self) -> AttachedQueue {
        self.created.lock().unwrap().last().expect("no queue attached").clone()
    }
}

impl KernelDriver for MockKmd {
    fn supports_exception_debugging(&self) -> bool {
        self.supports_exceptions
    }

    fn create_queue(&self, args: CreateQueueArgs) -> Result<CreatedQueue, QueueError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(QueueError::OutOfResources);
        }
        let queue_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let doorbell = Arc::new(RecordingDoorbell::default());
        self.created.lock().unwrap().push(AttachedQueue {
            queue_id,
            ring: args.ring,
            read_index: args.read_index,
            write_index: args.write_index,
            doorbell: Arc::clone(&doorbell),
        });
        Ok(CreatedQueue {
            queue_id,
            doorbell,
        })
    }

    fn destroy_queue(&self, queue_id: u64) -> Result<(), QueueError> {
        self.destroyed.lock().unwrap().push(queue_id);
        Ok(())
    }

    fn update_queue(
        &self,
        queue_id: u64,
        percent: u32,
        priority: QueuePriority,
    ) -> Result<(), QueueError> {
        self.updates.lock().unwrap().push((queue_id, percent, priority));
        Ok(())
    }

    fn set_queue_cu_mask(&self, queue_id: u64, mask: &[u32]) -> Result<(), QueueError> {
        self.cu_masks.lock().unwrap().push((queue_id, mask.to_vec()));
        Ok(())
    }

    fn alloc_queue_gws(&self, queue_id: u64, slots: u32) -> Result<u32, QueueError> {
        self.gws_allocs.lock().unwrap().push((queue_id, slots));
        Ok(0)
    }
}

/// A full mock stack plus an error-callback sink.
pub struct TestBench {
    pub agent: Arc<MockAgent>,
    pub kmd: Arc<MockKmd>,
    pub dispatcher: Arc<AsyncSignalDispatcher>,
    pub errors: Arc<Mutex<Vec<QueueError>>>,
}

impl TestBench {
    pub fn new(
        isa_major: u32,
        doorbell_type: u32,
        profile: Profile,
        supports_exceptions: bool,
    ) -> TestBench {
        TestBench {
            agent: MockAgent::new(isa_major, doorbell_type, profile),
            kmd: MockKmd::new(supports_exceptions),
            dispatcher: AsyncSignalDispatcher::spawn(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn create_queue(&self, packets: u32, config: QueueConfig) -> AqlQueue {
        self.try_create_queue(packets, config).expect("queue creation failed")
    }

    pub fn try_create_queue(
        &self,
        packets: u32,
        config: QueueConfig,
    ) -> Result<AqlQueue, QueueError> {
        let errors = Arc::clone(&self.errors);
        AqlQueue::create(
            Arc::clone(&self.agent) as Arc<dyn ComputeAgent>,
            Arc::clone(&self.kmd) as Arc<dyn KernelDriver>,
            Arc::clone(&self.dispatcher),
            packets,
            ScratchInfo::default(),
            Some(Box::new(move |error, _queue_id| {
                errors.lock().unwrap().push(error);
            })),
            config,
        )
    }

    pub fn reported_errors(&self) -> Vec<QueueError> {
        self.errors.lock().unwrap().clone()
    }
}

/// Spins until `pred` holds, panicking after a generous deadline.
pub fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

/// Publishes a kernel dispatch packet into the slot for `index`.
pub fn write_dispatch_packet(queue: &AqlQueue, index: u64, pkt: &KernelDispatchPacket) {
    let view = queue.ring_view();
    unsafe { view.packet(index) }.publish(&pkt.to_words());
}

/// Plays the GPU: waits for each slot to become valid, retires it, and advances the
/// read index.
pub fn consume_packets(attached: &AttachedQueue, count: u64) {
    for _ in 0..count {
        let index = attached.read_index.load(Ordering::Acquire);
        let slot = unsafe { attached.ring.packet(index) };
        wait_until("packet to become valid", || {
            slot.packet_type(Ordering::Acquire) != PacketType::Invalid as u8
        });
        slot.invalidate();
        attached.read_index.store(index + 1, Ordering::Release);
    }
}

/// A reference kernel dispatch: `private_segment_size = 256`, 64-lane workgroups over
/// a 4096-lane grid (the literal scratch-grow scenario).
pub fn scratch_test_dispatch() -> KernelDispatchPacket {
    KernelDispatchPacket {
        header: aql_queue::packet::header(
            PacketType::KernelDispatch,
            aql_queue::packet::FenceScope::None,
            aql_queue::packet::FenceScope::None,
            false,
        ),
        setup: 1,
        workgroup_size_x: 64,
        workgroup_size_y: 1,
        workgroup_size_z: 1,
        grid_size_x: 4096,
        grid_size_y: 1,
        grid_size_z: 1,
        private_segment_size: 256,
        ..Default::default()
    }
}
