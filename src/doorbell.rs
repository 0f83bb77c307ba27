//! Doorbell submission paths.
//!
//! Three hardware generations, three doorbell semantics. The native AQL doorbell takes
//! the 64-bit packet index directly. The two legacy variants share a software proxy
//! (`max_legacy_doorbell_dispatch_id_plus_1`) guarded by a per-queue spinlock, which is
//! what enforces the two hard invariants: values delivered to MMIO never regress, and
//! never run more than one ring ahead of the read index.

use std::sync::atomic::Ordering;
use std::thread;

use crate::kmd::DoorbellMmio;
use crate::packet::PACKET_DWORDS;
use crate::record::QueueRecord;

/// Doorbell semantics, keyed off the agent's doorbell capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellKind {
    /// GFX7: the doorbell takes a ring offset in dwords.
    LegacyGfx7Dw,
    /// Legacy 64-bit packet index delivered as a 32-bit store.
    Legacy64,
    /// Native AQL semantics: 64-bit packet index stored directly.
    NativeAql,
}

impl DoorbellKind {
    pub fn from_raw(raw: u32) -> Option<DoorbellKind> {
        match raw {
            0 => Some(DoorbellKind::LegacyGfx7Dw),
            1 => Some(DoorbellKind::Legacy64),
            2 => Some(DoorbellKind::NativeAql),
            _ => None,
        }
    }
}

/// Delivers a doorbell value, relaxed with respect to prior packet writes.
///
/// Callers that need the packet payload ordered before the doorbell use
/// [`ring_doorbell_release`].
pub(crate) fn ring_doorbell_relaxed(
    record: &QueueRecord,
    mmio: &dyn DoorbellMmio,
    kind: DoorbellKind,
    queue_full_workaround: bool,
    value: i64,
) {
    if kind == DoorbellKind::NativeAql {
        // Hardware write pointer supports AQL semantics directly.
        mmio.store_u64(value as u64);
        return;
    }

    // Serialize legacy doorbell submissions.
    while record
        .legacy_doorbell_lock
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        thread::yield_now();
    }

    // Hardware convention: the doorbell carries the index one past the last packet to
    // process.
    let mut dispatch_id = (value as u64).wrapping_add(1);

    // The write index may run more than a full ring beyond the read index; the
    // hardware can absorb at most one ring of packets. Clamp — the suppressed packets
    // are guaranteed a later doorbell.
    let ring_size = u64::from(record.size());
    dispatch_id = dispatch_id.min(record.read_dispatch_id.load(Ordering::Relaxed) + ring_size);

    // Discard backward and duplicate doorbells.
    if dispatch_id
        > record
            .max_legacy_doorbell_dispatch_id_plus_1
            .load(Ordering::Relaxed)
    {
        // Publish the proxy before the MMIO write: the proxy is what the hardware
        // reads back as the write index on queue connect.
        record
            .max_legacy_doorbell_dispatch_id_plus_1
            .store(dispatch_id, Ordering::Release);

        match kind {
            DoorbellKind::LegacyGfx7Dw => {
                // GFX7 expects the index wrapped into the (possibly doubled) ring and
                // converted to a dword count.
                let factor = if queue_full_workaround { 2 } else { 1 };
                let mask = factor * ring_size - 1;
                mmio.store_u32(((dispatch_id & mask) * PACKET_DWORDS as u64) as u32);
            }
            DoorbellKind::Legacy64 => {
                mmio.store_u32(dispatch_id as u32);
            }
            DoorbellKind::NativeAql => unreachable!(),
        }
    }

    // Releasing the lock also flushes the (write-combined) doorbell promptly.
    record.legacy_doorbell_lock.store(0, Ordering::Release);
}

/// Delivers a doorbell value ordered after every prior packet write.
pub(crate) fn ring_doorbell_release(
    record: &QueueRecord,
    mmio: &dyn DoorbellMmio,
    kind: DoorbellKind,
    queue_full_workaround: bool,
    value: i64,
) {
    std::sync::atomic::fence(Ordering::Release);
    ring_doorbell_relaxed(record, mmio, kind, queue_full_workaround, value);
}
