//! AQL packet layout and header bit positions.
//!
//! Every ring slot is a 64-byte packet whose first dword doubles as the concurrency
//! control point: producers fill the payload (dwords 1..16) first and then publish the
//! header dword with release ordering, so a consumer that observes a non-INVALID type
//! also observes the complete payload.

use std::sync::atomic::{AtomicU32, Ordering};

/// Size of one AQL packet slot in bytes.
pub const PACKET_BYTES: usize = 64;
/// Size of one AQL packet slot in dwords.
pub const PACKET_DWORDS: usize = PACKET_BYTES / 4;

// Packet header bit positions (16-bit header).
pub const HEADER_TYPE_SHIFT: u32 = 0;
pub const HEADER_TYPE_WIDTH: u32 = 8;
pub const HEADER_BARRIER_SHIFT: u32 = 8;
pub const HEADER_SCACQUIRE_SCOPE_SHIFT: u32 = 9;
pub const HEADER_SCACQUIRE_SCOPE_WIDTH: u32 = 2;
pub const HEADER_SCRELEASE_SCOPE_SHIFT: u32 = 11;
pub const HEADER_SCRELEASE_SCOPE_WIDTH: u32 = 2;

/// AQL packet types (header `TYPE` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    VendorSpecific = 0,
    Invalid = 1,
    KernelDispatch = 2,
    BarrierAnd = 3,
    AgentDispatch = 4,
    BarrierOr = 5,
}

/// Memory fence scopes encoded in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FenceScope {
    None = 0,
    Agent = 1,
    System = 2,
}

/// Vendor-specific packet subtype carrying an embedded PM4 indirect-buffer jump.
pub const VENDOR_FORMAT_PM4_IB: u16 = 0x1;

/// Builds a 16-bit packet header.
pub fn header(ty: PacketType, scacquire: FenceScope, screlease: FenceScope, barrier: bool) -> u16 {
    ((ty as u16) << HEADER_TYPE_SHIFT)
        | ((barrier as u16) << HEADER_BARRIER_SHIFT)
        | ((scacquire as u16) << HEADER_SCACQUIRE_SCOPE_SHIFT)
        | ((screlease as u16) << HEADER_SCRELEASE_SCOPE_SHIFT)
}

/// Extracts the packet type from a header dword (header in the low 16 bits).
pub fn packet_type(header_dword: u32) -> u8 {
    ((header_dword >> HEADER_TYPE_SHIFT) & ((1 << HEADER_TYPE_WIDTH) - 1)) as u8
}

/// One ring slot, shared with the GPU.
///
/// The slot is stored as atomic dwords because producer, consumer, and the scratch
/// fault handler all touch it from different threads of control: payload dwords are
/// written relaxed, the header dword is the release/acquire point.
#[repr(C, align(64))]
pub struct AqlPacket {
    words: [AtomicU32; PACKET_DWORDS],
}

impl AqlPacket {
    /// The header dword. This is the only dword both sides race on.
    pub fn header_dword(&self) -> &AtomicU32 {
        &self.words[0]
    }

    pub fn packet_type(&self, order: Ordering) -> u8 {
        packet_type(self.header_dword().load(order))
    }

    /// Marks the slot invalid without touching the payload.
    pub fn invalidate(&self) {
        self.header_dword()
            .store(PacketType::Invalid as u32, Ordering::Release);
    }

    /// Publishes a fully built packet into this slot.
    ///
    /// Copies dwords 1..16 first, then release-stores dword 0 so the header transition
    /// from INVALID to a valid type is the last thing the consumer can observe.
    pub fn publish(&self, data: &[u32; PACKET_DWORDS]) {
        for (slot, word) in self.words.iter().zip(data.iter()).skip(1) {
            slot.store(*word, Ordering::Relaxed);
        }
        self.header_dword().store(data[0], Ordering::Release);
    }

    /// Snapshot of the whole slot (header dword loaded with acquire ordering first).
    pub fn read_words(&self) -> [u32; PACKET_DWORDS] {
        let mut out = [0u32; PACKET_DWORDS];
        out[0] = self.words[0].load(Ordering::Acquire);
        for (dst, src) in out.iter_mut().zip(self.words.iter()).skip(1) {
            *dst = src.load(Ordering::Relaxed);
        }
        out
    }

    /// Snapshot of the slot decoded as a kernel dispatch packet.
    ///
    /// Only meaningful when the header type was observed as `KernelDispatch`.
    pub fn dispatch_snapshot(&self) -> KernelDispatchPacket {
        KernelDispatchPacket::from_words(self.read_words())
    }

    /// Rewrites the 16-bit packet header in place, leaving `setup` untouched.
    ///
    /// Used by the scratch fault handler to patch the fence scope of a stalled
    /// dispatch while the GPU is parked on it.
    pub fn patch_header(&self, f: impl FnOnce(u16) -> u16) {
        let dword = self.words[0].load(Ordering::Relaxed);
        let patched = (dword & 0xffff_0000) | u32::from(f(dword as u16));
        self.words[0].store(patched, Ordering::Release);
    }
}

/// Kernel dispatch packet payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl KernelDispatchPacket {
    /// The packet as raw slot dwords, ready for [`AqlPacket::publish`].
    pub fn to_words(&self) -> [u32; PACKET_DWORDS] {
        // repr(C) with no interior padding; total size is exactly one slot.
        unsafe { std::mem::transmute(*self) }
    }

    pub fn from_words(words: [u32; PACKET_DWORDS]) -> Self {
        unsafe { std::mem::transmute(words) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_type_and_scopes() {
        let h = header(
            PacketType::KernelDispatch,
            FenceScope::Agent,
            FenceScope::System,
            true,
        );
        assert_eq!(h & 0xff, PacketType::KernelDispatch as u16);
        assert_eq!((h >> HEADER_BARRIER_SHIFT) & 1, 1);
        assert_eq!((h >> HEADER_SCACQUIRE_SCOPE_SHIFT) & 0x3, FenceScope::Agent as u16);
        assert_eq!((h >> HEADER_SCRELEASE_SCOPE_SHIFT) & 0x3, FenceScope::System as u16);
    }

    #[test]
    fn dispatch_packet_is_one_slot() {
        assert_eq!(std::mem::size_of::<KernelDispatchPacket>(), PACKET_BYTES);
        assert_eq!(std::mem::size_of::<AqlPacket>(), PACKET_BYTES);
    }

    #[test]
    fn publish_round_trips_through_slot() {
        let slot: AqlPacket = unsafe { std::mem::zeroed() };
        slot.invalidate();
        assert_eq!(slot.packet_type(Ordering::Acquire), PacketType::Invalid as u8);

        let pkt = KernelDispatchPacket {
            header: header(
                PacketType::KernelDispatch,
                FenceScope::None,
                FenceScope::None,
                false,
            ),
            workgroup_size_x: 64,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            grid_size_x: 4096,
            grid_size_y: 1,
            grid_size_z: 1,
            private_segment_size: 256,
            ..Default::default()
        };
        slot.publish(&pkt.to_words());

        assert_eq!(slot.packet_type(Ordering::Acquire), PacketType::KernelDispatch as u8);
        assert_eq!(slot.dispatch_snapshot(), pkt);
    }

    #[test]
    fn patch_header_preserves_setup_field() {
        let slot: AqlPacket = unsafe { std::mem::zeroed() };
        let mut pkt = KernelDispatchPacket::default();
        pkt.header = header(
            PacketType::KernelDispatch,
            FenceScope::Agent,
            FenceScope::Agent,
            false,
        );
        pkt.setup = 3;
        slot.publish(&pkt.to_words());

        slot.patch_header(|h| {
            let cleared = h & !(((1 << HEADER_SCRELEASE_SCOPE_WIDTH) - 1) << HEADER_SCRELEASE_SCOPE_SHIFT);
            cleared | ((FenceScope::System as u16) << HEADER_SCRELEASE_SCOPE_SHIFT)
        });

        let snap = slot.dispatch_snapshot();
        assert_eq!(snap.setup, 3);
        assert_eq!(
            (snap.header >> HEADER_SCRELEASE_SCOPE_SHIFT) & 0x3,
            FenceScope::System as u16
        );
    }
}
