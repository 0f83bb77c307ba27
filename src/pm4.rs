//! PM4 command encoding.
//!
//! Only the handful of packets the queue engine injects in-band with AQL are encoded
//! here: the INDIRECT_BUFFER jump into the shared IB, the RELEASE_MEM that retires the
//! borrowed AQL slot on GFX≤8, and the NOP used to pad the slot.

/// PM4 type-3 opcodes.
pub const IT_NOP: u32 = 0x10;
pub const IT_INDIRECT_BUFFER: u32 = 0x3f;
pub const IT_RELEASE_MEM: u32 = 0x49;

pub const RELEASE_MEM_EVENT_INDEX_AQL: u32 = 0x7;
pub const RELEASE_MEM_EVENT_INDEX_SHIFT: u32 = 8;

/// Dword count of an INDIRECT_BUFFER command.
pub const INDIRECT_BUFFER_SIZE_DW: usize = 4;
/// Dword count of a RELEASE_MEM command.
pub const RELEASE_MEM_SIZE_DW: usize = 7;

/// Builds a PM4 type-3 packet header.
///
/// GFX7 requires the compute shader-type bit; later generations ignore it.
pub const fn type3_header(opcode: u32, size_dw: u32, gfx_major: u32) -> u32 {
    let shader_type = if gfx_major == 7 { 1 } else { 0 };
    (3 << 30) | (((size_dw - 2) & 0x3fff) << 16) | ((opcode & 0xff) << 8) | (shader_type << 1)
}

/// Encodes an INDIRECT_BUFFER jump to `ib_addr` (`size_dw` dwords of commands).
///
/// The IB base must be dword aligned; the low address word carries bits 2..32.
pub fn indirect_buffer(ib_addr: u64, size_dw: u32, gfx_major: u32) -> [u32; INDIRECT_BUFFER_SIZE_DW] {
    debug_assert_eq!(ib_addr & 0x3, 0, "PM4 IB base must be dword aligned");
    [
        type3_header(IT_INDIRECT_BUFFER, INDIRECT_BUFFER_SIZE_DW as u32, gfx_major),
        (ib_addr as u32) & !0x3,
        (ib_addr >> 32) as u32,
        (size_dw & 0xf_ffff) | (1 << 23), // IB_SIZE | IB_VALID
    ]
}

/// Encodes the RELEASE_MEM that advances the AQL read index and invalidates the
/// packet header of the slot it lives in.
pub fn release_mem_aql(gfx_major: u32) -> [u32; RELEASE_MEM_SIZE_DW] {
    let mut cmd = [0u32; RELEASE_MEM_SIZE_DW];
    cmd[0] = type3_header(IT_RELEASE_MEM, RELEASE_MEM_SIZE_DW as u32, gfx_major);
    cmd[1] = RELEASE_MEM_EVENT_INDEX_AQL << RELEASE_MEM_EVENT_INDEX_SHIFT;
    cmd
}

/// Encodes a NOP header padding `size_dw` dwords (header included).
pub const fn nop_header(size_dw: u32, gfx_major: u32) -> u32 {
    type3_header(IT_NOP, size_dw, gfx_major)
}
