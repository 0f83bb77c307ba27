//! Scratch sizing and SRD programming.
//!
//! When a dispatch faults for want of private memory the handler re-derives the
//! scratch footprint from the stalled packet ([`size_for_dispatch`]) and, once the
//! agent grants backing store, reprograms the shader's view of it
//! ([`update_scratch_srd`]): the four-dword buffer resource descriptor, the flat
//! scratch parameters, and the `COMPUTE_TMPRING_SIZE` wave limits.

use std::sync::atomic::Ordering;

use crate::agent::{AgentProperties, Profile, ScratchInfo};
use crate::packet::KernelDispatchPacket;
use crate::record::QueueRecord;
use crate::regs;

fn align_up_u32(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Recomputes the scratch sizing for the stalled dispatch.
///
/// `wave32` comes from the fault code (bit 0x400 set means 32-lane waves); `pkt` is
/// the kernel dispatch packet at the read index.
pub(crate) fn size_for_dispatch(
    scratch: &mut ScratchInfo,
    pkt: &KernelDispatchPacket,
    wave32: bool,
    props: &AgentProperties,
    max_cu_id: u32,
) {
    let max_scratch_slots = u64::from(max_cu_id + 1) * u64::from(props.max_slots_scratch_cu);

    scratch.lanes_per_wave = if wave32 { 32 } else { 64 };
    // Pad so a whole wave's scratch is a 1 KiB multiple.
    scratch.size_per_thread =
        align_up_u32(pkt.private_segment_size, 1024 / scratch.lanes_per_wave);
    // Worst-case provisioning: every scratch slot on the device active at once.
    scratch.size =
        u64::from(scratch.size_per_thread) * max_scratch_slots * u64::from(scratch.lanes_per_wave);

    let lanes_per_group = u64::from(pkt.workgroup_size_x)
        * u64::from(pkt.workgroup_size_y)
        * u64::from(pkt.workgroup_size_z);
    scratch.waves_per_group = ceil_div(lanes_per_group, u64::from(scratch.lanes_per_wave));

    let mut groups = ceil_div(u64::from(pkt.grid_size_x), u64::from(pkt.workgroup_size_x))
        * ceil_div(u64::from(pkt.grid_size_y), u64::from(pkt.workgroup_size_y))
        * ceil_div(u64::from(pkt.grid_size_z), u64::from(pkt.workgroup_size_z));
    // Assign an equal number of groups to each shader engine.
    let engines = u64::from(props.num_shader_banks);
    groups = ceil_div(groups, engines) * engines;

    scratch.wanted_slots = (groups * scratch.waves_per_group).min(max_scratch_slots);
    scratch.dispatch_size =
        u64::from(scratch.size_per_thread) * scratch.wanted_slots * u64::from(scratch.lanes_per_wave);
}

/// Programs the scratch buffer resource descriptor and wave limits into the record.
pub(crate) fn update_scratch_srd(
    record: &QueueRecord,
    scratch: &ScratchInfo,
    isa_major: u32,
    profile: Profile,
    props: &AgentProperties,
) {
    let base = scratch.queue_base;
    let srd0 = base as u32;

    let mut srd1 = ((base >> 32) as u32) & regs::SRD1_BASE_ADDRESS_HI_MASK;
    srd1 |= 1 << regs::SRD1_SWIZZLE_ENABLE_SHIFT; // STRIDE = 0, CACHE_SWIZZLE = 0

    let srd2 = scratch.size as u32;

    let srd3 = if isa_major < 10 {
        (regs::SQ_SEL_X << regs::SRD3_DST_SEL_X_SHIFT)
            | (regs::SQ_SEL_Y << regs::SRD3_DST_SEL_Y_SHIFT)
            | (regs::SQ_SEL_Z << regs::SRD3_DST_SEL_Z_SHIFT)
            | (regs::SQ_SEL_W << regs::SRD3_DST_SEL_W_SHIFT)
            | (regs::BUF_NUM_FORMAT_UINT << regs::SRD3_NUM_FORMAT_SHIFT)
            | (regs::BUF_DATA_FORMAT_32 << regs::SRD3_DATA_FORMAT_SHIFT)
            | (1 << regs::SRD3_ELEMENT_SIZE_SHIFT) // 4 bytes
            | (3 << regs::SRD3_INDEX_STRIDE_SHIFT) // 64
            | (1 << regs::SRD3_ADD_TID_ENABLE_SHIFT)
            | (u32::from(profile == Profile::Full) << regs::SRD3_ATC_SHIFT)
            | (regs::SQ_RSRC_BUF << regs::SRD3_TYPE_SHIFT)
    } else {
        (regs::SQ_SEL_X << regs::SRD3_DST_SEL_X_SHIFT)
            | (regs::SQ_SEL_Y << regs::SRD3_DST_SEL_Y_SHIFT)
            | (regs::SQ_SEL_Z << regs::SRD3_DST_SEL_Z_SHIFT)
            | (regs::SQ_SEL_W << regs::SRD3_DST_SEL_W_SHIFT)
            | (regs::BUF_FORMAT_32_UINT << regs::SRD3_GFX10_FORMAT_SHIFT)
            // INDEX_STRIDE is filled in by the CP.
            | (1 << regs::SRD3_GFX10_ADD_TID_ENABLE_SHIFT)
            | (1 << regs::SRD3_GFX10_RESOURCE_LEVEL_SHIFT)
            | (regs::OOB_SELECT_DISABLED_SWIZZLE << regs::SRD3_GFX10_OOB_SELECT_SHIFT)
            | (regs::SQ_RSRC_BUF << regs::SRD3_GFX10_TYPE_SHIFT)
    };

    for (word, value) in record
        .scratch_resource_descriptor
        .iter()
        .zip([srd0, srd1, srd2, srd3])
    {
        word.store(value, Ordering::Relaxed);
    }

    record
        .scratch_backing_memory_location
        .store(scratch.queue_process_offset, Ordering::Relaxed);
    record
        .scratch_backing_memory_byte_size
        .store(scratch.size, Ordering::Relaxed);
    // Compatibility field: per-lane bytes for a 64-lane wavefront. Scratch sized for
    // 32-lane waves reports half its per-lane footprint here.
    record.scratch_wave64_lane_byte_size.store(
        ((u64::from(scratch.size_per_thread) * u64::from(scratch.lanes_per_wave)) / 64) as u32,
        Ordering::Relaxed,
    );

    // Concurrent wavefront limits apply only while scratch is in use.
    if scratch.size == 0 {
        record.compute_tmpring_size.store(0, Ordering::Relaxed);
        return;
    }

    let num_cus = props.cu_count();
    let max_scratch_waves = num_cus * props.max_slots_scratch_cu;

    // WAVESIZE is in KiB granules.
    let wave_scratch =
        ((scratch.lanes_per_wave * scratch.size_per_thread) + 1023) / 1024;
    debug_assert!(
        !regs::tmpring_wavesize_overflows(wave_scratch),
        "WAVESIZE overflow"
    );
    let num_waves = (scratch.size / (u64::from(wave_scratch) * 1024)) as u32;
    record.compute_tmpring_size.store(
        regs::tmpring_size(num_waves.min(max_scratch_waves), wave_scratch),
        Ordering::Relaxed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    fn props() -> AgentProperties {
        AgentProperties {
            num_fcompute_cores: 64,
            num_simd_per_cu: 4,
            max_slots_scratch_cu: 32,
            num_shader_banks: 4,
            max_waves_per_simd: 10,
            doorbell_type: 2,
            is_kv: false,
        }
    }

    fn record() -> QueueRecord {
        QueueRecord::new(std::ptr::null_mut(), 64, Signal::new(0), 15, 39)
    }

    #[test]
    fn sizing_for_wave64_dispatch() {
        let p = props();
        let mut scratch = ScratchInfo::default();
        let pkt = KernelDispatchPacket {
            workgroup_size_x: 64,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            grid_size_x: 4096,
            grid_size_y: 1,
            grid_size_z: 1,
            private_segment_size: 256,
            ..Default::default()
        };
        size_for_dispatch(&mut scratch, &pkt, false, &p, 15);

        let max_slots = 16 * 32;
        assert_eq!(scratch.lanes_per_wave, 64);
        assert_eq!(scratch.size_per_thread, 256);
        assert_eq!(scratch.size, 256 * max_slots * 64);
        assert_eq!(scratch.waves_per_group, 1);
        // 64 groups, already a multiple of the 4 shader engines.
        assert_eq!(scratch.wanted_slots, 64);
        assert_eq!(scratch.dispatch_size, 256 * 64 * 64);
    }

    #[test]
    fn sizing_pads_waves_to_kib() {
        let p = props();
        let mut scratch = ScratchInfo::default();
        let pkt = KernelDispatchPacket {
            workgroup_size_x: 32,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            grid_size_x: 32,
            grid_size_y: 1,
            grid_size_z: 1,
            private_segment_size: 10,
            ..Default::default()
        };
        size_for_dispatch(&mut scratch, &pkt, true, &p, 15);

        assert_eq!(scratch.lanes_per_wave, 32);
        // 1024 / 32 lanes = 32-byte granules.
        assert_eq!(scratch.size_per_thread, 32);
        // One group of one wave, rounded up to all 4 engines.
        assert_eq!(scratch.wanted_slots, 4);
    }

    #[test]
    fn srd_word2_tracks_scratch_size() {
        let record = record();
        let p = props();
        let scratch = ScratchInfo {
            queue_base: 0x12_3456_7000,
            queue_process_offset: 0x8000,
            size: 0x100000,
            size_per_thread: 256,
            lanes_per_wave: 64,
            ..Default::default()
        };
        update_scratch_srd(&record, &scratch, 9, Profile::Base, &p);

        let srd: Vec<u32> = record
            .scratch_resource_descriptor
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        assert_eq!(srd[0], 0x3456_7000);
        assert_eq!(srd[1] & regs::SRD1_BASE_ADDRESS_HI_MASK, 0x12);
        assert_ne!(srd[1] & (1 << regs::SRD1_SWIZZLE_ENABLE_SHIFT), 0);
        assert_eq!(srd[2], 0x100000);
        // Pre-GFX10: ELEMENT_SIZE/INDEX_STRIDE are hardwired for scratch.
        assert_eq!((srd[3] >> regs::SRD3_ELEMENT_SIZE_SHIFT) & 0x3, 1);
        assert_eq!((srd[3] >> regs::SRD3_INDEX_STRIDE_SHIFT) & 0x3, 3);
        assert_eq!(
            record.scratch_backing_memory_location.load(Ordering::Relaxed),
            0x8000
        );
        assert_eq!(
            record.scratch_wave64_lane_byte_size.load(Ordering::Relaxed),
            256
        );
    }

    #[test]
    fn srd_word3_differs_for_gfx10() {
        let record = record();
        let p = props();
        let scratch = ScratchInfo {
            queue_base: 0x1000,
            size: 0x1000,
            size_per_thread: 64,
            lanes_per_wave: 32,
            ..Default::default()
        };
        update_scratch_srd(&record, &scratch, 10, Profile::Full, &p);
        let srd3 = record.scratch_resource_descriptor[3].load(Ordering::Relaxed);
        assert_eq!(
            (srd3 >> regs::SRD3_GFX10_FORMAT_SHIFT) & 0x7f,
            regs::BUF_FORMAT_32_UINT
        );
        assert_ne!(srd3 & (1 << regs::SRD3_GFX10_RESOURCE_LEVEL_SHIFT), 0);
        assert_eq!(
            (srd3 >> regs::SRD3_GFX10_OOB_SELECT_SHIFT) & 0x3,
            regs::OOB_SELECT_DISABLED_SWIZZLE
        );
    }

    #[test]
    fn zero_scratch_clears_tmpring() {
        let record = record();
        let p = props();
        update_scratch_srd(&record, &ScratchInfo::default(), 9, Profile::Base, &p);
        assert_eq!(record.compute_tmpring_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tmpring_waves_capped_by_device_slots() {
        let record = record();
        let p = props();
        let scratch = ScratchInfo {
            queue_base: 0x1000,
            size_per_thread: 256,
            lanes_per_wave: 64,
            size: 256 * 64 * (16 * 32),
            ..Default::default()
        };
        update_scratch_srd(&record, &scratch, 9, Profile::Base, &p);
        let tmpring = record.compute_tmpring_size.load(Ordering::Relaxed);
        let wavesize = (tmpring >> regs::TMPRING_WAVESIZE_SHIFT) & 0x1fff;
        let waves = tmpring & 0xfff;
        assert_eq!(wavesize, 16); // 64 lanes * 256 B = 16 KiB per wave
        assert_eq!(waves, 512); // 16 CUs * 32 slots
    }
}
