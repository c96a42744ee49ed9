#![no_main]
use flashxlat::{FormatParams, MountOptions, RamFlash, Volume, VolumeStatus};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
enum SectorOp {
    Write { sector: u8, fill: u8 },
    Delete { first: u8, count: u8 },
    Step,
    Collect,
}

// Random operations with a power cut somewhere in the middle; the volume
// must remount cleanly and never program a 0 bit back to 1
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let cut: u16 = match u.arbitrary() {
        Ok(cut) => cut,
        Err(_) => return,
    };
    let ops: Vec<SectorOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        ..FormatParams::default()
    };
    let mut flash = match Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params) {
        Ok(flash) => flash,
        Err(_) => return,
    };
    flash.power_cut_after(cut as usize);

    let options = MountOptions {
        rng_seed: Some(0),
        ..MountOptions::default()
    };
    let mut volume = match Volume::mount(flash, options.clone()) {
        Ok(volume) => volume,
        Err(_) => return,
    };
    for op in ops.iter().take(256) {
        let _ = match *op {
            SectorOp::Write { sector, fill } => {
                volume.write_sector(sector as u32 % 48, &[fill; 2048])
            }
            SectorOp::Delete { first, count } => {
                volume.delete_sector(first as u32 % 48, count as u32 % 4)
            }
            SectorOp::Step => volume.run_background_step().map(|_| ()),
            SectorOp::Collect => {
                volume.schedule_background_collect();
                Ok(())
            }
        };
    }
    assert_eq!(volume.media().bit_violations(), 0);

    let mut flash = volume.dismount();
    flash.restore_power();
    let volume = Volume::mount(flash, options).expect("remount after power cut");
    assert_eq!(volume.status(), VolumeStatus::Mounted);
    assert_eq!(volume.media().bit_violations(), 0);
});
