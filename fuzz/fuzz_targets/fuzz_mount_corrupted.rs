#![no_main]
use flashxlat::{FormatParams, MountOptions, RamFlash, Volume};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

const UNIT: u32 = 64 * 1024;

#[derive(Debug, Arbitrary)]
struct Poke {
    offset: u32,
    bytes: Vec<u8>,
}

// Corrupt a formatted, written image and make sure mount never panics
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let pokes: Vec<Poke> = match u.arbitrary() {
        Ok(pokes) => pokes,
        Err(_) => return,
    };

    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        ..FormatParams::default()
    };
    let flash = match Volume::format(RamFlash::with_blocks(UNIT, 4), &params) {
        Ok(flash) => flash,
        Err(_) => return,
    };
    let mut volume = match Volume::mount(flash, MountOptions::default()) {
        Ok(volume) => volume,
        Err(_) => return,
    };
    for sector in 0..48 {
        let _ = volume.write_sector(sector, &[sector as u8; 2048]);
    }
    let mut flash = volume.dismount();

    let size = 4 * UNIT;
    for poke in pokes.iter().take(16) {
        let offset = poke.offset % size;
        let len = poke.bytes.len().min((size - offset) as usize);
        flash.poke(offset, &poke.bytes[..len]);
    }

    if let Ok(mut volume) = Volume::mount(flash, MountOptions::default()) {
        for sector in 0..48 {
            let _ = volume.map_sector(sector);
        }
        let _ = volume.write_sector(7, &[0x5A; 2048]);
        let _ = volume.delete_sector(40, 8);
        let _ = volume.defragment(volume.free_sectors() + 1);
        volume.dismount();
    }
});
