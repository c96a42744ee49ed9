//! File-backed flash image tests

use flashxlat::{FileFlash, FlashGeometry, FlashMedia, FormatParams, FtlError, MountOptions, Volume};
use tempfile::TempDir;

const UNIT: u32 = 64 * 1024;

fn geometry() -> FlashGeometry {
    FlashGeometry {
        chip_count: 1,
        chip_size: 4 * UNIT,
        erase_block_size: UNIT,
    }
}

fn params() -> FormatParams {
    FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        ..FormatParams::default()
    }
}

fn sector(index: u32, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; 2048];
    data[0..4].copy_from_slice(&index.to_le_bytes());
    data
}

#[test]
fn test_image_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nor.img");

    let flash = FileFlash::create(&path, geometry()).unwrap();
    let flash = Volume::format(flash, &params()).unwrap();
    let mut volume = Volume::mount(flash, MountOptions::default()).unwrap();

    for round in 0..3u8 {
        let fill = if round % 2 == 0 { 0xC3 } else { 0x3C };
        for index in 0..48 {
            volume.write_sector(index, &sector(index, fill)).unwrap();
        }
    }
    volume.delete_sector(47, 1).unwrap();
    let stats = volume.stats();
    assert!(stats.transfers > 0);

    let flash = volume.dismount();
    flash.sync().unwrap();
    drop(flash);

    let flash = FileFlash::open(&path, geometry()).unwrap();
    let mut volume = Volume::mount(flash, MountOptions::default()).unwrap();
    for index in 0..47 {
        assert_eq!(
            volume.map_sector(index).unwrap(),
            &sector(index, 0xC3)[..],
            "sector {}",
            index
        );
    }
    assert!(matches!(
        volume.map_sector(47),
        Err(FtlError::SectorNotFound(47))
    ));
    assert_eq!(volume.stats().max_wear, stats.max_wear);
}

#[test]
fn test_created_image_is_erased() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blank.img");

    let mut flash = FileFlash::create(&path, geometry()).unwrap();
    let mut buf = vec![0u8; 4096];
    flash.read(3 * UNIT, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * UNIT as u64);

    // Nothing formatted yet
    assert!(matches!(
        Volume::mount(flash, MountOptions::default()),
        Err(FtlError::BadFormat)
    ));
}

#[test]
fn test_open_rejects_wrong_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.img");
    std::fs::write(&path, vec![0xFF; UNIT as usize]).unwrap();

    assert!(matches!(
        FileFlash::open(&path, geometry()),
        Err(FtlError::InvalidParameter(_))
    ));
}
