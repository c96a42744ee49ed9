//! End-to-end volume scenarios
//!
//! Format, mount, fill, overwrite until the collector has recycled every
//! unit several times, then remount and check that nothing moved.

use flashxlat::{FlashMedia, FormatParams, FtlError, MountOptions, RamFlash, Volume, VolumeStatus};

fn options() -> MountOptions {
    MountOptions {
        wear_leveling_ratio: 0,
        rng_seed: Some(1),
        ..MountOptions::default()
    }
}

/// Sector content that is never a bit-clear rewrite of the previous version
fn pattern(sector: u32, version: u32, size: usize) -> Vec<u8> {
    let fill = if version % 2 == 0 { 0xA5 } else { 0x5A };
    let mut data = vec![fill; size];
    data[0..4].copy_from_slice(&sector.to_le_bytes());
    data[4..8].copy_from_slice(&version.to_le_bytes());
    data
}

fn verify<M: FlashMedia>(volume: &mut Volume<M>, versions: &[u32]) {
    let size = volume.sector_size() as usize;
    for (sector, &version) in versions.iter().enumerate() {
        let sector = sector as u32;
        let data = volume.map_sector(sector).unwrap();
        assert_eq!(data, &pattern(sector, version, size)[..], "sector {}", sector);
    }
}

#[test]
fn test_exact_geometry_capacity() {
    let params = FormatParams {
        log2_sector_size: 12,
        percent_use: 100,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let volume = Volume::mount(flash, options()).unwrap();

    // 3 logical units of 15 data slots, minus one map page and three reserved
    assert_eq!(volume.sectors_in_volume(), 41);
    assert_eq!(volume.sector_size(), 4096);
    assert_eq!(volume.free_sectors(), 45);
    assert_eq!(volume.spare_units(), 1);
    assert_eq!(volume.status(), VolumeStatus::Mounted);
}

#[test]
fn test_overwrite_cycles_with_direct_table() {
    let params = FormatParams {
        log2_sector_size: 12,
        percent_use: 100,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    let count = volume.sectors_in_volume();
    let size = volume.sector_size() as usize;

    let mut versions = vec![0u32; count as usize];
    for round in 0..6 {
        for sector in 0..count {
            versions[sector as usize] = round;
            volume
                .write_sector(sector, &pattern(sector, round, size))
                .unwrap();
        }
        verify(&mut volume, &versions);
    }

    let stats = volume.stats();
    assert!(stats.transfers > 0);
    assert_eq!(volume.spare_units(), 1);
    assert_eq!(volume.media().bit_violations(), 0);

    let flash = volume.dismount();
    let mut volume = Volume::mount(flash, options()).unwrap();
    verify(&mut volume, &versions);

    let remounted = volume.stats();
    assert_eq!(remounted.free_sectors, stats.free_sectors);
    assert_eq!(remounted.garbage_sectors, stats.garbage_sectors);
}

#[test]
fn test_overwrite_cycles_through_map_pages() {
    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.geometry().map_pages, 1);
    assert_eq!(volume.geometry().direct_sectors, 4);

    let size = volume.sector_size() as usize;
    let mut versions = vec![0u32; 48];
    for sector in 0..48 {
        volume.write_sector(sector, &pattern(sector, 0, size)).unwrap();
    }

    // Interleaved rewrites keep opening and merging the replacement page
    for round in 1..5 {
        for sector in (0..48).rev().step_by(3).chain((0..48).step_by(2)) {
            versions[sector as usize] = round;
            volume
                .write_sector(sector, &pattern(sector, round, size))
                .unwrap();
        }
        verify(&mut volume, &versions);
    }

    let stats = volume.stats();
    assert!(stats.transfers > 0);
    assert!(stats.map_cache_hits > 0);
    assert_eq!(volume.spare_units(), 1);
    assert_eq!(volume.media().bit_violations(), 0);

    let flash = volume.dismount();
    let mut volume = Volume::mount(flash, options()).unwrap();
    verify(&mut volume, &versions);
    assert!(!volume.stats().replacement_open);
}

#[test]
fn test_overwrite_cycles_with_two_spares() {
    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        spare_units: 2,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 5), &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.spare_units(), 2);
    assert_eq!(volume.geometry().logical_units, 3);

    let size = volume.sector_size() as usize;
    let mut versions = vec![0u32; 48];
    for round in 0..6 {
        for sector in 0..48 {
            versions[sector as usize] = round;
            volume
                .write_sector(sector, &pattern(sector, round, size))
                .unwrap();
        }
        verify(&mut volume, &versions);
        assert_eq!(volume.spare_units(), 2);
    }

    assert!(volume.stats().transfers > 0);
    assert_eq!(volume.media().bit_violations(), 0);

    let flash = volume.dismount();
    let mut volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.spare_units(), 2);
    verify(&mut volume, &versions);
}

#[test]
fn test_no_spares_write_protects_when_full() {
    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        spare_units: 0,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.spare_units(), 0);

    let size = volume.sector_size() as usize;
    let mut versions = vec![0u32; 48];
    for sector in 0..48 {
        volume.write_sector(sector, &pattern(sector, 0, size)).unwrap();
    }

    // Direct sectors only, so nothing but data slots is consumed
    let mut refused = None;
    for round in 1..200u32 {
        let sector = round % 3;
        let version = versions[sector as usize] + 1;
        match volume.write_sector(sector, &pattern(sector, version, size)) {
            Ok(()) => versions[sector as usize] = version,
            Err(e) => {
                refused = Some(e);
                break;
            }
        }
    }

    assert!(matches!(refused, Some(FtlError::WriteProtect)));
    assert_eq!(volume.free_sectors(), 0);
    assert_eq!(volume.stats().transfers, 0);
    verify(&mut volume, &versions);

    let flash = volume.dismount();
    let mut volume = Volume::mount(flash, options()).unwrap();
    verify(&mut volume, &versions);
}

#[test]
fn test_in_place_rewrite_allocates_nothing() {
    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        direct_addressing_memory: 16,
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();

    let mut data = vec![0xFF; 2048];
    data[0] = 0xF0;
    volume.write_sector(20, &data).unwrap();
    let free = volume.free_sectors();

    // Only clears bits, so it lands on the same slot
    data[1000] = 0x0F;
    volume.write_sector(20, &data).unwrap();
    assert_eq!(volume.free_sectors(), free);
    assert_eq!(volume.stats().garbage_sectors, 0);
    assert_eq!(volume.map_sector(20).unwrap(), &data[..]);
}

#[test]
fn test_unwritten_sector_not_found() {
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &FormatParams::default())
        .unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    let count = volume.sectors_in_volume();

    assert!(matches!(
        volume.map_sector(0),
        Err(FtlError::SectorNotFound(0))
    ));
    assert!(matches!(
        volume.map_sector(count),
        Err(FtlError::SectorNotFound(_))
    ));
    assert!(matches!(
        volume.write_sector(count, &vec![0; 512]),
        Err(FtlError::SectorNotFound(_))
    ));
    assert!(matches!(
        volume.write_sector(0, &[0; 100]),
        Err(FtlError::InvalidParameter(_))
    ));
}

#[test]
fn test_format_rejects_impossible_layouts() {
    let too_big = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(91),
        ..FormatParams::default()
    };
    assert!(matches!(
        Volume::format(RamFlash::with_blocks(64 * 1024, 4), &too_big),
        Err(FtlError::InvalidParameter(_))
    ));

    let all_spares = FormatParams {
        spare_units: 4,
        ..FormatParams::default()
    };
    assert!(matches!(
        Volume::format(RamFlash::with_blocks(64 * 1024, 4), &all_spares),
        Err(FtlError::InvalidParameter(_))
    ));
}

#[test]
fn test_boot_area_is_left_alone() {
    let mut flash = RamFlash::with_blocks(64 * 1024, 5);
    flash.write(0, b"bootloader", false).unwrap();

    let params = FormatParams {
        boot_image_len: 1000,
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        ..FormatParams::default()
    };
    let flash = Volume::format(flash, &params).unwrap();
    let mut volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.geometry().first_physical_unit, 1);

    volume.write_sector(1, &pattern(1, 0, 2048)).unwrap();
    let flash = volume.dismount();
    assert_eq!(&flash.image()[..10], b"bootloader");
}

#[test]
fn test_reformat_carries_wear_forward() {
    let params = FormatParams {
        log2_sector_size: 11,
        virtual_sectors: Some(48),
        ..FormatParams::default()
    };
    let flash = Volume::format(RamFlash::with_blocks(64 * 1024, 4), &params).unwrap();
    let volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.stats().max_wear, 1);

    let flash = Volume::format(volume.dismount(), &params).unwrap();
    let volume = Volume::mount(flash, options()).unwrap();
    assert_eq!(volume.stats().max_wear, 2);
}
