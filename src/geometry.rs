//! Volume geometry and address arithmetic
//!
//! Three address spaces meet here:
//!
//! - **virtual sectors**: what the caller sees, offset internally by the map
//!   pages, which occupy internal sectors `0..map_pages`
//! - **logical addresses**: `(logical_unit << unit_bits) | (sector << sector_bits)`
//! - **physical addresses**: byte offsets on the media

use crate::error::{FtlError, Result};
use crate::header::UnitHeader;
use crate::media::FlashGeometry;

/// Erase units are never smaller than this, whatever the media erases.
pub const MIN_UNIT_SIZE: u32 = 64 * 1024;

/// Logical address of a sector that was never written
pub const UNASSIGNED_ADDRESS: u32 = 0xFFFF_FFFF;

/// Logical address of a trimmed sector. Sector 0 of every unit holds the
/// header, so address 0 never names data.
pub const DELETED_ADDRESS: u32 = 0;

pub fn is_mapped_address(address: u32) -> bool {
    address != UNASSIGNED_ADDRESS && address != DELETED_ADDRESS
}

/// Erase unit size for a given media: the erase block, but at least 64 KiB
pub fn unit_size_for(flash: &FlashGeometry) -> Result<u32> {
    if flash.erase_block_size == 0 || !flash.erase_block_size.is_power_of_two() {
        return Err(FtlError::InvalidParameter(format!(
            "erase block size {} is not a power of two",
            flash.erase_block_size
        )));
    }
    Ok(flash.erase_block_size.max(MIN_UNIT_SIZE))
}

/// Number of map pages needed so that pages `0..n` plus `virtual_sectors`
/// caller sectors are all covered by some map page.
pub fn map_pages_for(virtual_sectors: u32, entries_per_page: u32) -> u32 {
    let mut pages = virtual_sectors.div_ceil(entries_per_page);
    while (virtual_sectors + pages).div_ceil(entries_per_page) > pages {
        pages += 1;
    }
    pages
}

/// Sectors reached through the direct page table: whatever the memory budget
/// allows, never fewer than the map pages themselves.
pub fn direct_sectors_for(memory: u32, map_pages: u32, internal_sectors: u32) -> u32 {
    (memory / 4).max(map_pages).min(internal_sectors)
}

/// Sectors at the start of each unit taken by the header and BAT
pub fn format_sectors_for(bat_offset: u32, sectors_per_unit: u32, sector_bits: u8) -> u32 {
    let bytes = bat_offset + sectors_per_unit * crate::bat::BAT_ENTRY_SIZE as u32;
    bytes.div_ceil(1 << sector_bits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub sector_bits: u8,
    pub unit_bits: u8,
    pub sectors_per_unit: u32,
    pub format_sectors: u32,
    pub bat_offset: u32,
    pub first_physical_unit: u32,
    pub unit_count: u32,
    pub transfer_units: u32,
    pub logical_units: u32,
    pub virtual_sectors: u32,
    pub map_pages: u32,
    pub direct_sectors: u32,
    pub erase_block_size: u32,
    pub chip_size: u32,
}

impl VolumeGeometry {
    /// Derive the full geometry from a validated unit header
    pub fn from_header(header: &UnitHeader, flash: &FlashGeometry) -> Result<Self> {
        let sector_bits = header.log2_sector_size;
        let unit_bits = header.log2_unit_size;
        let sectors_per_unit = 1u32 << (unit_bits - sector_bits);
        let entries_per_page = (1u32 << sector_bits) / 4;
        let unit_count = header.unit_count as u32;
        let transfer_units = header.transfer_units as u32;
        let virtual_sectors = header.virtual_medium_size >> sector_bits;
        let map_pages = header.map_pages as u32;
        let format_sectors = format_sectors_for(header.bat_offset, sectors_per_unit, sector_bits);
        let internal_sectors = virtual_sectors + map_pages;

        let geometry = VolumeGeometry {
            sector_bits,
            unit_bits,
            sectors_per_unit,
            format_sectors,
            bat_offset: header.bat_offset,
            first_physical_unit: header.first_physical_unit as u32,
            unit_count,
            transfer_units,
            logical_units: unit_count - transfer_units,
            virtual_sectors,
            map_pages,
            direct_sectors: direct_sectors_for(
                header.direct_addressing_memory,
                map_pages,
                internal_sectors,
            ),
            erase_block_size: flash.erase_block_size,
            chip_size: flash.chip_size,
        };

        geometry.validate(flash, entries_per_page)?;
        Ok(geometry)
    }

    fn validate(&self, flash: &FlashGeometry, entries_per_page: u32) -> Result<()> {
        if (1u64 << self.unit_bits) != unit_size_for(flash)? as u64 {
            return Err(FtlError::BadFormat);
        }

        let physical_units = flash.total_size() >> self.unit_bits;
        if (self.first_physical_unit + self.unit_count) as u64 > physical_units {
            return Err(FtlError::BadFormat);
        }

        if self.format_sectors >= self.sectors_per_unit {
            return Err(FtlError::BadFormat);
        }

        if self.map_pages != map_pages_for(self.virtual_sectors, entries_per_page) {
            return Err(FtlError::BadFormat);
        }

        // Payloads must fit above the status bits of a BAT entry
        let max_payload = u32::MAX >> self.sector_bits;
        if self.internal_sectors() > max_payload {
            return Err(FtlError::BadFormat);
        }

        if self.logical_units >= crate::header::MARKED_FOR_ERASE as u32 {
            return Err(FtlError::BadFormat);
        }

        if self.logical_units == 0 {
            return Err(FtlError::BadFormat);
        }

        Ok(())
    }

    pub fn sector_size(&self) -> u32 {
        1 << self.sector_bits
    }

    pub fn unit_size(&self) -> u32 {
        1 << self.unit_bits
    }

    pub fn entries_per_page(&self) -> u32 {
        self.sector_size() / 4
    }

    /// Map pages plus caller sectors
    pub fn internal_sectors(&self) -> u32 {
        self.virtual_sectors + self.map_pages
    }

    pub fn data_sectors_per_unit(&self) -> u32 {
        self.sectors_per_unit - self.format_sectors
    }

    pub fn blocks_per_unit(&self) -> u32 {
        self.unit_size() / self.erase_block_size
    }

    /// Whether map page `page` covers any sector outside the direct table
    pub fn page_needed(&self, page: u32) -> bool {
        let epp = self.entries_per_page();
        let start = (page * epp).max(self.direct_sectors);
        let end = ((page + 1) * epp).min(self.internal_sectors());
        start < end
    }

    pub fn logical_address(&self, logical_unit: u32, sector: u32) -> u32 {
        (logical_unit << self.unit_bits) | (sector << self.sector_bits)
    }

    pub fn unit_of(&self, address: u32) -> u32 {
        address >> self.unit_bits
    }

    pub fn sector_of(&self, address: u32) -> u32 {
        (address & (self.unit_size() - 1)) >> self.sector_bits
    }

    pub fn offset_in_unit(&self, address: u32) -> u32 {
        address & (self.unit_size() - 1)
    }

    /// Physical byte address of volume unit `index`
    pub fn unit_base(&self, index: u32) -> u32 {
        (self.first_physical_unit + index) << self.unit_bits
    }

    /// Offset within a unit of the BAT entry for `sector`
    pub fn bat_entry_offset(&self, sector: u32) -> u32 {
        self.bat_offset + sector * crate::bat::BAT_ENTRY_SIZE as u32
    }

    /// Logical address of the BAT entry describing the sector at `address`
    pub fn bat_entry_address(&self, address: u32) -> u32 {
        (address & !(self.unit_size() - 1)) | self.bat_entry_offset(self.sector_of(address))
    }

    pub fn bat_len(&self) -> usize {
        self.sectors_per_unit as usize * crate::bat::BAT_ENTRY_SIZE
    }

    pub fn chip_of(&self, physical: u32) -> u32 {
        if self.chip_size == 0 {
            0
        } else {
            physical / self.chip_size
        }
    }

    /// First erase block of volume unit `index`
    pub fn first_block_of(&self, index: u32) -> u32 {
        self.unit_base(index) / self.erase_block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SIGNATURE;

    fn flash() -> FlashGeometry {
        FlashGeometry {
            chip_count: 1,
            chip_size: 4 * 64 * 1024,
            erase_block_size: 64 * 1024,
        }
    }

    fn header(virtual_sectors: u32, direct_memory: u32) -> UnitHeader {
        let mut header = UnitHeader {
            signature: SIGNATURE,
            transfer_units: 1,
            wear_level: 1,
            logical_unit: 0,
            log2_sector_size: 11,
            log2_unit_size: 16,
            first_physical_unit: 0,
            unit_count: 4,
            virtual_medium_size: virtual_sectors << 11,
            direct_addressing_memory: direct_memory,
            map_pages: map_pages_for(virtual_sectors, 512) as u16,
            flags: 0,
            check: 0,
            serial_number: 0,
            bat_offset: UnitHeader::bat_offset_for(0),
            descriptor: Vec::new(),
        };
        header.seal();
        header
    }

    #[test]
    fn test_unit_size_floor() {
        let mut geometry = flash();
        geometry.erase_block_size = 4096;
        assert_eq!(unit_size_for(&geometry).unwrap(), MIN_UNIT_SIZE);
        geometry.erase_block_size = 128 * 1024;
        assert_eq!(unit_size_for(&geometry).unwrap(), 128 * 1024);
        geometry.erase_block_size = 3000;
        assert!(unit_size_for(&geometry).is_err());
    }

    #[test]
    fn test_map_pages_cover_themselves() {
        assert_eq!(map_pages_for(48, 512), 1);
        assert_eq!(map_pages_for(511, 512), 1);
        assert_eq!(map_pages_for(512, 512), 2);
        assert_eq!(map_pages_for(1022, 512), 2);
        assert_eq!(map_pages_for(1023, 512), 3);
        for v in [1u32, 100, 1000, 5000] {
            let pages = map_pages_for(v, 128);
            assert!((v + pages).div_ceil(128) <= pages);
        }
    }

    #[test]
    fn test_geometry_from_header() {
        let geometry = VolumeGeometry::from_header(&header(48, 16), &flash()).unwrap();

        assert_eq!(geometry.sector_size(), 2048);
        assert_eq!(geometry.sectors_per_unit, 32);
        // 60 header bytes + 32 * 4 BAT bytes fit in one sector
        assert_eq!(geometry.format_sectors, 1);
        assert_eq!(geometry.logical_units, 3);
        assert_eq!(geometry.virtual_sectors, 48);
        assert_eq!(geometry.map_pages, 1);
        assert_eq!(geometry.direct_sectors, 4);
        assert_eq!(geometry.internal_sectors(), 49);
        assert!(geometry.page_needed(0));
    }

    #[test]
    fn test_direct_table_covers_whole_volume() {
        let geometry = VolumeGeometry::from_header(&header(48, 4096), &flash()).unwrap();
        assert_eq!(geometry.direct_sectors, 49);
        assert!(!geometry.page_needed(0));
    }

    #[test]
    fn test_address_arithmetic() {
        let geometry = VolumeGeometry::from_header(&header(48, 16), &flash()).unwrap();

        let address = geometry.logical_address(2, 5);
        assert_eq!(address, (2 << 16) | (5 << 11));
        assert_eq!(geometry.unit_of(address), 2);
        assert_eq!(geometry.sector_of(address), 5);
        assert_eq!(geometry.offset_in_unit(address), 5 << 11);
        assert_eq!(geometry.unit_base(3), 3 << 16);
        assert_eq!(geometry.bat_entry_offset(2), 60 + 8);
        assert_eq!(geometry.bat_entry_address(address), (2 << 16) | (60 + 20));
        assert!(!is_mapped_address(geometry.logical_address(0, 0)));
    }

    #[test]
    fn test_geometry_rejects_oversized_volume() {
        let mut bad = header(48, 16);
        bad.unit_count = 8;
        bad.seal();
        assert!(matches!(
            VolumeGeometry::from_header(&bad, &flash()),
            Err(FtlError::BadFormat)
        ));
    }
}
