//! Unit headers and BAT entries on media

use super::{UnitInfo, UnitState, Volume};
use crate::bat::{raw_entry, BatEntry, FORMAT_SECTOR, FREE_SECTOR};
use crate::error::Result;
use crate::geometry::VolumeGeometry;
use crate::header::{UnitHeader, HEADER_FIXED_LEN, LOGICAL_UNIT_OFFSET, UNASSIGNED_UNIT};
use crate::media::FlashMedia;
use tracing::debug;

/// Header of the unit at `base`, if it holds a valid one
pub(crate) fn read_header<F: FlashMedia + ?Sized>(
    media: &F,
    base: u32,
    unit_size: u32,
) -> Option<UnitHeader> {
    let fixed = media.map(base, HEADER_FIXED_LEN).ok()?;
    let len = HEADER_FIXED_LEN + UnitHeader::peek_descriptor_len(fixed)?;
    if len > unit_size as usize {
        return None;
    }
    let bytes = media.map(base, len).ok()?;
    UnitHeader::from_bytes(bytes).ok()
}

/// Header, padding up to the BAT, and FORMAT entries for the header sectors
pub(crate) fn format_image(header: &UnitHeader, geometry: &VolumeGeometry) -> Vec<u8> {
    let mut image = header.to_bytes();
    image.resize(geometry.bat_offset as usize, 0xFF);
    for _ in 0..geometry.format_sectors {
        image.extend_from_slice(&FORMAT_SECTOR.to_le_bytes());
    }
    image
}

/// Free and garbage slot counts of a raw BAT
pub(crate) fn count_bat(bat: &[u8], geometry: &VolumeGeometry) -> (u32, u32) {
    let mut free = 0;
    let mut garbage = 0;
    for sector in geometry.format_sectors..geometry.sectors_per_unit {
        match BatEntry::decode(raw_entry(bat, sector as usize), geometry.sector_bits) {
            BatEntry::Free => free += 1,
            BatEntry::Bad => {}
            entry if entry.is_live() => {}
            _ => garbage += 1,
        }
    }
    (free, garbage)
}

impl<M: FlashMedia> Volume<M> {
    /// Erase a unit and write a fresh spare header stamped with the next wear count
    pub(crate) fn format_unit(&mut self, unit: u32) -> Result<()> {
        self.units[unit as usize] = UnitInfo {
            wear: self.units[unit as usize].wear,
            ..UnitInfo::unformatted()
        };
        self.media.erase(
            self.geometry.first_block_of(unit),
            self.geometry.blocks_per_unit(),
        )?;
        self.write_unit_header(unit)
    }

    /// Write the spare header into an already erased unit
    pub(crate) fn write_unit_header(&mut self, unit: u32) -> Result<()> {
        let wear = self.max_wear + 1;

        let mut header = self.template.clone();
        header.wear_level = wear;
        header.logical_unit = UNASSIGNED_UNIT;

        let image = format_image(&header, &self.geometry);
        self.media
            .write(self.geometry.unit_base(unit), &image, true)?;

        self.max_wear = wear;
        self.units[unit as usize] = UnitInfo {
            state: UnitState::Spare,
            free: 0,
            garbage: 0,
            wear,
        };
        self.last_mapped = None;

        debug!("Formatted unit {} with wear {}", unit, wear);
        Ok(())
    }

    /// Rewrite the logical unit number in place; only ever clears bits
    pub(crate) fn assign_unit(&mut self, unit: u32, logical_unit: u16) -> Result<()> {
        let address = self.geometry.unit_base(unit) + LOGICAL_UNIT_OFFSET as u32;
        self.media
            .write(address, &logical_unit.to_le_bytes(), false)
    }

    /// BAT entry for slot `sector` of physical unit `unit`
    pub(crate) fn bat_entry(&self, unit: u32, sector: u32) -> Result<BatEntry> {
        let address = self.geometry.unit_base(unit) + self.geometry.bat_entry_offset(sector);
        let raw = self.media.map(address, 4)?;
        Ok(BatEntry::decode(raw_entry(raw, 0), self.geometry.sector_bits))
    }

    pub(crate) fn read_bat(&self, unit: u32) -> Result<Vec<u8>> {
        let address = self.geometry.unit_base(unit) + self.geometry.bat_offset;
        Ok(self.media.map(address, self.geometry.bat_len())?.to_vec())
    }

    /// Free and garbage counts of a unit, straight from its BAT
    pub(crate) fn count_unit(&self, unit: u32) -> Result<(u32, u32)> {
        let address = self.geometry.unit_base(unit) + self.geometry.bat_offset;
        let bat = self.media.map(address, self.geometry.bat_len())?;
        Ok(count_bat(bat, &self.geometry))
    }

    /// True when every data slot of the unit is still free
    pub(crate) fn bat_is_clean(&self, unit: u32) -> Result<bool> {
        let bat = self.read_bat(unit)?;
        Ok((self.geometry.format_sectors..self.geometry.sectors_per_unit)
            .all(|sector| raw_entry(&bat, sector as usize) == FREE_SECTOR))
    }

    /// Update the BAT entry of the sector at logical `address`
    pub(crate) fn write_bat(&mut self, address: u32, entry: BatEntry) -> Result<()> {
        let raw = entry.encode(self.geometry.sector_bits);
        self.write_logical(self.geometry.bat_entry_address(address), &raw.to_le_bytes())
    }

    /// Turn the sector at `address` into garbage
    pub(crate) fn mark_garbage(&mut self, address: u32) -> Result<()> {
        self.write_bat(address, BatEntry::Garbage)?;

        let logical_unit = self.geometry.unit_of(address);
        if let Some(unit) = self.unit_of_logical(logical_unit) {
            self.units[unit as usize].garbage += 1;
        }
        self.map_cache.evict(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SIGNATURE;
    use crate::media::ram::RamFlash;

    fn header() -> UnitHeader {
        let mut header = UnitHeader {
            signature: SIGNATURE,
            transfer_units: 1,
            wear_level: 3,
            logical_unit: 0,
            log2_sector_size: 11,
            log2_unit_size: 16,
            first_physical_unit: 0,
            unit_count: 4,
            virtual_medium_size: 48 << 11,
            direct_addressing_memory: 64,
            map_pages: 1,
            flags: 0,
            check: 0,
            serial_number: 1,
            bat_offset: UnitHeader::bat_offset_for(0),
            descriptor: Vec::new(),
        };
        header.seal();
        header
    }

    fn flash() -> RamFlash {
        RamFlash::with_blocks(64 * 1024, 4)
    }

    #[test]
    fn test_format_image_layout() {
        let flash = flash();
        let geometry = VolumeGeometry::from_header(&header(), &flash.geometry()).unwrap();
        let image = format_image(&header(), &geometry);

        assert_eq!(image.len(), 60 + 4);
        assert_eq!(raw_entry(&image[60..], 0), FORMAT_SECTOR);
    }

    #[test]
    fn test_read_header_roundtrip() {
        let mut flash = flash();
        let geometry = VolumeGeometry::from_header(&header(), &flash.geometry()).unwrap();
        flash
            .write(65536, &format_image(&header(), &geometry), true)
            .unwrap();

        assert_eq!(read_header(&flash, 65536, 65536), Some(header()));
        assert_eq!(read_header(&flash, 0, 65536), None);
    }

    #[test]
    fn test_count_bat() {
        let flash = flash();
        let geometry = VolumeGeometry::from_header(&header(), &flash.geometry()).unwrap();

        let mut bat = vec![0xFF; geometry.bat_len()];
        bat[0..4].copy_from_slice(&FORMAT_SECTOR.to_le_bytes());
        // slot 1 live, slot 2 garbage, slot 3 allocated
        bat[4..8].copy_from_slice(&((5u32 << 11) | 0x40).to_le_bytes());
        bat[8..12].copy_from_slice(&0u32.to_le_bytes());
        bat[12..16].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());

        let (free, garbage) = count_bat(&bat, &geometry);
        assert_eq!(free, 32 - 4);
        assert_eq!(garbage, 2);
    }
}
