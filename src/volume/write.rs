//! Write and delete paths

use super::alloc::SectorKind;
use super::Volume;
use crate::error::{FtlError, Result};
use crate::geometry::{is_mapped_address, DELETED_ADDRESS};
use crate::media::FlashMedia;
use tracing::{debug, warn};

/// Whether `new` can be programmed over `old` without setting any bit
///
/// Returns the number of leading bytes that are already equal (so the write
/// can skip them), or `None` if some bit would have to go from 0 to 1.
pub fn check_for_write_inplace(new: &[u8], old: &[u8]) -> Option<usize> {
    debug_assert_eq!(new.len(), old.len());

    let mut first_change = None;
    let words = new.len() / 8;

    for i in 0..words {
        let range = i * 8..i * 8 + 8;
        let n = u64::from_le_bytes(new[range.clone()].try_into().ok()?);
        let o = u64::from_le_bytes(old[range].try_into().ok()?);
        if n & !o != 0 {
            return None;
        }
        if first_change.is_none() && n != o {
            first_change = Some(i * 8 + ((n ^ o).trailing_zeros() / 8) as usize);
        }
    }

    for i in words * 8..new.len() {
        if new[i] & !old[i] != 0 {
            return None;
        }
        if first_change.is_none() && new[i] != old[i] {
            first_change = Some(i);
        }
    }

    Some(first_change.unwrap_or(new.len()))
}

impl<M: FlashMedia> Volume<M> {
    /// Store one sector of data. A write fault is retried once.
    pub fn write_sector(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        self.check_status()?;

        if data.len() != self.geometry.sector_size() as usize {
            return Err(FtlError::InvalidParameter(format!(
                "sector data must be {} bytes, got {}",
                self.geometry.sector_size(),
                data.len()
            )));
        }
        if sector >= self.geometry.virtual_sectors {
            return Err(FtlError::SectorNotFound(sector));
        }

        match self.write_sector_once(sector, data) {
            Err(e) if e.is_write_fault() => {
                warn!("Write fault on sector {}, retrying", sector);
                self.write_sector_once(sector, data)
            }
            result => result,
        }
    }

    fn write_sector_once(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        let vsector = sector + self.geometry.map_pages;
        let address = self.virtual_to_logical(vsector)?;

        if is_mapped_address(address) {
            let physical = self.logical_to_physical(address)?;
            let sector_size = self.geometry.sector_size() as usize;
            let in_place = check_for_write_inplace(data, self.media.map(physical, sector_size)?);

            if let Some(skip) = in_place {
                if skip < sector_size {
                    debug!("Sector {} rewritten in place from byte {}", sector, skip);
                    self.write_logical(address + skip as u32, &data[skip..])?;
                }
                return Ok(());
            }
        }

        self.allocate_and_write_sector(vsector, data, SectorKind::Data)?;
        Ok(())
    }

    /// Trim `count` sectors starting at `first`
    ///
    /// Sectors that are already deleted or were never written are skipped,
    /// so repeating a delete changes nothing.
    pub fn delete_sector(&mut self, first: u32, count: u32) -> Result<()> {
        self.check_status()?;

        let end = first
            .checked_add(count)
            .filter(|&end| end <= self.geometry.virtual_sectors)
            .ok_or(FtlError::SectorNotFound(first))?;

        for sector in first..end {
            let vsector = sector + self.geometry.map_pages;
            if is_mapped_address(self.virtual_to_logical(vsector)?) {
                self.set_virtual_map(vsector, DELETED_ADDRESS)?;
            }
        }

        debug!("Deleted sectors {}..{}", first, end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_data_skips_everything() {
        let data = vec![0x5A; 512];
        assert_eq!(check_for_write_inplace(&data, &data), Some(512));
    }

    #[test]
    fn test_clearing_bits_is_allowed() {
        let old = vec![0xFF; 512];
        let mut new = old.clone();
        new[100] = 0x0F;
        new[300] = 0x00;
        assert_eq!(check_for_write_inplace(&new, &old), Some(100));
    }

    #[test]
    fn test_setting_a_bit_is_rejected() {
        let old = vec![0x00; 512];
        let mut new = old.clone();
        new[511] = 0x01;
        assert_eq!(check_for_write_inplace(&new, &old), None);
    }

    #[test]
    fn test_unaligned_tail_is_checked() {
        let old = vec![0xF0; 13];
        let mut new = old.clone();
        new[12] = 0x10;
        assert_eq!(check_for_write_inplace(&new, &old), Some(12));
        new[12] = 0x0F;
        assert_eq!(check_for_write_inplace(&new, &old), None);
    }

    #[test]
    fn test_first_change_inside_word() {
        let old = vec![0xFF; 16];
        let mut new = old.clone();
        new[5] = 0xFE;
        assert_eq!(check_for_write_inplace(&new, &old), Some(5));
    }
}
