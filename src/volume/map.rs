//! Virtual map updates and the replacement page
//!
//! A map entry can be rewritten in place only while the new value clears
//! bits. Anything else goes through the replacement page: the new value is
//! written into a shadow copy of the map page and the primary entry is
//! cleared to DELETED, which makes readers fall through to the shadow. At most
//! one replacement page is open at a time; opening another one first merges
//! the current one into a freshly allocated primary page.

use super::alloc::SectorKind;
use super::{ReplacementPage, Volume};
use crate::bat::is_bit_clear;
use crate::error::{FtlError, Result};
use crate::geometry::{is_mapped_address, DELETED_ADDRESS, UNASSIGNED_ADDRESS};
use crate::map_cache::read_entry;
use crate::media::FlashMedia;
use tracing::{debug, warn};

/// Merge a replacement page into its primary page
///
/// Primary entries win unless DELETED; an erased shadow entry means the
/// sector was deleted. Merging an already merged page changes nothing.
pub(crate) fn merge_pages(primary: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut merged = primary.to_vec();
    for index in 0..primary.len() / 4 {
        let current = read_entry(primary, index);
        if current != DELETED_ADDRESS {
            continue;
        }
        let shadow = read_entry(replacement, index);
        let value = if shadow == UNASSIGNED_ADDRESS {
            DELETED_ADDRESS
        } else {
            shadow
        };
        merged[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    merged
}

impl<M: FlashMedia> Volume<M> {
    /// Point internal sector `vsector` at `address` and retire whatever it
    /// pointed to before
    pub(crate) fn set_virtual_map(&mut self, vsector: u32, address: u32) -> Result<()> {
        let old = self.virtual_to_logical(vsector)?;
        let displaced = is_mapped_address(old) && old != address;

        if vsector < self.geometry.direct_sectors {
            // Mount keeps the committed copy of a direct sector, so the old
            // one must be gone before the new one can commit
            if displaced {
                self.mark_garbage(old)?;
            }
            self.direct[vsector as usize] = address;
        } else {
            self.set_map_entry(vsector, address)?;
            if displaced {
                if let Err(e) = self.mark_garbage(old) {
                    // Unreferenced sectors are swept at the next mount
                    warn!("Could not retire sector {:#x}: {}", old, e);
                }
            }
        }

        self.last_mapped = None;
        Ok(())
    }

    fn set_map_entry(&mut self, vsector: u32, value: u32) -> Result<()> {
        let epp = self.geometry.entries_per_page();
        let page = vsector / epp;
        let index = vsector % epp;

        loop {
            let page_address = self.direct[page as usize];
            if !is_mapped_address(page_address) {
                return Err(FtlError::GeneralFailure(format!(
                    "map page {} is not mapped",
                    page
                )));
            }

            let primary = self.map_entry(page_address, index)?;
            let open = self.replacement.filter(|r| r.page == page);

            match open {
                Some(replacement) if primary == DELETED_ADDRESS => {
                    let shadow = self.map_entry(replacement.address, index)?;
                    if is_bit_clear(shadow, value) {
                        return self.write_map_entry(replacement.address, index, value);
                    }
                    self.close_replacement_page()?;
                }
                None if primary == DELETED_ADDRESS => {
                    if value == DELETED_ADDRESS {
                        return Ok(());
                    }
                    return self.open_replacement_page(page, index, value).map(|_| ());
                }
                Some(replacement)
                    if self.map_entry(replacement.address, index)? != UNASSIGNED_ADDRESS =>
                {
                    // A stale shadow entry would resurface once the primary
                    // entry reads DELETED
                    self.close_replacement_page()?;
                }
                _ if is_bit_clear(primary, value) => {
                    return self.write_map_entry(page_address, index, value);
                }
                Some(replacement) => {
                    self.write_map_entry(replacement.address, index, value)?;
                    return self.write_map_entry(page_address, index, DELETED_ADDRESS);
                }
                None => {
                    self.open_replacement_page(page, index, value)?;
                    let page_address = self.direct[page as usize];
                    return self.write_map_entry(page_address, index, DELETED_ADDRESS);
                }
            }
        }
    }

    fn write_map_entry(&mut self, page_address: u32, index: u32, value: u32) -> Result<()> {
        self.write_logical(page_address + index * 4, &value.to_le_bytes())?;
        self.map_cache.update_entry(page_address, index as usize, value);
        Ok(())
    }

    /// Open a replacement page for `page` holding `value` at `index`
    fn open_replacement_page(&mut self, page: u32, index: u32, value: u32) -> Result<u32> {
        if self.replacement.is_some_and(|r| r.page != page) {
            self.close_replacement_page()?;
        }

        let mut shadow = vec![0xFF; self.geometry.sector_size() as usize];
        let off = index as usize * 4;
        shadow[off..off + 4].copy_from_slice(&value.to_le_bytes());

        let address = self.allocate_and_write_sector(page, &shadow, SectorKind::Replacement)?;
        debug!("Opened replacement page {:#x} for map page {}", address, page);
        Ok(address)
    }

    /// Merge the open replacement page into a new primary page
    pub(crate) fn close_replacement_page(&mut self) -> Result<()> {
        let Some(replacement) = self.replacement else {
            return Ok(());
        };

        self.set_busy(true);
        let result = self.merge_replacement(replacement);
        self.set_busy(false);
        result
    }

    fn merge_replacement(&mut self, replacement: ReplacementPage) -> Result<()> {
        let page_address = self.direct[replacement.page as usize];
        let primary = self.read_logical_sector(page_address)?;
        let shadow = self.read_logical_sector(replacement.address)?;
        let merged = merge_pages(&primary, &shadow);

        let address = self.allocate_and_write_sector(replacement.page, &merged, SectorKind::Data)?;
        self.mark_garbage(replacement.address)?;
        self.replacement = None;

        debug!(
            "Merged replacement page for map page {} into {:#x}",
            replacement.page, address
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(entries: &[u32]) -> Vec<u8> {
        entries.iter().flat_map(|e| e.to_le_bytes()).collect()
    }

    #[test]
    fn test_merge_prefers_primary() {
        let primary = page(&[0x1040, DELETED_ADDRESS, DELETED_ADDRESS, UNASSIGNED_ADDRESS]);
        let shadow = page(&[0x2040, 0x3040, UNASSIGNED_ADDRESS, 0x4040]);

        let merged = merge_pages(&primary, &shadow);
        assert_eq!(
            merged,
            page(&[0x1040, 0x3040, DELETED_ADDRESS, UNASSIGNED_ADDRESS])
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let primary = page(&[DELETED_ADDRESS, 0x1040, DELETED_ADDRESS]);
        let shadow = page(&[0x5040, UNASSIGNED_ADDRESS, UNASSIGNED_ADDRESS]);

        let once = merge_pages(&primary, &shadow);
        let twice = merge_pages(&once, &shadow);
        assert_eq!(once, twice);
    }
}
