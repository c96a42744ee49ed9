//! Address translation and the read path

use super::{gc::Job, Volume};
use crate::error::{FtlError, Result};
use crate::geometry::{is_mapped_address, DELETED_ADDRESS, UNASSIGNED_ADDRESS};
use crate::media::FlashMedia;
use tracing::{debug, error};

impl<M: FlashMedia> Volume<M> {
    /// Physical byte address of a logical address
    pub(crate) fn logical_to_physical(&self, address: u32) -> Result<u32> {
        let logical_unit = self.geometry.unit_of(address);
        match self.unit_of_logical(logical_unit) {
            Some(unit) => {
                Ok(self.geometry.unit_base(unit) | self.geometry.offset_in_unit(address))
            }
            None => {
                error!(
                    "Logical address {:#x} names logical unit {} which no unit holds",
                    address, logical_unit
                );
                Err(FtlError::GeneralFailure(format!(
                    "logical unit {} out of range",
                    logical_unit
                )))
            }
        }
    }

    /// Logical address currently holding internal sector `vsector`, or one of
    /// the unassigned/deleted sentinels
    pub(crate) fn virtual_to_logical(&mut self, vsector: u32) -> Result<u32> {
        if vsector >= self.geometry.internal_sectors() {
            return Err(FtlError::SectorNotFound(vsector));
        }

        if vsector < self.geometry.direct_sectors {
            return Ok(self.direct[vsector as usize]);
        }

        let epp = self.geometry.entries_per_page();
        let page = vsector / epp;
        let index = vsector % epp;

        let page_address = self.direct[page as usize];
        if !is_mapped_address(page_address) {
            return Ok(UNASSIGNED_ADDRESS);
        }

        let entry = self.map_entry(page_address, index)?;
        if entry != DELETED_ADDRESS {
            return Ok(entry);
        }

        match self.replacement {
            Some(replacement) if replacement.page == page => {
                let shadow = self.map_entry(replacement.address, index)?;
                if shadow == UNASSIGNED_ADDRESS {
                    Ok(DELETED_ADDRESS)
                } else {
                    Ok(shadow)
                }
            }
            _ => Ok(DELETED_ADDRESS),
        }
    }

    /// Entry `index` of the map page stored at `page_address`
    pub(crate) fn map_entry(&mut self, page_address: u32, index: u32) -> Result<u32> {
        if let Some(entry) = self.map_cache.entry(page_address, index as usize) {
            return Ok(entry);
        }

        let page = self.read_logical_sector(page_address)?;
        let entry = crate::map_cache::read_entry(&page, index as usize);
        self.map_cache.insert(page_address, page);
        Ok(entry)
    }

    pub(crate) fn read_logical_sector(&self, address: u32) -> Result<Vec<u8>> {
        let physical = self.logical_to_physical(address)?;
        let sector_size = self.geometry.sector_size() as usize;
        Ok(self.media.map(physical, sector_size)?.to_vec())
    }

    /// Write through a logical address. Writes landing in the copied part of
    /// a unit under transfer are repeated on the transfer target.
    pub(crate) fn write_logical(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let physical = self.logical_to_physical(address)?;
        self.finish_erase_on_chip(physical)?;
        self.media.write(physical, data, false)?;

        if let Some(Job::Transfer(transfer)) = &self.job {
            let window = transfer.window;
            let offset = self.geometry.offset_in_unit(address);
            if window.contains(self.geometry.unit_of(address), offset) {
                let mirror = self.geometry.unit_base(window.target_unit) + offset;
                self.media.write(mirror, data, false)?;
            }
        }

        Ok(())
    }

    /// Read-only view of a caller sector
    pub fn map_sector(&mut self, sector: u32) -> Result<&[u8]> {
        self.check_status()?;
        if sector >= self.geometry.virtual_sectors {
            return Err(FtlError::SectorNotFound(sector));
        }

        if self.media.take_remapped() {
            debug!("Media remapped, dropping cached translation");
            self.last_mapped = None;
        }

        let physical = match self.last_mapped {
            Some((cached, physical)) if cached == sector => physical,
            _ => {
                let address = self.virtual_to_logical(sector + self.geometry.map_pages)?;
                if !is_mapped_address(address) {
                    return Err(FtlError::SectorNotFound(sector));
                }
                let physical = self.logical_to_physical(address)?;
                self.last_mapped = Some((sector, physical));
                physical
            }
        };

        self.media.map(physical, self.geometry.sector_size() as usize)
    }
}
