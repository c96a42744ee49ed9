//! Sector allocation
//!
//! Every new sector goes through the same sequence of bit-clearing BAT
//! updates, so an interruption at any point leaves a state mount can resolve:
//!
//! ```text
//! FREE ─► ALLOCATED ─► payload ─► tentative entry ─► map update ─► committed
//! ```

use super::{ReplacementPage, UnitState, Volume};
use crate::bat::BatEntry;
use crate::error::{FtlError, Result};
use crate::geometry::is_mapped_address;
use crate::media::FlashMedia;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectorKind {
    /// Caller data or a primary map page
    Data,
    /// Shadow of a map page
    Replacement,
}

impl<M: FlashMedia> Volume<M> {
    /// Logical address of a free sector for `vsector`
    pub(crate) fn find_free_sector(&mut self, vsector: u32) -> Result<u32> {
        if let Some(address) = self.next_contiguous_sector(vsector)? {
            return Ok(address);
        }

        let best = self
            .units
            .iter()
            .enumerate()
            .filter_map(|(unit, info)| match info.state {
                UnitState::Logical(lu) if info.free > 0 => Some((unit as u32, lu, info)),
                _ => None,
            })
            .max_by(|(_, _, a), (_, _, b)| a.free.cmp(&b.free).then(b.wear.cmp(&a.wear)))
            .map(|(unit, lu, _)| (unit, lu));

        let Some((unit, logical_unit)) = best else {
            return Err(FtlError::GeneralFailure("no free sector left".to_string()));
        };

        for sector in self.geometry.format_sectors..self.geometry.sectors_per_unit {
            if self.bat_entry(unit, sector)? == BatEntry::Free {
                return Ok(self.geometry.logical_address(logical_unit, sector));
            }
        }

        Err(FtlError::GeneralFailure(format!(
            "unit {} counts free sectors but has none",
            unit
        )))
    }

    /// The slot right after the previous sector's slot, if it is free
    fn next_contiguous_sector(&mut self, vsector: u32) -> Result<Option<u32>> {
        if vsector == 0 {
            return Ok(None);
        }

        let previous = self.virtual_to_logical(vsector - 1)?;
        if !is_mapped_address(previous) {
            return Ok(None);
        }

        let sector = self.geometry.sector_of(previous) + 1;
        if sector >= self.geometry.sectors_per_unit {
            return Ok(None);
        }

        let logical_unit = self.geometry.unit_of(previous);
        let Some(unit) = self.unit_of_logical(logical_unit) else {
            return Ok(None);
        };
        if self.units[unit as usize].free == 0 || self.bat_entry(unit, sector)? != BatEntry::Free {
            return Ok(None);
        }

        Ok(Some(self.geometry.logical_address(logical_unit, sector)))
    }

    /// Write `data` into a newly allocated sector and map it
    ///
    /// If anything fails before the map points at the new sector, the slot
    /// is turned into garbage instead of staying allocated.
    pub(crate) fn allocate_and_write_sector(
        &mut self,
        vsector: u32,
        data: &[u8],
        kind: SectorKind,
    ) -> Result<u32> {
        self.defragment(1)?;

        let address = self.find_free_sector(vsector)?;
        self.write_bat(address, BatEntry::Allocated)?;

        let logical_unit = self.geometry.unit_of(address);
        if let Some(unit) = self.unit_of_logical(logical_unit) {
            self.units[unit as usize].free -= 1;
        }
        self.total_free -= 1;
        self.map_cache.evict(address);

        let entry = match kind {
            SectorKind::Data => BatEntry::Data {
                vsector,
                tentative: true,
            },
            SectorKind::Replacement => BatEntry::Replacement {
                page: vsector,
                tentative: true,
            },
        };

        if let Err(e) = self.fill_allocated_sector(address, vsector, data, entry, kind) {
            warn!("Abandoning sector {:#x}: {}", address, e);
            if let Err(cleanup) = self.mark_garbage(address) {
                warn!("Could not mark sector {:#x} as garbage: {}", address, cleanup);
            }
            return Err(e);
        }

        self.write_bat(address, entry.committed())?;

        debug!("Sector {} written at {:#x}", vsector, address);
        Ok(address)
    }

    fn fill_allocated_sector(
        &mut self,
        address: u32,
        vsector: u32,
        data: &[u8],
        entry: BatEntry,
        kind: SectorKind,
    ) -> Result<()> {
        self.write_logical(address, data)?;
        self.write_bat(address, entry)?;

        match kind {
            SectorKind::Data => self.set_virtual_map(vsector, address),
            SectorKind::Replacement => {
                self.replacement = Some(ReplacementPage {
                    page: vsector,
                    address,
                });
                Ok(())
            }
        }
    }
}
