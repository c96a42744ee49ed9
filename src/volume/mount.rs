//! Mount and format
//!
//! Nothing but the unit headers and BATs is persisted, so mount rebuilds
//! every table from a scan and then repairs whatever an interruption left
//! behind:
//!
//! 1. headers: classify units, resolve a logical unit found twice (the copy
//!    with the higher wear count is the completed transfer target)
//! 2. BATs: rebuild counters and the direct table, keeping the committed
//!    copy of a direct sector over a tentative one
//! 3. repair: discard losing copies, commit winners, close orphaned
//!    replacement pages, then sweep data sectors the map does not reference
//! 4. reformat spares left erased or half-prepared by an interrupted transfer

use super::unit::{count_bat, format_image, read_header};
use super::{ReplacementPage, UnitInfo, UnitState, Volume, VolumeStatus, NO_UNIT};
use crate::bat::{raw_entry, BatEntry};
use crate::config::{FormatParams, MountOptions};
use crate::error::{FtlError, Result};
use crate::geometry::{
    format_sectors_for, is_mapped_address, map_pages_for, unit_size_for, VolumeGeometry,
    UNASSIGNED_ADDRESS,
};
use crate::header::{UnitHeader, MARKED_FOR_ERASE, SIGNATURE, UNASSIGNED_UNIT};
use crate::map_cache::MapPageCache;
use crate::media::FlashMedia;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

/// Data slots kept beyond the virtual sectors and map pages: a replacement
/// page, a merged map page and the sector being written
const RESERVED_SLOTS: u32 = 3;

fn table<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| FtlError::NotEnoughMemory)?;
    table.resize(len, value);
    Ok(table)
}

/// Data sector found during the BAT scan
struct ScannedSector {
    vsector: u32,
    address: u32,
    tentative: bool,
}

#[derive(Default)]
struct Repairs {
    discard: Vec<u32>,
    commit: Vec<(u32, BatEntry)>,
    replacements: Vec<ReplacementPage>,
    mapped: Vec<ScannedSector>,
}

impl<M: FlashMedia> Volume<M> {
    /// Mount a formatted volume
    ///
    /// Fails with `BadFormat` only when no valid unit header exists at all.
    /// A volume that fails its consistency checks is still returned, refuses
    /// every operation with `BadFormat` and can be dismounted.
    pub fn mount(media: M, options: MountOptions) -> Result<Self> {
        options.validate()?;

        let flash = media.geometry();
        let unit_size = unit_size_for(&flash)?;
        let physical_units = (flash.total_size() / unit_size as u64) as u32;

        let (template, geometry) = (0..physical_units)
            .filter_map(|unit| read_header(&media, unit * unit_size, unit_size))
            .find_map(|header| {
                VolumeGeometry::from_header(&header, &flash)
                    .ok()
                    .map(|geometry| (header, geometry))
            })
            .ok_or_else(|| {
                warn!("No valid unit header on {} units", physical_units);
                FtlError::BadFormat
            })?;

        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut volume = Volume {
            units: table(geometry.unit_count as usize, UnitInfo::unformatted())?,
            logical_to_physical: table(geometry.logical_units as usize, NO_UNIT)?,
            direct: table(geometry.direct_sectors as usize, UNASSIGNED_ADDRESS)?,
            copy_buffer: table(geometry.sector_size() as usize, 0u8)?,
            map_cache: MapPageCache::new(options.map_cache_pages),
            replacement: None,
            total_free: 0,
            max_wear: 0,
            last_mapped: None,
            status: VolumeStatus::Mounted,
            rng,
            options,
            job: None,
            suspend_depth: 0,
            transfers: 0,
            media,
            geometry,
            template,
        };

        match volume.mount_units() {
            Ok(()) => info!(
                "Mounted volume: {} sectors of {} bytes, {} free, {} spare units",
                volume.geometry.virtual_sectors,
                volume.geometry.sector_size(),
                volume.total_free,
                volume.spare_units()
            ),
            Err(e) => {
                error!("Volume failed consistency checks: {}", e);
                volume.status = VolumeStatus::BadFormat;
            }
        }

        Ok(volume)
    }

    fn mount_units(&mut self) -> Result<()> {
        self.mount_headers()?;
        let repairs = self.scan_bats()?;
        self.repair(repairs)?;
        self.reformat_spares();
        Ok(())
    }

    /// Erase and re-header every spare an interruption left unusable
    ///
    /// Units without a valid header go first: a power cut in here then
    /// leaves at most one of them, which the next mount still tolerates.
    fn reformat_spares(&mut self) {
        let unit_size = self.geometry.unit_size();
        let mut pending: Vec<u32> = (0..self.geometry.unit_count)
            .filter(|&unit| self.units[unit as usize].state == UnitState::NeedsFormat)
            .collect();
        pending.sort_by_key(|&unit| {
            read_header(&self.media, self.geometry.unit_base(unit), unit_size)
                .is_some_and(|header| header.same_format(&self.template))
        });

        for unit in pending {
            match self.format_unit(unit) {
                Ok(()) => info!("Reformatted spare unit {}", unit),
                Err(e) => warn!("Spare unit {} could not be reformatted: {}", unit, e),
            }
        }
    }

    fn mount_headers(&mut self) -> Result<()> {
        let unit_size = self.geometry.unit_size();
        let mut invalid = 0;

        for unit in 0..self.geometry.unit_count {
            let header = read_header(&self.media, self.geometry.unit_base(unit), unit_size)
                .filter(|header| header.same_format(&self.template));

            let Some(header) = header else {
                invalid += 1;
                self.units[unit as usize] = UnitInfo::unformatted();
                continue;
            };

            self.max_wear = self.max_wear.max(header.wear_level);
            self.units[unit as usize] = UnitInfo {
                wear: header.wear_level,
                ..UnitInfo::unformatted()
            };

            match header.logical_unit {
                UNASSIGNED_UNIT => self.units[unit as usize].state = UnitState::Spare,
                MARKED_FOR_ERASE => {
                    warn!("Unit {} holds an interrupted transfer", unit);
                }
                lun if (lun as u32) < self.geometry.logical_units => {
                    self.claim_logical_unit(unit, lun as u32)?;
                }
                lun => {
                    warn!("Unit {} claims logical unit {} out of range", unit, lun);
                    invalid += 1;
                }
            }
        }

        if invalid > 1 {
            error!("{} units carry no valid header", invalid);
            return Err(FtlError::BadFormat);
        }

        if let Some(lu) = self.logical_to_physical.iter().position(|&u| u == NO_UNIT) {
            error!("Logical unit {} is not held by any unit", lu);
            return Err(FtlError::BadFormat);
        }

        Ok(())
    }

    fn claim_logical_unit(&mut self, unit: u32, logical_unit: u32) -> Result<()> {
        let existing = self.logical_to_physical[logical_unit as usize];
        if existing == NO_UNIT {
            self.logical_to_physical[logical_unit as usize] = unit;
            self.units[unit as usize].state = UnitState::Logical(logical_unit);
            return Ok(());
        }

        let existing_wear = self.units[existing as usize].wear;
        let wear = self.units[unit as usize].wear;
        if wear == existing_wear {
            error!(
                "Logical unit {} held by units {} and {} with equal wear",
                logical_unit, existing, unit
            );
            return Err(FtlError::BadFormat);
        }

        let (winner, loser) = if wear > existing_wear {
            (unit, existing)
        } else {
            (existing, unit)
        };
        warn!(
            "Logical unit {} found twice, keeping unit {} and recycling unit {}",
            logical_unit, winner, loser
        );

        self.logical_to_physical[logical_unit as usize] = winner;
        self.units[winner as usize].state = UnitState::Logical(logical_unit);
        self.units[loser as usize].state = UnitState::NeedsFormat;
        Ok(())
    }

    fn scan_bats(&mut self) -> Result<Repairs> {
        let geometry = self.geometry.clone();
        let mut repairs = Repairs::default();
        let mut direct: Vec<Option<(u32, bool)>> = table(geometry.direct_sectors as usize, None)?;

        for unit in 0..geometry.unit_count {
            let logical_unit = match self.units[unit as usize].state {
                UnitState::Logical(lu) => lu,
                UnitState::Spare => {
                    if !self.bat_is_clean(unit)? {
                        warn!("Spare unit {} has a dirty BAT", unit);
                        self.units[unit as usize].state = UnitState::NeedsFormat;
                    }
                    continue;
                }
                UnitState::NeedsFormat => continue,
            };

            let bat = self.read_bat(unit)?;
            let (free, garbage) = count_bat(&bat, &geometry);

            for sector in geometry.format_sectors..geometry.sectors_per_unit {
                let address = geometry.logical_address(logical_unit, sector);
                match BatEntry::decode(raw_entry(&bat, sector as usize), geometry.sector_bits) {
                    BatEntry::Data { vsector, .. } if vsector >= geometry.internal_sectors() => {
                        warn!("Sector {:#x} names sector {} beyond the volume", address, vsector);
                        repairs.discard.push(address);
                    }
                    BatEntry::Data { vsector, tentative } if vsector < geometry.direct_sectors => {
                        resolve_direct(&mut direct, &mut repairs, vsector, address, tentative)?;
                    }
                    BatEntry::Data { vsector, tentative } => repairs.mapped.push(ScannedSector {
                        vsector,
                        address,
                        tentative,
                    }),
                    BatEntry::Replacement { page, tentative } => {
                        if tentative || !geometry.page_needed(page) {
                            repairs.discard.push(address);
                        } else {
                            repairs.replacements.push(ReplacementPage { page, address });
                        }
                    }
                    _ => {}
                }
            }

            let info = &mut self.units[unit as usize];
            info.free = free;
            info.garbage = garbage;
            self.total_free += free;
        }

        for (vsector, slot) in direct.into_iter().enumerate() {
            let Some((address, tentative)) = slot else {
                continue;
            };
            self.direct[vsector] = address;
            if tentative {
                repairs.commit.push((
                    address,
                    BatEntry::Data {
                        vsector: vsector as u32,
                        tentative: false,
                    },
                ));
            }
        }

        for page in 0..geometry.map_pages {
            if geometry.page_needed(page) && !is_mapped_address(self.direct[page as usize]) {
                error!("Map page {} is missing", page);
                return Err(FtlError::BadFormat);
            }
        }

        for (i, r) in repairs.replacements.iter().enumerate() {
            if repairs.replacements[..i].iter().any(|other| other.page == r.page) {
                error!("Map page {} has two replacement pages", r.page);
                return Err(FtlError::BadFormat);
            }
        }

        Ok(repairs)
    }

    fn repair(&mut self, repairs: Repairs) -> Result<()> {
        for address in repairs.discard {
            debug!("Discarding uncommitted sector {:#x}", address);
            self.mark_garbage(address)?;
        }

        for (address, entry) in repairs.commit {
            debug!("Committing sector {:#x}", address);
            self.write_bat(address, entry)?;
        }

        for replacement in repairs.replacements {
            warn!(
                "Closing orphaned replacement page of map page {}",
                replacement.page
            );
            self.replacement = Some(replacement);
            self.close_replacement_page()?;
        }

        for scanned in repairs.mapped {
            if self.virtual_to_logical(scanned.vsector)? == scanned.address {
                if scanned.tentative {
                    self.write_bat(
                        scanned.address,
                        BatEntry::Data {
                            vsector: scanned.vsector,
                            tentative: false,
                        },
                    )?;
                }
            } else {
                debug!("Sweeping unreferenced sector {:#x}", scanned.address);
                self.mark_garbage(scanned.address)?;
            }
        }

        Ok(())
    }

    /// Format the whole media (after an optional boot area) as a fresh volume
    ///
    /// Wear counts of previously formatted units are carried forward. Returns
    /// the media, ready for [`Volume::mount`].
    pub fn format(mut media: M, params: &FormatParams) -> Result<M> {
        params.validate()?;

        let flash = media.geometry();
        let unit_size = unit_size_for(&flash)?;
        let unit_bits = unit_size.trailing_zeros() as u8;
        let sector_bits = params.log2_sector_size;
        if sector_bits >= unit_bits {
            return Err(FtlError::InvalidParameter(format!(
                "sector size 2^{} does not fit unit size 2^{}",
                sector_bits, unit_bits
            )));
        }

        let physical_units = (flash.total_size() >> unit_bits) as u32;
        let first_unit = params.boot_image_len.div_ceil(unit_size);
        let unit_count = physical_units.saturating_sub(first_unit);
        let spare_units = params.spare_units as u32;
        if first_unit > u16::MAX as u32 || unit_count <= spare_units || unit_count > u16::MAX as u32
        {
            return Err(FtlError::InvalidParameter(format!(
                "{} units available for {} spares",
                unit_count, spare_units
            )));
        }
        let logical_units = unit_count - spare_units;

        let sectors_per_unit = 1u32 << (unit_bits - sector_bits);
        let bat_offset = UnitHeader::bat_offset_for(params.embedded_descriptor.len());
        let format_sectors = format_sectors_for(bat_offset, sectors_per_unit, sector_bits);
        if format_sectors >= sectors_per_unit {
            return Err(FtlError::InvalidParameter(
                "unit header and BAT fill the whole unit".to_string(),
            ));
        }

        let slots = logical_units * (sectors_per_unit - format_sectors);
        let entries_per_page = (1u32 << sector_bits) / 4;
        let fits = |v: u32| v + map_pages_for(v, entries_per_page) + RESERVED_SLOTS <= slots;

        let virtual_sectors = match params.virtual_sectors {
            Some(v) => v,
            None => {
                let mut v = (slots as u64 * params.percent_use as u64 / 100) as u32;
                while v > 0 && !fits(v) {
                    v -= 1;
                }
                v
            }
        };
        if virtual_sectors == 0 || !fits(virtual_sectors) {
            return Err(FtlError::InvalidParameter(format!(
                "{} virtual sectors do not fit {} data slots",
                virtual_sectors, slots
            )));
        }

        let map_pages = map_pages_for(virtual_sectors, entries_per_page);
        let virtual_size = (virtual_sectors as u64) << sector_bits;
        if virtual_size > u32::MAX as u64 || map_pages > u16::MAX as u32 {
            return Err(FtlError::InvalidParameter(format!(
                "{} virtual sectors exceed the header fields",
                virtual_sectors
            )));
        }

        let mut header = UnitHeader {
            signature: SIGNATURE,
            transfer_units: params.spare_units,
            wear_level: 1,
            logical_unit: UNASSIGNED_UNIT,
            log2_sector_size: sector_bits,
            log2_unit_size: unit_bits,
            first_physical_unit: first_unit as u16,
            unit_count: unit_count as u16,
            virtual_medium_size: virtual_size as u32,
            direct_addressing_memory: params.direct_addressing_memory,
            map_pages: map_pages as u16,
            flags: 0,
            check: 0,
            serial_number: params.serial_number,
            bat_offset,
            descriptor: params.embedded_descriptor.clone(),
        };
        header.seal();
        let geometry = VolumeGeometry::from_header(&header, &flash)?;

        for unit in 0..unit_count {
            let base = geometry.unit_base(unit);
            let wear = read_header(&media, base, unit_size)
                .map_or(1, |old| old.wear_level.saturating_add(1));

            media.erase(geometry.first_block_of(unit), geometry.blocks_per_unit())?;

            header.wear_level = wear;
            header.logical_unit = if unit < logical_units {
                unit as u16
            } else {
                UNASSIGNED_UNIT
            };
            media.write(base, &format_image(&header, &geometry), true)?;
        }

        // Empty map pages: erased payload reads as all entries unassigned
        let data_sectors = geometry.data_sectors_per_unit();
        let needed = (0..map_pages).filter(|&page| geometry.page_needed(page));
        for (slot, page) in needed.enumerate() {
            let slot = slot as u32;
            let unit = slot / data_sectors;
            let sector = format_sectors + slot % data_sectors;
            let entry = BatEntry::Data {
                vsector: page,
                tentative: false,
            };
            media.write(
                geometry.unit_base(unit) + geometry.bat_entry_offset(sector),
                &entry.encode(sector_bits).to_le_bytes(),
                false,
            )?;
        }

        info!(
            "Formatted {} units of {} KiB: {} virtual sectors, {} map pages, {} spares",
            unit_count,
            unit_size / 1024,
            virtual_sectors,
            map_pages,
            spare_units
        );
        Ok(media)
    }
}

/// Record data sector `vsector` found at `address`; a committed copy beats a
/// tentative one, two committed copies mean the volume is corrupt
fn resolve_direct(
    direct: &mut [Option<(u32, bool)>],
    repairs: &mut Repairs,
    vsector: u32,
    address: u32,
    tentative: bool,
) -> Result<()> {
    let slot = &mut direct[vsector as usize];
    match (*slot, tentative) {
        (None, _) => *slot = Some((address, tentative)),
        (Some((previous, false)), false) => {
            error!(
                "Sector {} committed at both {:#x} and {:#x}",
                vsector, previous, address
            );
            return Err(FtlError::BadFormat);
        }
        (Some((previous, true)), false) => {
            repairs.discard.push(previous);
            *slot = Some((address, false));
        }
        (Some(_), true) => repairs.discard.push(address),
    }
    Ok(())
}
