//! Garbage collection and unit transfer
//!
//! A transfer copies the live sectors of one logical unit into a spare and
//! moves the logical identity over as its very last write:
//!
//! ```text
//! Prepare   format target if needed, stamp it MARKED_FOR_ERASE
//! CopyBat   BAT in sector-sized chunks, dead slots become FREE
//! CopyData  live payloads, one sector per step
//! Assign    write the logical unit number into the target
//! Erase     erase the old unit block by block, then write a spare header
//! ```
//!
//! The same steps run inline for a foreground collection or one at a time
//! from [`Volume::run_background_step`]. While a transfer is in flight,
//! foreground writes into the already copied range of the source are
//! mirrored onto the target (see [`MirrorWindow`]).

use super::{UnitState, Volume};
use crate::bat::{raw_entry, BatEntry, FORMAT_SECTOR};
use crate::error::{FtlError, Result};
use crate::header::MARKED_FOR_ERASE;
use crate::media::FlashMedia;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Collections in a row that may fail to free anything before giving up
const MAX_STALLED_COLLECTIONS: u32 = 4;

/// Byte range `[from, to)` of a unit under transfer whose content already
/// exists on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorWindow {
    pub logical_unit: u32,
    pub target_unit: u32,
    pub from: u32,
    pub to: u32,
}

impl MirrorWindow {
    pub fn contains(&self, logical_unit: u32, offset: u32) -> bool {
        logical_unit == self.logical_unit && offset >= self.from && offset < self.to
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}

/// Public view of the background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackgroundState {
    Idle,
    /// Collection requested, nothing touched yet
    Pending,
    Transferring { source_unit: u32, window: MirrorWindow },
    Erasing { unit: u32, next_block: u32 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Job {
    Pending,
    Transfer(TransferJob),
    Erase(EraseJob),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferJob {
    source: u32,
    target: u32,
    phase: TransferPhase,
    pub(crate) window: MirrorWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferPhase {
    Prepare,
    CopyBat(u32),
    CopyData(u32),
    Assign,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EraseJob {
    unit: u32,
    next_block: u32,
}

impl<M: FlashMedia> Volume<M> {
    /// Logical unit to reclaim: the one with most garbage (ties: least worn),
    /// or the least worn one outright
    pub(crate) fn best_unit_to_transfer(&self, prefer_most_garbage: bool) -> Option<u32> {
        let candidates = self.units.iter().filter_map(|info| match info.state {
            UnitState::Logical(lu) => Some((lu, info)),
            _ => None,
        });

        if prefer_most_garbage {
            candidates
                .filter(|(_, info)| info.garbage > 0)
                .max_by(|(_, a), (_, b)| a.garbage.cmp(&b.garbage).then(b.wear.cmp(&a.wear)))
                .map(|(lu, _)| lu)
        } else {
            candidates
                .min_by(|(_, a), (_, b)| a.wear.cmp(&b.wear).then(b.garbage.cmp(&a.garbage)))
                .map(|(lu, _)| lu)
        }
    }

    /// Spare units, ready ones first, least worn first
    fn spare_candidates(&self) -> Vec<u32> {
        let mut spares: Vec<u32> = (0..self.units.len() as u32)
            .filter(|&unit| self.units[unit as usize].is_spare())
            .collect();
        spares.sort_by_key(|&unit| {
            let info = &self.units[unit as usize];
            (info.state != UnitState::Spare, info.wear)
        });
        spares
    }

    /// A logical unit other than `exclude` with nothing but garbage in it
    fn fully_garbage_unit(&self, exclude: u32) -> Option<u32> {
        let data_sectors = self.geometry.data_sectors_per_unit();
        self.units.iter().find_map(|info| match info.state {
            UnitState::Logical(lu) if lu != exclude && info.garbage == data_sectors => Some(lu),
            _ => None,
        })
    }

    /// Source for the next collection. The wear-leveling policy is only
    /// drawn when `wear_leveling` allows it.
    fn pick_source(&mut self, wear_leveling: bool) -> Option<u32> {
        let ratio = self.options.wear_leveling_ratio;
        let wear_leveling = wear_leveling && ratio > 0 && self.rng.gen_ratio(1, ratio);
        if wear_leveling {
            debug!("Collection cycle uses the wear-leveling policy");
        }
        self.best_unit_to_transfer(!wear_leveling)
            .or_else(|| self.best_unit_to_transfer(true))
    }

    /// Reclaim one unit. Without `wear_leveling` the unit with the most
    /// garbage is always chosen.
    pub(crate) fn garbage_collect(&mut self, wear_leveling: bool) -> Result<()> {
        self.finish_started_job()?;
        if matches!(self.job, Some(Job::Pending)) {
            self.job = None;
        }

        let spares = self.spare_candidates();
        if spares.is_empty() {
            warn!("No spare unit left, volume is write protected");
            return Err(FtlError::WriteProtect);
        }

        let Some(source) = self.pick_source(wear_leveling) else {
            return Err(FtlError::GeneralFailure(
                "no unit holds reclaimable garbage".to_string(),
            ));
        };

        match self.transfer_to_any_spare(&spares, source) {
            Err(e) if e.is_write_fault() => {
                let Some(fallback) = self.fully_garbage_unit(source) else {
                    return Err(e);
                };
                warn!(
                    "Transfer of logical unit {} failed, reclaiming fully garbage unit {}",
                    source, fallback
                );
                let spares = self.spare_candidates();
                self.transfer_to_any_spare(&spares, fallback)
            }
            result => result,
        }
    }

    fn transfer_to_any_spare(&mut self, spares: &[u32], logical_unit: u32) -> Result<()> {
        let mut last_error = FtlError::WriteProtect;
        for &target in spares {
            match self.unit_transfer(target, logical_unit) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_write_fault() => {
                    warn!("Spare unit {} failed: {}, trying the next one", target, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Move `logical_unit` into spare unit `target` and recycle its old unit
    pub(crate) fn unit_transfer(&mut self, target: u32, logical_unit: u32) -> Result<()> {
        let Some(source) = self.unit_of_logical(logical_unit) else {
            return Err(FtlError::GeneralFailure(format!(
                "logical unit {} is not mapped",
                logical_unit
            )));
        };

        self.finish_started_job()?;
        self.job = Some(Job::Transfer(self.new_transfer(source, target, logical_unit)));
        while matches!(self.job, Some(Job::Transfer(_))) {
            self.step_job()?;
        }

        // The identity has moved; a failed erase only leaves an extra spare
        // that needs formatting
        if let Err(e) = self.finish_started_job() {
            warn!("Recycling unit {} failed: {}", source, e);
        }
        Ok(())
    }

    fn new_transfer(&self, source: u32, target: u32, logical_unit: u32) -> TransferJob {
        let from = self.geometry.bat_offset;
        TransferJob {
            source,
            target,
            phase: TransferPhase::Prepare,
            window: MirrorWindow {
                logical_unit,
                target_unit: target,
                from,
                to: from,
            },
        }
    }

    /// Collect until at least `min_free` sectors are free
    ///
    /// Also runs one opportunistic collection when free space is below the
    /// low-water mark, inline or as a background job. Required space always
    /// comes from the units with most garbage; only the opportunistic pass
    /// may pick a unit for wear leveling. Returns the free count.
    pub fn defragment(&mut self, min_free: u32) -> Result<u32> {
        self.check_status()?;

        let mut stalled = 0;
        while self.total_free < min_free {
            if self.job_started() {
                self.finish_started_job()?;
                continue;
            }

            if self.total_garbage() == 0 {
                return Err(FtlError::GeneralFailure(format!(
                    "volume full: {} free sectors, {} needed",
                    self.total_free, min_free
                )));
            }

            let before = self.total_free;
            self.garbage_collect(false)?;
            if self.total_free <= before {
                stalled += 1;
                if stalled >= MAX_STALLED_COLLECTIONS {
                    return Err(FtlError::GeneralFailure(format!(
                        "collection made no progress after {} attempts",
                        stalled
                    )));
                }
            }
        }

        if self.total_free < self.options.low_water_mark && self.total_garbage() > 0 {
            if self.options.background_collect {
                self.schedule_background_collect();
            } else if self.job.is_none() {
                if let Err(e) = self.garbage_collect(true) {
                    debug!("Opportunistic collection skipped: {}", e);
                }
            }
        }

        Ok(self.total_free)
    }

    /// Queue a background collection. Returns false if a job already exists.
    pub fn schedule_background_collect(&mut self) -> bool {
        if self.job.is_some() {
            return false;
        }
        debug!("Background collection scheduled");
        self.job = Some(Job::Pending);
        true
    }

    /// Drop a collection that has not started. Started jobs cannot be
    /// cancelled since an erase cannot be aborted.
    pub fn cancel_background(&mut self) -> bool {
        if matches!(self.job, Some(Job::Pending)) {
            self.job = None;
            true
        } else {
            false
        }
    }

    /// Advance the background job by one step. Returns true while work remains.
    pub fn run_background_step(&mut self) -> Result<bool> {
        self.check_status()?;
        if self.suspend_depth > 0 {
            return Ok(self.job.is_some());
        }
        self.step_job()
    }

    pub fn background_state(&self) -> BackgroundState {
        match &self.job {
            None => BackgroundState::Idle,
            Some(Job::Pending) => BackgroundState::Pending,
            Some(Job::Transfer(t)) => BackgroundState::Transferring {
                source_unit: t.source,
                window: t.window,
            },
            Some(Job::Erase(e)) => BackgroundState::Erasing {
                unit: e.unit,
                next_block: e.next_block,
            },
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    fn job_started(&self) -> bool {
        matches!(self.job, Some(Job::Transfer(_)) | Some(Job::Erase(_)))
    }

    /// Run a transfer or erase already under way to completion
    pub(crate) fn finish_started_job(&mut self) -> Result<()> {
        while self.job_started() {
            self.step_job()?;
        }
        Ok(())
    }

    /// A write is about to hit `physical`; an erase on the same chip must finish first
    pub(crate) fn finish_erase_on_chip(&mut self, physical: u32) -> Result<()> {
        let Some(Job::Erase(erase)) = self.job else {
            return Ok(());
        };
        let erasing = self.geometry.chip_of(self.geometry.unit_base(erase.unit));
        if erasing != self.geometry.chip_of(physical) {
            return Ok(());
        }

        debug!("Write to chip {} finishes the background erase first", erasing);
        while matches!(self.job, Some(Job::Erase(_))) {
            self.step_job()?;
        }
        Ok(())
    }

    /// One step of whatever job is queued. A failed step drops the job.
    fn step_job(&mut self) -> Result<bool> {
        let Some(job) = self.job.take() else {
            return Ok(false);
        };

        self.job = match job {
            Job::Pending => self.start_collect()?,
            Job::Transfer(transfer) => self.step_transfer(transfer)?,
            Job::Erase(erase) => self.step_erase(erase)?,
        };
        Ok(self.job.is_some())
    }

    fn start_collect(&mut self) -> Result<Option<Job>> {
        let spares = self.spare_candidates();
        let Some(&target) = spares.first() else {
            warn!("No spare unit left, background collection dropped");
            return Err(FtlError::WriteProtect);
        };

        match self.pick_source(true) {
            Some(logical_unit) => {
                let Some(source) = self.unit_of_logical(logical_unit) else {
                    return Ok(None);
                };
                Ok(Some(Job::Transfer(self.new_transfer(source, target, logical_unit))))
            }
            None => Ok(None),
        }
    }

    fn step_transfer(&mut self, mut t: TransferJob) -> Result<Option<Job>> {
        let spu = self.geometry.sectors_per_unit;
        let sector_size = self.geometry.sector_size();

        match t.phase {
            TransferPhase::Prepare => {
                let source_wear = self.units[t.source as usize].wear;
                let target = self.units[t.target as usize];
                // The target must out-wear the source so a duplicate identity
                // left by an interrupted recycle resolves in its favour
                if target.state == UnitState::NeedsFormat || target.wear <= source_wear {
                    self.format_unit(t.target)?;
                }
                self.units[t.target as usize].state = UnitState::NeedsFormat;
                self.assign_unit(t.target, MARKED_FOR_ERASE)?;
                t.phase = TransferPhase::CopyBat(0);
            }
            TransferPhase::CopyBat(next) => {
                let chunk = (sector_size / 4).min(spu - next);
                let offset = self.geometry.bat_entry_offset(next);
                let len = chunk as usize * 4;
                let bits = self.geometry.sector_bits;
                let format_sectors = self.geometry.format_sectors;

                let source = self.media.map(self.geometry.unit_base(t.source) + offset, len)?;
                for i in 0..chunk as usize {
                    let sector = next + i as u32;
                    let raw = if sector < format_sectors {
                        FORMAT_SECTOR
                    } else {
                        BatEntry::decode(raw_entry(source, i), bits)
                            .for_transfer()
                            .encode(bits)
                    };
                    self.copy_buffer[i * 4..i * 4 + 4].copy_from_slice(&raw.to_le_bytes());
                }
                self.media.write(
                    self.geometry.unit_base(t.target) + offset,
                    &self.copy_buffer[..len],
                    false,
                )?;

                t.window.to = self.geometry.bat_entry_offset(next + chunk);
                t.phase = if next + chunk >= spu {
                    TransferPhase::CopyData(format_sectors)
                } else {
                    TransferPhase::CopyBat(next + chunk)
                };
            }
            TransferPhase::CopyData(next) => {
                let mut sector = next;
                while sector < spu {
                    let live = self.bat_entry(t.source, sector)?.is_live();
                    let offset = sector * sector_size;
                    sector += 1;
                    if live {
                        self.media
                            .read(self.geometry.unit_base(t.source) + offset, &mut self.copy_buffer)?;
                        self.media.write(
                            self.geometry.unit_base(t.target) + offset,
                            &self.copy_buffer,
                            false,
                        )?;
                        break;
                    }
                }

                t.window.to = sector * sector_size;
                t.phase = if sector >= spu {
                    TransferPhase::Assign
                } else {
                    TransferPhase::CopyData(sector)
                };
            }
            TransferPhase::Assign => {
                return self.complete_transfer(&t).map(Some);
            }
        }

        Ok(Some(Job::Transfer(t)))
    }

    fn complete_transfer(&mut self, t: &TransferJob) -> Result<Job> {
        let logical_unit = t.window.logical_unit;
        self.assign_unit(t.target, logical_unit as u16)?;

        let (free, garbage) = self.count_unit(t.target)?;
        let source = self.units[t.source as usize];
        self.total_free = self.total_free + free - source.free;

        let target = &mut self.units[t.target as usize];
        target.state = UnitState::Logical(logical_unit);
        target.free = free;
        target.garbage = garbage;

        let old = &mut self.units[t.source as usize];
        old.state = UnitState::NeedsFormat;
        old.free = 0;
        old.garbage = 0;

        self.logical_to_physical[logical_unit as usize] = t.target;
        self.last_mapped = None;
        self.transfers += 1;

        info!(
            "Logical unit {} moved from unit {} to unit {}, reclaimed {} sectors",
            logical_unit,
            t.source,
            t.target,
            source.garbage
        );

        Ok(Job::Erase(EraseJob {
            unit: t.source,
            next_block: 0,
        }))
    }

    fn step_erase(&mut self, mut e: EraseJob) -> Result<Option<Job>> {
        if e.next_block < self.geometry.blocks_per_unit() {
            self.units[e.unit as usize].state = UnitState::NeedsFormat;
            self.media
                .erase(self.geometry.first_block_of(e.unit) + e.next_block, 1)?;
            e.next_block += 1;
            return Ok(Some(Job::Erase(e)));
        }

        self.write_unit_header(e.unit)?;
        Ok(None)
    }
}
