//! Mounted flash volume
//!
//! A [`Volume`] owns the media and every in-memory table rebuilt at mount:
//!
//! ```text
//! caller sector ──(+ map pages)──► internal vsector
//!                                      │
//!            ┌─────────────────────────┴──────────────────────┐
//!            │ < direct_sectors                               │ >= direct_sectors
//!            ▼                                                ▼
//!     direct page table                          virtual map page (LRU cached)
//!            │                                  └─► replacement page when DELETED
//!            └───────────────► logical address ◄──────────────┘
//!                                      │
//!                      logical unit ──► physical unit ──► byte offset
//! ```
//!
//! The implementation is split by concern:
//!
//! - `translate` - address translation and the read path
//! - `unit` - unit headers and BAT entries
//! - `map` - virtual map updates and the replacement page
//! - `alloc` - sector allocation
//! - `gc` - garbage collection, unit transfer and the background job
//! - `write` - write and delete paths
//! - `mount` - mount and format

mod alloc;
mod gc;
mod map;
mod mount;
mod translate;
mod unit;
mod write;

pub use gc::{BackgroundState, MirrorWindow};
pub use write::check_for_write_inplace;

use crate::config::MountOptions;
use crate::error::{FtlError, Result};
use crate::geometry::VolumeGeometry;
use crate::header::UnitHeader;
use crate::map_cache::MapPageCache;
use crate::media::FlashMedia;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{info, warn};

/// Marks a logical unit that no physical unit holds
pub(crate) const NO_UNIT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitState {
    /// Holds the given logical unit
    Logical(u32),
    /// Erased and headered, ready to receive a transfer
    Spare,
    /// Spare that must be formatted before use
    NeedsFormat,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitInfo {
    pub state: UnitState,
    pub free: u32,
    pub garbage: u32,
    pub wear: u32,
}

impl UnitInfo {
    pub(crate) fn unformatted() -> Self {
        UnitInfo {
            state: UnitState::NeedsFormat,
            free: 0,
            garbage: 0,
            wear: 0,
        }
    }

    pub(crate) fn is_spare(&self) -> bool {
        matches!(self.state, UnitState::Spare | UnitState::NeedsFormat)
    }
}

/// The open replacement page: which map page it shadows and where it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplacementPage {
    pub page: u32,
    pub address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumeStatus {
    Mounted,
    /// Consistency checks failed at mount; every operation is refused
    BadFormat,
}

/// Volume statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub virtual_sectors: u32,
    pub sector_size: u32,
    pub logical_units: u32,
    pub spare_units: u32,
    pub free_sectors: u32,
    pub garbage_sectors: u32,
    pub max_wear: u32,
    pub transfers: u64,
    pub map_cache_hits: u64,
    pub map_cache_misses: u64,
    pub replacement_open: bool,
    pub status: VolumeStatus,
}

pub struct Volume<M: FlashMedia> {
    media: M,
    geometry: VolumeGeometry,
    /// Header of the first valid unit; identity fields are rewritten per unit
    template: UnitHeader,
    units: Vec<UnitInfo>,
    logical_to_physical: Vec<u32>,
    direct: Vec<u32>,
    replacement: Option<ReplacementPage>,
    map_cache: MapPageCache,
    /// Sector-sized staging buffer for unit transfers
    copy_buffer: Vec<u8>,
    total_free: u32,
    max_wear: u32,
    /// One-entry read cache: (caller sector, physical address)
    last_mapped: Option<(u32, u32)>,
    status: VolumeStatus,
    rng: StdRng,
    options: MountOptions,
    job: Option<gc::Job>,
    suspend_depth: u32,
    transfers: u64,
}

impl<M: FlashMedia> Volume<M> {
    /// Caller-visible sector count
    pub fn sectors_in_volume(&self) -> u32 {
        self.geometry.virtual_sectors
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size()
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn status(&self) -> VolumeStatus {
        self.status
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    /// Free sectors across all logical units
    pub fn free_sectors(&self) -> u32 {
        self.total_free
    }

    pub fn spare_units(&self) -> u32 {
        self.units.iter().filter(|u| u.is_spare()).count() as u32
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            virtual_sectors: self.geometry.virtual_sectors,
            sector_size: self.geometry.sector_size(),
            logical_units: self.geometry.logical_units,
            spare_units: self.spare_units(),
            free_sectors: self.total_free,
            garbage_sectors: self.total_garbage(),
            max_wear: self.max_wear,
            transfers: self.transfers,
            map_cache_hits: self.map_cache.hits(),
            map_cache_misses: self.map_cache.misses(),
            replacement_open: self.replacement.is_some(),
            status: self.status,
        }
    }

    /// Suspend (`true`) or resume (`false`) background stepping. Calls nest.
    pub fn set_busy(&mut self, busy: bool) {
        if busy {
            self.suspend_depth += 1;
        } else {
            self.suspend_depth = self.suspend_depth.saturating_sub(1);
        }
    }

    /// Release the media. A background job that already touched the media is
    /// run to completion first; a pending one is dropped.
    pub fn dismount(mut self) -> M {
        if self.status == VolumeStatus::Mounted {
            if let Err(e) = self.finish_started_job() {
                warn!("Background job failed during dismount: {}", e);
            }
        }
        self.job = None;
        info!("Volume dismounted after {} unit transfers", self.transfers);
        self.media
    }

    pub(crate) fn check_status(&self) -> Result<()> {
        match self.status {
            VolumeStatus::Mounted => Ok(()),
            VolumeStatus::BadFormat => Err(FtlError::BadFormat),
        }
    }

    pub(crate) fn total_garbage(&self) -> u32 {
        self.units
            .iter()
            .filter(|u| matches!(u.state, UnitState::Logical(_)))
            .map(|u| u.garbage)
            .sum()
    }

    fn unit_of_logical(&self, logical_unit: u32) -> Option<u32> {
        self.logical_to_physical
            .get(logical_unit as usize)
            .copied()
            .filter(|&unit| unit != NO_UNIT)
    }
}
