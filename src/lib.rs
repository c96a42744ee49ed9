//! # flashxlat - NOR Flash Translation Layer
//!
//! Makes raw NOR flash (erase before write, block-granular erase, writes that
//! can only clear bits) look like a randomly writable block device that
//! survives power loss at any instant.
//!
//! ## Features
//!
//! - **Log-structured sectors**: every rewrite lands in a fresh slot, the old
//!   one becomes garbage
//! - **Power-loss safe**: all metadata updates only clear bits, and mount
//!   repairs whatever an interruption left behind
//! - **Garbage collection** by unit transfer, inline or stepped in the
//!   background with foreground writes mirrored onto the target
//! - **Wear leveling**: spares are stamped with a rising wear count and worn
//!   units lose ties
//! - **Pluggable media**: [`RamFlash`] for tests and simulation, [`FileFlash`]
//!   for memory-mapped image files, or any [`FlashMedia`] driver
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Volume: map_sector / write_sector / delete    │
//! ├────────────────────────────────────────────────┤
//! │  translate │ map + replacement │ alloc │ gc    │
//! ├────────────────────────────────────────────────┤
//! │  header codec │ BAT codec │ geometry           │
//! ├────────────────────────────────────────────────┤
//! │  FlashMedia (RamFlash, FileFlash, driver)      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use flashxlat::{FormatParams, MountOptions, RamFlash, Result, Volume};
//!
//! # fn main() -> Result<()> {
//! let flash = RamFlash::with_blocks(64 * 1024, 16);
//! let flash = Volume::format(flash, &FormatParams::default())?;
//!
//! let mut volume = Volume::mount(flash, MountOptions::default())?;
//! let sector = vec![0x42; volume.sector_size() as usize];
//! volume.write_sector(7, &sector)?;
//! assert_eq!(volume.map_sector(7)?, &sector[..]);
//!
//! volume.delete_sector(7, 1)?;
//! let flash = volume.dismount();
//! # drop(flash);
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod bat;
pub mod config;
pub mod error;
pub mod geometry;
pub mod header;
pub mod map_cache;
pub mod media;
pub mod volume;

pub use background::Collector;
pub use config::{FormatParams, MountOptions};
pub use error::{FtlError, Result};
pub use geometry::VolumeGeometry;
pub use media::file::FileFlash;
pub use media::ram::RamFlash;
pub use media::{FlashGeometry, FlashMedia};
pub use volume::{
    check_for_write_inplace, BackgroundState, MirrorWindow, Volume, VolumeStats, VolumeStatus,
};
