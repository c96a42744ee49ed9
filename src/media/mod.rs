//! Flash media driver interface
//!
//! The translation layer only ever talks to flash through [`FlashMedia`]:
//! byte-level reads and writes, block-granular erase, and a zero-copy `map`
//! used by the read path. Two backends ship with the crate:
//!
//! - [`ram::RamFlash`] - in-memory NOR simulation with fault injection
//! - [`file::FileFlash`] - flash image in a memory-mapped file

pub mod file;
pub mod ram;

use crate::error::Result;

/// Geometry reported by the media driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    pub chip_count: u32,
    pub chip_size: u32,
    /// Smallest erasable region in bytes
    pub erase_block_size: u32,
}

impl FlashGeometry {
    pub fn total_size(&self) -> u64 {
        self.chip_count as u64 * self.chip_size as u64
    }

    pub fn total_blocks(&self) -> u32 {
        (self.total_size() / self.erase_block_size as u64) as u32
    }
}

/// NOR flash driver
///
/// Writes can only clear bits. `overwrite` marks a write into a region that
/// was just erased, for drivers that program faster when told so.
pub trait FlashMedia {
    fn geometry(&self) -> FlashGeometry;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, address: u32, data: &[u8], overwrite: bool) -> Result<()>;

    /// Erase `block_count` erase blocks starting at `first_block`
    fn erase(&mut self, first_block: u32, block_count: u32) -> Result<()>;

    /// Read-only view of flash content without copying
    fn map(&self, address: u32, len: usize) -> Result<&[u8]>;

    /// Returns true once after the driver remapped content underneath the
    /// caller, which must drop any cached physical addresses.
    fn take_remapped(&mut self) -> bool {
        false
    }
}

impl<M: FlashMedia + ?Sized> FlashMedia for &mut M {
    fn geometry(&self) -> FlashGeometry {
        (**self).geometry()
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn write(&mut self, address: u32, data: &[u8], overwrite: bool) -> Result<()> {
        (**self).write(address, data, overwrite)
    }

    fn erase(&mut self, first_block: u32, block_count: u32) -> Result<()> {
        (**self).erase(first_block, block_count)
    }

    fn map(&self, address: u32, len: usize) -> Result<&[u8]> {
        (**self).map(address, len)
    }

    fn take_remapped(&mut self) -> bool {
        (**self).take_remapped()
    }
}

/// Bounds check shared by the bundled backends
pub(crate) fn check_range(total: usize, address: u32, len: usize) -> Result<std::ops::Range<usize>> {
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= total => Ok(start..end),
        _ => Err(crate::error::FtlError::InvalidParameter(format!(
            "flash access {:#x}+{} beyond media size {:#x}",
            address, len, total
        ))),
    }
}
