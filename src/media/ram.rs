//! In-memory NOR flash
//!
//! Behaves like real NOR: erase sets every bit of a block, writes AND new data
//! into old content. Any write that would need to set a cleared bit is counted
//! as a violation (and, like the hardware, silently leaves the bit cleared).
//!
//! Two kinds of fault injection support the power-loss and retry tests:
//!
//! - [`RamFlash::power_cut_after`] lets `n` more program/erase operations
//!   succeed, then fails every later one without touching the array
//! - [`RamFlash::inject_write_faults`] fails the next `n` writes, then recovers

use super::{check_range, FlashGeometry, FlashMedia};
use crate::error::{FtlError, Result};
use tracing::trace;

pub struct RamFlash {
    data: Vec<u8>,
    geometry: FlashGeometry,
    erase_counts: Vec<u32>,
    bit_violations: usize,
    power_budget: Option<usize>,
    transient_faults: usize,
    program_ops: usize,
    remapped: bool,
}

impl RamFlash {
    /// Fully erased flash
    pub fn new(geometry: FlashGeometry) -> Self {
        let size = geometry.total_size() as usize;
        RamFlash {
            data: vec![0xFF; size],
            geometry,
            erase_counts: vec![0; geometry.total_blocks() as usize],
            bit_violations: 0,
            power_budget: None,
            transient_faults: 0,
            program_ops: 0,
            remapped: false,
        }
    }

    /// Single chip of `block_count` erase blocks
    pub fn with_blocks(erase_block_size: u32, block_count: u32) -> Self {
        Self::new(FlashGeometry {
            chip_count: 1,
            chip_size: erase_block_size * block_count,
            erase_block_size,
        })
    }

    /// Flash holding a previously captured image, e.g. after a simulated power cut
    pub fn from_image(geometry: FlashGeometry, image: Vec<u8>) -> Result<Self> {
        if image.len() as u64 != geometry.total_size() {
            return Err(FtlError::InvalidParameter(format!(
                "image is {} bytes, geometry needs {}",
                image.len(),
                geometry.total_size()
            )));
        }
        let mut flash = Self::new(geometry);
        flash.data = image;
        Ok(flash)
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Fresh flash with the same content and geometry, power restored
    pub fn snapshot(&self) -> RamFlash {
        let mut flash = RamFlash::new(self.geometry);
        flash.data = self.data.clone();
        flash.erase_counts = self.erase_counts.clone();
        flash
    }

    pub fn power_cut_after(&mut self, operations: usize) {
        self.power_budget = Some(operations);
    }

    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    pub fn is_powered_off(&self) -> bool {
        self.power_budget == Some(0)
    }

    pub fn inject_write_faults(&mut self, count: usize) {
        self.transient_faults = count;
    }

    pub fn bit_violations(&self) -> usize {
        self.bit_violations
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.erase_counts.get(block as usize).copied().unwrap_or(0)
    }

    /// Successful writes and erases so far
    pub fn program_ops(&self) -> usize {
        self.program_ops
    }

    /// Simulate a driver-level remap, as reported through `take_remapped`
    pub fn signal_remap(&mut self) {
        self.remapped = true;
    }

    /// Corrupt raw content, bypassing NOR semantics
    pub fn poke(&mut self, address: u32, bytes: &[u8]) {
        let start = address as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn consume_operation(&mut self) -> Result<()> {
        match self.power_budget {
            Some(0) => return Err(FtlError::WriteFault),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        Ok(())
    }
}

impl FlashMedia for RamFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let range = check_range(self.data.len(), address, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8], _overwrite: bool) -> Result<()> {
        let range = check_range(self.data.len(), address, data.len())?;

        if self.transient_faults > 0 {
            self.transient_faults -= 1;
            trace!("Injected write fault at {:#x}", address);
            return Err(FtlError::WriteFault);
        }
        self.consume_operation()?;

        for (cell, &new) in self.data[range].iter_mut().zip(data) {
            if new & !*cell != 0 {
                self.bit_violations += 1;
            }
            *cell &= new;
        }

        self.program_ops += 1;
        Ok(())
    }

    fn erase(&mut self, first_block: u32, block_count: u32) -> Result<()> {
        let block_size = self.geometry.erase_block_size as usize;
        let start = first_block as usize * block_size;
        let range = check_range(self.data.len(), start as u32, block_count as usize * block_size)?;

        self.consume_operation()?;

        self.data[range].fill(0xFF);
        for block in first_block..first_block + block_count {
            self.erase_counts[block as usize] += 1;
        }

        self.program_ops += 1;
        Ok(())
    }

    fn map(&self, address: u32, len: usize) -> Result<&[u8]> {
        let range = check_range(self.data.len(), address, len)?;
        Ok(&self.data[range])
    }

    fn take_remapped(&mut self) -> bool {
        std::mem::take(&mut self.remapped)
    }
}
