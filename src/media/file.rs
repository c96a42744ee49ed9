//! Flash image backed by a memory-mapped file
//!
//! Same NOR semantics as the RAM backend, but the array survives the process,
//! which makes it convenient for inspecting images and for remount tests that
//! reopen the file.

use super::{check_range, FlashGeometry, FlashMedia};
use crate::error::{FtlError, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct FileFlash {
    map: MmapMut,
    geometry: FlashGeometry,
    path: PathBuf,
    _file: File,
}

impl FileFlash {
    /// Create a new, fully erased flash image
    pub fn create<P: AsRef<Path>>(path: P, geometry: FlashGeometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(geometry.total_size())?;

        let mut flash = Self::map_file(file, path.as_ref(), geometry)?;
        flash.map.fill(0xFF);
        flash.map.flush()?;
        Ok(flash)
    }

    /// Open an existing flash image; its size must match the geometry
    pub fn open<P: AsRef<Path>>(path: P, geometry: FlashGeometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let len = file.metadata()?.len();
        if len != geometry.total_size() {
            return Err(FtlError::InvalidParameter(format!(
                "flash image {} is {} bytes, geometry needs {}",
                path.as_ref().display(),
                len,
                geometry.total_size()
            )));
        }

        Self::map_file(file, path.as_ref(), geometry)
    }

    fn map_file(file: File, path: &Path, geometry: FlashGeometry) -> Result<Self> {
        // SAFETY: the file is opened read-write by this process and the
        // mapping never outlives it; concurrent external modification is
        // outside the media contract.
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(FileFlash {
            map,
            geometry,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the mapping to disk
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl FlashMedia for FileFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let range = check_range(self.map.len(), address, buf.len())?;
        buf.copy_from_slice(&self.map[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8], _overwrite: bool) -> Result<()> {
        let range = check_range(self.map.len(), address, data.len())?;
        for (cell, &new) in self.map[range].iter_mut().zip(data) {
            *cell &= new;
        }
        Ok(())
    }

    fn erase(&mut self, first_block: u32, block_count: u32) -> Result<()> {
        let block_size = self.geometry.erase_block_size as usize;
        let start = first_block as usize * block_size;
        let range = check_range(self.map.len(), start as u32, block_count as usize * block_size)?;
        self.map[range].fill(0xFF);
        Ok(())
    }

    fn map(&self, address: u32, len: usize) -> Result<&[u8]> {
        let range = check_range(self.map.len(), address, len)?;
        Ok(&self.map[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            chip_count: 1,
            chip_size: 4 * 4096,
            erase_block_size: 4096,
        }
    }

    #[test]
    fn test_create_is_erased() {
        let temp = NamedTempFile::new().unwrap();
        let flash = FileFlash::create(temp.path(), geometry()).unwrap();
        assert!(flash.map(0, 16384).unwrap().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_write_and_reopen() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();

        {
            let mut flash = FileFlash::create(&path, geometry()).unwrap();
            flash.write(100, b"nor", false).unwrap();
            flash.sync().unwrap();
        }

        let mut flash = FileFlash::open(&path, geometry()).unwrap();
        let mut buf = [0u8; 3];
        flash.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"nor");
    }

    #[test]
    fn test_and_semantics_and_erase() {
        let temp = NamedTempFile::new().unwrap();
        let mut flash = FileFlash::create(temp.path(), geometry()).unwrap();

        flash.write(4096, &[0x0F], false).unwrap();
        flash.write(4096, &[0xF1], false).unwrap();
        assert_eq!(flash.map(4096, 1).unwrap(), &[0x01]);

        flash.erase(1, 1).unwrap();
        assert_eq!(flash.map(4096, 1).unwrap(), &[0xFF]);
    }

    #[test]
    fn test_open_rejects_wrong_size() {
        let temp = NamedTempFile::new().unwrap();
        FileFlash::create(temp.path(), geometry()).unwrap();

        let mut bigger = geometry();
        bigger.chip_size *= 2;
        assert!(matches!(
            FileFlash::open(temp.path(), bigger),
            Err(FtlError::InvalidParameter(_))
        ));
    }
}
