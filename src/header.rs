//! Erase unit header codec
//!
//! Every formatted erase unit starts with this header. All fields except the
//! wear counter and the logical unit number are identical across a volume, so
//! the whole geometry can be recovered from any single valid unit.
//!
//! # Layout (little-endian)
//!
//! ```text
//! 0   [15] format signature
//! 15  u8   spare transfer unit count
//! 16  u32  wear-leveling counter
//! 20  u16  logical unit number
//! 22  u8   log2 sector size
//! 23  u8   log2 unit size
//! 24  u16  first physical unit
//! 26  u16  formatted unit count
//! 28  u32  virtual volume size in bytes
//! 32  u32  direct addressing memory in bytes
//! 36  u16  map page count
//! 38  u8   flags
//! 39  u8   check byte
//! 40  u32  serial number
//! 44  u32  BAT offset
//! 48  u16  embedded descriptor length
//! 50  [10] reserved
//! 60  [n]  embedded descriptor
//! ```

use crate::error::{FtlError, Result};

pub const SIGNATURE: [u8; 15] = *b"FTLITE\x00\x01\x00VOLUME";

/// Fixed part of the header, before the embedded descriptor
pub const HEADER_FIXED_LEN: usize = 60;

/// Logical unit number of a formatted spare
pub const UNASSIGNED_UNIT: u16 = 0xFFFF;

/// Transient logical unit number of a transfer target; clears only bit 15 of
/// [`UNASSIGNED_UNIT`] so the final identity can still be written in place.
pub const MARKED_FOR_ERASE: u16 = 0x7FFF;

pub const LOGICAL_UNIT_OFFSET: usize = 20;

const WEAR_OFFSET: usize = 16;
const CHECK_OFFSET: usize = 39;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHeader {
    pub signature: [u8; 15],
    pub transfer_units: u8,
    pub wear_level: u32,
    pub logical_unit: u16,
    pub log2_sector_size: u8,
    pub log2_unit_size: u8,
    pub first_physical_unit: u16,
    pub unit_count: u16,
    pub virtual_medium_size: u32,
    pub direct_addressing_memory: u32,
    pub map_pages: u16,
    pub flags: u8,
    pub check: u8,
    pub serial_number: u32,
    pub bat_offset: u32,
    pub descriptor: Vec<u8>,
}

impl UnitHeader {
    /// Byte offset of the BAT for a header carrying `descriptor_len` bytes of descriptor
    pub fn bat_offset_for(descriptor_len: usize) -> u32 {
        ((HEADER_FIXED_LEN + descriptor_len + 3) & !3) as u32
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_LEN + self.descriptor.len()
    }

    pub fn is_assigned(&self) -> bool {
        self.logical_unit != UNASSIGNED_UNIT && self.logical_unit != MARKED_FOR_ERASE
    }

    /// Check byte over every field that never changes after format
    pub fn compute_check(&self) -> u8 {
        let bytes = self.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..WEAR_OFFSET]);
        hasher.update(&bytes[LOGICAL_UNIT_OFFSET + 2..CHECK_OFFSET]);
        hasher.update(&bytes[CHECK_OFFSET + 1..]);
        (hasher.finalize() & 0xFF) as u8
    }

    pub fn seal(&mut self) {
        self.check = self.compute_check();
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature != SIGNATURE {
            return Err(FtlError::BadFormat);
        }

        if self.log2_sector_size < crate::config::MIN_LOG2_SECTOR_SIZE
            || self.log2_sector_size > crate::config::MAX_LOG2_SECTOR_SIZE
            || self.log2_unit_size <= self.log2_sector_size
            || self.log2_unit_size > 31
        {
            return Err(FtlError::BadFormat);
        }

        if self.unit_count == 0 || self.transfer_units as u16 >= self.unit_count {
            return Err(FtlError::BadFormat);
        }

        if self.bat_offset != Self::bat_offset_for(self.descriptor.len()) {
            return Err(FtlError::BadFormat);
        }

        if self.check != self.compute_check() {
            return Err(FtlError::BadFormat);
        }

        Ok(())
    }

    /// True when `other` belongs to the same volume: every field except the
    /// wear counter and the logical unit number matches bit for bit.
    pub fn same_format(&self, other: &UnitHeader) -> bool {
        self.signature == other.signature
            && self.transfer_units == other.transfer_units
            && self.log2_sector_size == other.log2_sector_size
            && self.log2_unit_size == other.log2_unit_size
            && self.first_physical_unit == other.first_physical_unit
            && self.unit_count == other.unit_count
            && self.virtual_medium_size == other.virtual_medium_size
            && self.direct_addressing_memory == other.direct_addressing_memory
            && self.map_pages == other.map_pages
            && self.flags == other.flags
            && self.check == other.check
            && self.serial_number == other.serial_number
            && self.bat_offset == other.bat_offset
            && self.descriptor == other.descriptor
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());

        bytes.extend_from_slice(&self.signature);
        bytes.push(self.transfer_units);
        bytes.extend_from_slice(&self.wear_level.to_le_bytes());
        bytes.extend_from_slice(&self.logical_unit.to_le_bytes());
        bytes.push(self.log2_sector_size);
        bytes.push(self.log2_unit_size);
        bytes.extend_from_slice(&self.first_physical_unit.to_le_bytes());
        bytes.extend_from_slice(&self.unit_count.to_le_bytes());
        bytes.extend_from_slice(&self.virtual_medium_size.to_le_bytes());
        bytes.extend_from_slice(&self.direct_addressing_memory.to_le_bytes());
        bytes.extend_from_slice(&self.map_pages.to_le_bytes());
        bytes.push(self.flags);
        bytes.push(self.check);
        bytes.extend_from_slice(&self.serial_number.to_le_bytes());
        bytes.extend_from_slice(&self.bat_offset.to_le_bytes());
        bytes.extend_from_slice(&(self.descriptor.len() as u16).to_le_bytes());
        bytes.resize(HEADER_FIXED_LEN, 0xFF);
        bytes.extend_from_slice(&self.descriptor);

        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_FIXED_LEN {
            return Err(FtlError::BadFormat);
        }

        let u16_at = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };

        let mut signature = [0u8; 15];
        signature.copy_from_slice(&bytes[0..15]);
        if signature != SIGNATURE {
            return Err(FtlError::BadFormat);
        }

        let descriptor_len = u16_at(48) as usize;
        if bytes.len() < HEADER_FIXED_LEN + descriptor_len {
            return Err(FtlError::BadFormat);
        }

        let header = UnitHeader {
            signature,
            transfer_units: bytes[15],
            wear_level: u32_at(16),
            logical_unit: u16_at(20),
            log2_sector_size: bytes[22],
            log2_unit_size: bytes[23],
            first_physical_unit: u16_at(24),
            unit_count: u16_at(26),
            virtual_medium_size: u32_at(28),
            direct_addressing_memory: u32_at(32),
            map_pages: u16_at(36),
            flags: bytes[38],
            check: bytes[39],
            serial_number: u32_at(40),
            bat_offset: u32_at(44),
            descriptor: bytes[HEADER_FIXED_LEN..HEADER_FIXED_LEN + descriptor_len].to_vec(),
        };

        header.validate()?;

        Ok(header)
    }

    /// Read just the descriptor length from raw header bytes
    pub fn peek_descriptor_len(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < HEADER_FIXED_LEN {
            return None;
        }
        Some(u16::from_le_bytes([bytes[48], bytes[49]]) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> UnitHeader {
        let mut header = UnitHeader {
            signature: SIGNATURE,
            transfer_units: 1,
            wear_level: 0x0403_0201,
            logical_unit: 2,
            log2_sector_size: 9,
            log2_unit_size: 16,
            first_physical_unit: 0,
            unit_count: 4,
            virtual_medium_size: 100 * 512,
            direct_addressing_memory: 64,
            map_pages: 1,
            flags: 0,
            check: 0,
            serial_number: 0xDEAD_BEEF,
            bat_offset: UnitHeader::bat_offset_for(0),
            descriptor: Vec::new(),
        };
        header.seal();
        header
    }

    #[test]
    fn test_header_layout_is_pinned() {
        let header = sample_header();
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), HEADER_FIXED_LEN);
        assert_eq!(&bytes[0..15], &SIGNATURE);
        assert_eq!(bytes[15], 1);
        assert_eq!(&bytes[16..20], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[20..22], &[0x02, 0x00]);
        assert_eq!(bytes[22], 9);
        assert_eq!(bytes[23], 16);
        assert_eq!(&bytes[26..28], &[0x04, 0x00]);
        assert_eq!(&bytes[28..32], &(100u32 * 512).to_le_bytes());
        assert_eq!(&bytes[32..36], &[64, 0, 0, 0]);
        assert_eq!(&bytes[36..38], &[1, 0]);
        assert_eq!(&bytes[40..44], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[44..48], &[60, 0, 0, 0]);
        assert_eq!(&bytes[48..50], &[0, 0]);
    }

    #[test]
    fn test_header_serialization() {
        let header = sample_header();
        let decoded = UnitHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_descriptor_shifts_bat_offset() {
        assert_eq!(UnitHeader::bat_offset_for(0), 60);
        assert_eq!(UnitHeader::bat_offset_for(1), 64);
        assert_eq!(UnitHeader::bat_offset_for(4), 64);
        assert_eq!(UnitHeader::bat_offset_for(5), 68);

        let mut header = sample_header();
        header.descriptor = b"boot".to_vec();
        header.bat_offset = UnitHeader::bat_offset_for(4);
        header.seal();

        let bytes = header.to_bytes();
        assert_eq!(&bytes[60..64], b"boot");
        let decoded = UnitHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.descriptor, b"boot");
        assert_eq!(decoded.bat_offset, 64);
    }

    #[test]
    fn test_invalid_signature() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            UnitHeader::from_bytes(&bytes),
            Err(FtlError::BadFormat)
        ));
    }

    #[test]
    fn test_erased_unit_is_not_a_header() {
        let bytes = vec![0xFF; 512];
        assert!(UnitHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_check_byte_detects_corruption() {
        let mut bytes = sample_header().to_bytes();
        bytes[39] ^= 0x01;
        assert!(UnitHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_identity_fields_outside_check_byte() {
        let mut header = sample_header();
        let check = header.check;
        header.logical_unit = MARKED_FOR_ERASE;
        header.wear_level += 10;
        assert_eq!(header.compute_check(), check);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_same_format_ignores_identity() {
        let a = sample_header();
        let mut b = a.clone();
        b.logical_unit = 3;
        b.wear_level = 99;
        assert!(a.same_format(&b));

        b.unit_count = 5;
        b.seal();
        assert!(!a.same_format(&b));
    }

    #[test]
    fn test_marked_for_erase_only_clears_bits() {
        assert_eq!(MARKED_FOR_ERASE & !UNASSIGNED_UNIT, 0);
        for lun in [0u16, 1, 17, 0x7FFE] {
            assert_eq!(lun & !MARKED_FOR_ERASE, 0);
        }
    }
}
