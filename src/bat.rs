//! Block Allocation Table entry codec
//!
//! One little-endian `u32` per sector slot of an erase unit. Status codes live
//! in the low bits below the sector size, payloads (virtual sector or map page
//! number) above it. Every legal in-place transition only clears bits:
//!
//! ```text
//! FREE (ffffffff) -> ALLOCATED (fffffffe) -> tentative -> committed -> GARBAGE (0)
//! ```

pub const FREE_SECTOR: u32 = 0xFFFF_FFFF;
pub const ALLOCATED_SECTOR: u32 = 0xFFFF_FFFE;
pub const GARBAGE_SECTOR: u32 = 0;
pub const FORMAT_SECTOR: u32 = 0x30;
pub const DATA_SECTOR: u32 = 0x40;
pub const REPLACEMENT_PAGE: u32 = 0x60;
pub const BAD_SECTOR: u32 = 0x70;

/// Set while the owning mapping is not yet committed
pub const TENTATIVE: u32 = 0x08;

pub const BAT_ENTRY_SIZE: usize = 4;

/// Decoded BAT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatEntry {
    Free,
    Allocated,
    Garbage,
    Format,
    Data { vsector: u32, tentative: bool },
    Replacement { page: u32, tentative: bool },
    Bad,
    /// Unrecognized encoding; counted as garbage, never as data
    Invalid(u32),
}

impl BatEntry {
    pub fn decode(raw: u32, sector_bits: u8) -> Self {
        match raw {
            FREE_SECTOR => return BatEntry::Free,
            ALLOCATED_SECTOR => return BatEntry::Allocated,
            GARBAGE_SECTOR => return BatEntry::Garbage,
            _ => {}
        }

        let status_mask = (1u32 << sector_bits) - 1;
        let low = raw & status_mask;
        let tentative = low & TENTATIVE != 0;
        let status = low & !TENTATIVE;
        let payload = raw >> sector_bits;

        match status {
            FORMAT_SECTOR if payload == 0 && !tentative => BatEntry::Format,
            BAD_SECTOR if payload == 0 && !tentative => BatEntry::Bad,
            DATA_SECTOR => BatEntry::Data {
                vsector: payload,
                tentative,
            },
            REPLACEMENT_PAGE => BatEntry::Replacement {
                page: payload,
                tentative,
            },
            _ => BatEntry::Invalid(raw),
        }
    }

    pub fn encode(self, sector_bits: u8) -> u32 {
        let flag = |tentative: bool| if tentative { TENTATIVE } else { 0 };
        match self {
            BatEntry::Free => FREE_SECTOR,
            BatEntry::Allocated => ALLOCATED_SECTOR,
            BatEntry::Garbage => GARBAGE_SECTOR,
            BatEntry::Format => FORMAT_SECTOR,
            BatEntry::Bad => BAD_SECTOR,
            BatEntry::Data { vsector, tentative } => {
                (vsector << sector_bits) | DATA_SECTOR | flag(tentative)
            }
            BatEntry::Replacement { page, tentative } => {
                (page << sector_bits) | REPLACEMENT_PAGE | flag(tentative)
            }
            BatEntry::Invalid(raw) => raw,
        }
    }

    /// Data or replacement payload that a unit transfer must carry over
    pub fn is_live(self) -> bool {
        matches!(self, BatEntry::Data { .. } | BatEntry::Replacement { .. })
    }

    /// Slots that read back as reclaimable space
    pub fn is_garbage(self) -> bool {
        matches!(
            self,
            BatEntry::Garbage | BatEntry::Allocated | BatEntry::Invalid(_)
        )
    }

    pub fn is_tentative(self) -> bool {
        matches!(
            self,
            BatEntry::Data {
                tentative: true,
                ..
            } | BatEntry::Replacement {
                tentative: true,
                ..
            }
        )
    }

    /// Same entry with the tentative bit cleared
    pub fn committed(self) -> Self {
        match self {
            BatEntry::Data { vsector, .. } => BatEntry::Data {
                vsector,
                tentative: false,
            },
            BatEntry::Replacement { page, .. } => BatEntry::Replacement {
                page,
                tentative: false,
            },
            other => other,
        }
    }

    /// Entry as written into a transfer target: slots that hold no live
    /// payload become free again.
    pub fn for_transfer(self) -> Self {
        match self {
            BatEntry::Allocated | BatEntry::Garbage | BatEntry::Invalid(_) => BatEntry::Free,
            other => other,
        }
    }
}

/// `new` may overwrite `old` in place only if it clears bits and sets none
pub fn is_bit_clear(old: u32, new: u32) -> bool {
    new & !old == 0
}

/// Read entry `index` from a raw little-endian BAT image
pub fn raw_entry(bat: &[u8], index: usize) -> u32 {
    let off = index * BAT_ENTRY_SIZE;
    u32::from_le_bytes([bat[off], bat[off + 1], bat[off + 2], bat[off + 3]])
}
