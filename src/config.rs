//! Format parameters and mount options
//!
//! Both structures derive serde with `#[serde(default)]`, so a TOML file only
//! needs to name the fields it wants to change:
//!
//! ```toml
//! spare_units = 2
//! log2_sector_size = 11
//! direct_addressing_memory = 256
//! ```

use crate::error::{FtlError, Result};
use serde::{Deserialize, Serialize};

/// Smallest sector size the BAT encoding supports (status bits live below it).
pub const MIN_LOG2_SECTOR_SIZE: u8 = 9;
pub const MAX_LOG2_SECTOR_SIZE: u8 = 15;

/// Parameters consumed by [`Volume::format`](crate::Volume::format)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatParams {
    /// Number of spare transfer units kept without logical identity
    pub spare_units: u8,

    /// Share of data slots exposed as virtual sectors when `virtual_sectors` is unset
    pub percent_use: u8,

    /// Exact virtual sector count; the unit count is derived from it when set
    pub virtual_sectors: Option<u32>,

    /// Bytes of RAM the direct page table may use (4 bytes per entry)
    pub direct_addressing_memory: u32,

    /// Sector size exponent
    pub log2_sector_size: u8,

    /// Bytes at the start of the media reserved for a boot image
    pub boot_image_len: u32,

    pub serial_number: u32,

    /// Opaque descriptor blob stored in every unit header
    pub embedded_descriptor: Vec<u8>,
}

impl Default for FormatParams {
    fn default() -> Self {
        FormatParams {
            spare_units: 1,
            percent_use: 98,
            virtual_sectors: None,
            direct_addressing_memory: 4096,
            log2_sector_size: MIN_LOG2_SECTOR_SIZE,
            boot_image_len: 0,
            serial_number: 0,
            embedded_descriptor: Vec::new(),
        }
    }
}

impl FormatParams {
    /// Parse parameters from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let params: FormatParams = toml::from_str(source)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_LOG2_SECTOR_SIZE..=MAX_LOG2_SECTOR_SIZE).contains(&self.log2_sector_size) {
            return Err(FtlError::InvalidParameter(format!(
                "log2_sector_size {} outside {}..={}",
                self.log2_sector_size, MIN_LOG2_SECTOR_SIZE, MAX_LOG2_SECTOR_SIZE
            )));
        }

        if self.percent_use == 0 || self.percent_use > 100 {
            return Err(FtlError::InvalidParameter(format!(
                "percent_use {} must be in 1..=100",
                self.percent_use
            )));
        }

        if self.virtual_sectors == Some(0) {
            return Err(FtlError::InvalidParameter(
                "virtual_sectors must be non-zero".to_string(),
            ));
        }

        if self.embedded_descriptor.len() > u16::MAX as usize {
            return Err(FtlError::InvalidParameter(format!(
                "embedded descriptor too large: {} bytes",
                self.embedded_descriptor.len()
            )));
        }

        Ok(())
    }
}

/// Runtime options consumed by [`Volume::mount`](crate::Volume::mount)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Map pages kept in the LRU page cache
    pub map_cache_pages: usize,

    /// One in `wear_leveling_ratio` collection cycles picks the least worn
    /// unit instead of the most garbage-laden one. Zero disables it.
    pub wear_leveling_ratio: u32,

    /// Seed for the policy RNG; entropy-seeded when unset
    pub rng_seed: Option<u64>,

    /// Collect opportunistically when free sectors drop below this count
    pub low_water_mark: u32,

    /// Defer opportunistic collection to the background job instead of
    /// running it inline
    pub background_collect: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            map_cache_pages: 4,
            wear_leveling_ratio: 10,
            rng_seed: None,
            low_water_mark: 0,
            background_collect: false,
        }
    }
}

impl MountOptions {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let options: MountOptions = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.map_cache_pages == 0 {
            return Err(FtlError::InvalidParameter(
                "map_cache_pages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_params_defaults() {
        let params = FormatParams::default();
        assert_eq!(params.spare_units, 1);
        assert_eq!(params.log2_sector_size, 9);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_format_params_from_toml() {
        let params = FormatParams::from_toml_str(
            r#"
            spare_units = 2
            log2_sector_size = 11
            virtual_sectors = 48
            "#,
        )
        .unwrap();

        assert_eq!(params.spare_units, 2);
        assert_eq!(params.log2_sector_size, 11);
        assert_eq!(params.virtual_sectors, Some(48));
        // Unnamed fields keep their defaults
        assert_eq!(params.percent_use, 98);
    }

    #[test]
    fn test_format_params_rejects_bad_sector_size() {
        let result = FormatParams::from_toml_str("log2_sector_size = 4");
        assert!(matches!(result, Err(FtlError::InvalidParameter(_))));
    }

    #[test]
    fn test_format_params_rejects_malformed_toml() {
        let result = FormatParams::from_toml_str("spare_units = \"many\"");
        assert!(matches!(result, Err(FtlError::Config(_))));
    }

    #[test]
    fn test_mount_options_from_toml() {
        let options = MountOptions::from_toml_str(
            r#"
            map_cache_pages = 8
            rng_seed = 7
            background_collect = true
            "#,
        )
        .unwrap();

        assert_eq!(options.map_cache_pages, 8);
        assert_eq!(options.rng_seed, Some(7));
        assert!(options.background_collect);
        assert_eq!(options.wear_leveling_ratio, 10);
    }

    #[test]
    fn test_mount_options_zero_cache_rejected() {
        let options = MountOptions {
            map_cache_pages: 0,
            ..MountOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
