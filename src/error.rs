use thiserror::Error;

#[derive(Error, Debug)]
pub enum FtlError {
    /// Persisted structures failed validation. Sticky until the media is reformatted.
    #[error("Bad format: volume structures failed validation")]
    BadFormat,

    #[error("Write fault: flash write or erase failed")]
    WriteFault,

    #[error("Not enough memory to build translation tables")]
    NotEnoughMemory,

    /// No spare transfer unit exists, so space cannot be reclaimed.
    #[error("Write protected: no spare unit available for reclamation")]
    WriteProtect,

    #[error("Sector not found: {0}")]
    SectorNotFound(u32),

    #[error("General failure: {0}")]
    GeneralFailure(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FtlError {
    /// Faults worth a local retry on the hot write path.
    pub fn is_write_fault(&self) -> bool {
        matches!(self, FtlError::WriteFault)
    }
}

pub type Result<T> = std::result::Result<T, FtlError>;
