// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No data available")]
    NoData,

    #[error("Sector pool exhausted")]
    NoSpace,

    #[error("Offset out of range: sector {sector}, offset {offset}, len {len}")]
    BadOffset { sector: u32, offset: u16, len: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl StoreError {
    /// Numeric tag as reported over the legacy diagnostic channel.
    /// `NoData` keeps its historically observed value of 34.
    pub fn code(&self) -> u32 {
        match self {
            StoreError::Config(_) => 1,
            StoreError::NoSpace => 28,
            StoreError::BadOffset { .. } => 29,
            StoreError::Io(_) => 30,
            StoreError::Spool(_) => 31,
            StoreError::Corrupt(_) => 32,
            StoreError::InvalidParameter(_) => 33,
            StoreError::NoData => 34,
        }
    }
}

/// Outcome of a bulk read. `Partial` is a soft failure: the caller keeps
/// what it got but omits the sensor from the current upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Complete,
    Partial,
    NoData,
}

pub type Result<T> = std::result::Result<T, StoreError>;
