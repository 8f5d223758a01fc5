//! Error types for trekbd.

use std::io;
use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("block device error: {0}")]
    Device(#[from] DeviceError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the raw USB transfer capability.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("usb device {vendor_id:04x}:{product_id:04x} not found")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("usb transfer timed out")]
    Timeout,

    #[error("usb transfer failed: {message}")]
    Transfer { message: String },
}

impl TransportError {
    pub fn transfer(err: impl std::fmt::Display) -> Self {
        Self::Transfer {
            message: err.to_string(),
        }
    }
}

/// Block device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("device protocol error: {reason}")]
    Protocol { reason: String },

    #[error("sectors {lba}+{count} out of range, device has {total_sectors} sectors")]
    OutOfRange {
        lba: u64,
        count: u64,
        total_sectors: u64,
    },

    #[error("byte range {offset}+{length} exceeds device capacity {capacity}")]
    ByteRangeOutOfBounds {
        offset: u64,
        length: u64,
        capacity: u64,
    },

    #[error("data length mismatch: expected {expected_bytes} bytes, got {actual_bytes}")]
    LengthMismatch {
        expected_bytes: usize,
        actual_bytes: usize,
    },

    #[error("invalid device size: {reason}")]
    InvalidDeviceSize { reason: &'static str },

    #[error("device is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// True for errors raised by bounds checks, before any I/O happened.
    pub fn is_range_error(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. } | Self::ByteRangeOutOfBounds { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
