//! Error types for vmdk-extent
//!
//! Provides a unified error type for all extent operations.

use thiserror::Error;

/// Result type alias using VmdkError
pub type Result<T> = std::result::Result<T, VmdkError>;

/// Unified error type for extent operations
#[derive(Debug, Error)]
pub enum VmdkError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// Underlying storage failure, propagated unchanged and never retried
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Format Errors (fatal to opening the extent)
    // -------------------------------------------------------------------------
    /// Bad magic, unsupported version, unknown incompatible flag,
    /// malformed newline detector, or inconsistent metadata
    #[error("Invalid extent format: {0}")]
    InvalidFormat(String),

    /// Embedded LBA without compression, unknown compression algorithm, ...
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    // -------------------------------------------------------------------------
    // Access Errors (extent remains usable)
    // -------------------------------------------------------------------------
    #[error("Access out of range: offset {offset} + length {len} exceeds capacity {capacity}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },

    #[error("Extent is read-only")]
    ReadOnlyExtent,

    /// A single grain failed to decompress or carried the wrong LBA
    #[error("Corrupt grain at LBA {lba}: {reason}")]
    CorruptGrain { lba: u64, reason: String },

    // -------------------------------------------------------------------------
    // Write Session Errors (fatal to the current write session)
    // -------------------------------------------------------------------------
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VmdkError {
    /// Whether the caller may keep using the extent after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VmdkError::OutOfRange { .. } | VmdkError::CorruptGrain { .. }
        )
    }
}

impl From<VmdkError> for std::io::Error {
    fn from(err: VmdkError) -> Self {
        use std::io::ErrorKind;
        let err = match err {
            VmdkError::Io(e) => return e,
            other => other,
        };
        let kind = match &err {
            VmdkError::Io(_) | VmdkError::ProtocolViolation(_) => ErrorKind::Other,
            VmdkError::InvalidFormat(_) | VmdkError::CorruptGrain { .. } => ErrorKind::InvalidData,
            VmdkError::UnsupportedFeature(_) => ErrorKind::Unsupported,
            VmdkError::OutOfRange { .. } | VmdkError::Config(_) => ErrorKind::InvalidInput,
            VmdkError::ReadOnlyExtent => ErrorKind::PermissionDenied,
        };
        std::io::Error::new(kind, err)
    }
}
