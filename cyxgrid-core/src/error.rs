//! Error types for CyxGrid
//!
//! Provides a unified error type for the coding, sealing and capability layers
//! and for the orchestrator built on top of them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for CyxGrid operations
pub type Result<T> = std::result::Result<T, GridError>;

/// A segment that did not reach enough endpoints during an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFailure {
    /// Segment number within the object
    pub segment: u32,
    /// Share indices that were acknowledged by some endpoint
    pub placed: Vec<u16>,
    /// Share indices that no endpoint acknowledged
    pub missing: Vec<u16>,
    /// Number of acknowledged shares the segment needed
    pub required: usize,
}

impl fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {} placed {}/{} (missing shares {:?})",
            self.segment,
            self.placed.len(),
            self.required,
            self.missing
        )
    }
}

fn describe_failures(failures: &[SegmentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unified error type for CyxGrid
#[derive(Error, Debug)]
pub enum GridError {
    // ===== Erasure Coding Errors =====
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid share index: {index} (max: {max})")]
    InvalidShareIndex { index: usize, max: usize },

    #[error(
        "Insufficient shares for segment {segment}: have {available}, need {required} (missing {missing:?})"
    )]
    InsufficientShares {
        segment: u32,
        available: usize,
        required: usize,
        missing: Vec<u16>,
    },

    #[error("Corrupt share {index} of segment {segment}: digest mismatch")]
    CorruptShare { segment: u32, index: u16 },

    #[error("Mismatched segment: share {index} belongs to segment {found}, expected {expected}")]
    MismatchedSegment { expected: u32, found: u32, index: u16 },

    // ===== Placement Errors =====
    #[error("Insufficient endpoints: have {available}, need {required}")]
    InsufficientEndpoints { available: usize, required: usize },

    #[error("Partial upload failure: {}", describe_failures(.failures))]
    PartialUploadFailure { failures: Vec<SegmentFailure> },

    // ===== Cryptography Errors =====
    #[error("Invalid key length: expected {expected}, got {actual}")]
    KeyLengthError { expected: usize, actual: usize },

    #[error("Cipher error: {0}")]
    Crypto(String),

    #[error("Invalid version signature: {0}")]
    InvalidSignature(String),

    // ===== Capability Errors =====
    #[error("Malformed capability: {0}")]
    MalformedCapability(String),

    #[error("Capability lacks {required} authority")]
    InsufficientAuthority { required: String },

    // ===== Operation Control =====
    #[error("Operation cancelled")]
    Cancelled,

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// Whether an operation that failed with this error may be retried
    /// against other endpoints.
    ///
    /// Integrity and parse failures indicate corruption or misuse and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::InsufficientShares { .. }
                | GridError::InsufficientEndpoints { .. }
                | GridError::PartialUploadFailure { .. }
                | GridError::Io(_)
        )
    }

    /// Whether this error reports locally detected corruption.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            GridError::CorruptShare { .. }
                | GridError::MismatchedSegment { .. }
                | GridError::InvalidSignature(_)
        )
    }
}

impl From<reed_solomon_erasure::Error> for GridError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        GridError::InvalidParameters(err.to_string())
    }
}

impl From<bincode::Error> for GridError {
    fn from(err: bincode::Error) -> Self {
        GridError::Serialization(err.to_string())
    }
}
