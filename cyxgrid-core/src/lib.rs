//! CyxGrid Core Library
//!
//! Core of the CyxGrid capability-secured storage grid.
//! This crate provides:
//! - Systematic Reed-Solomon erasure coding (any k of n shares reconstruct)
//! - Stream sealing (ChaCha20), BLAKE3 share hashes and Merkle digests
//! - Capability tokens (read, verify-only, write) with one-way attenuation
//! - Signed versions for mutable slots
//! - Common types and error handling

pub mod capability;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod merkle;
pub mod mutable;
pub mod share;

pub use capability::{Capability, CapabilityKind};
pub use crypto::{
    derive_capability_digest, seal, unseal, ContentHash, ConvergenceSecret, EncryptionKey,
    StorageIndex, WriteKey,
};
pub use erasure::{decode, encode, CodingParams, ErasureCoder};
pub use error::{GridError, Result, SegmentFailure};
pub use merkle::MerkleTree;
pub use mutable::SignedVersion;
pub use share::{
    reassemble_segments, split_into_segments, Segment, SegmentLayout, Share, ShareEnvelope,
    ShareId,
};

/// Default coding parameters
/// - 3 shares needed to reconstruct
/// - 10 shares produced, so any 7 may be lost
///
/// The client overrides these via CYXGRID_SHARES_NEEDED / CYXGRID_SHARES_TOTAL.
pub const DEFAULT_SHARES_NEEDED: usize = 3;
pub const DEFAULT_SHARES_TOTAL: usize = 10;

/// GF(2^8) Reed-Solomon supports at most 256 distinct share rows.
pub const MAX_SHARES: usize = 256;

/// Segment size constants
pub const MIN_SEGMENT_SIZE: usize = 4 * 1024; // 4 KB
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024; // 128 KB
pub const MAX_SEGMENT_SIZE: usize = 8 * 1024 * 1024; // 8 MB
