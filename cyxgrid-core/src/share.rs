//! Shares, segments and the stored share envelope
//!
//! Segments are the unit of sealing and coding; shares are the unit of
//! storage. Every share is content-addressed by the Blake3 hash of its bytes
//! and travels inside a [`ShareEnvelope`] that lets anyone holding only the
//! capability digest check it.

use crate::crypto::{bind_digest, ContentHash, StorageIndex};
use crate::erasure::{shard_size, CodingParams};
use crate::error::{GridError, Result};
use crate::merkle::MerkleTree;
use crate::mutable::SignedVersion;
use crate::{MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Address of one share on the grid: `(storage index, segment, share index)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareId {
    pub storage_index: StorageIndex,
    pub segment: u32,
    pub index: u16,
}

impl ShareId {
    pub fn new(storage_index: StorageIndex, segment: u32, index: u16) -> Self {
        Self {
            storage_index,
            segment,
            index,
        }
    }
}

impl fmt::Debug for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareId({:?}/{}/{})", self.storage_index, self.segment, self.index)
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.storage_index, self.segment, self.index)
    }
}

/// One coded fragment of an encrypted segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Segment number within the object
    pub segment: u32,
    /// Share index (0..n); indices below k carry segment bytes verbatim
    pub index: u16,
    /// Share bytes
    pub data: Bytes,
    /// Blake3 hash of `data`
    pub digest: ContentHash,
}

impl Share {
    /// Create a share, computing its digest
    pub fn new(segment: u32, index: u16, data: Bytes) -> Self {
        let digest = ContentHash::compute(&data);
        Self {
            segment,
            index,
            data,
            digest,
        }
    }

    /// Verify the share bytes against its digest
    pub fn verify(&self) -> bool {
        self.digest.verify(&self.data)
    }

    /// Share size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether this is a parity share for `needed` data shares
    pub fn is_parity(&self, needed: usize) -> bool {
        self.index as usize >= needed
    }
}

/// How an object of `size` bytes is cut into segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentLayout {
    /// Object size in bytes
    pub size: u64,
    /// Nominal segment size; only the last segment may be shorter
    pub segment_size: u32,
}

impl SegmentLayout {
    /// Create a validated layout
    pub fn new(size: u64, segment_size: usize) -> Result<Self> {
        let layout = Self {
            size,
            segment_size: u32::try_from(segment_size).map_err(|_| {
                GridError::InvalidParameters(format!("segment size {} too large", segment_size))
            })?,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check the segment size bounds
    pub fn validate(&self) -> Result<()> {
        let segment_size = self.segment_size as usize;
        if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&segment_size) {
            return Err(GridError::InvalidParameters(format!(
                "segment size {} outside {}..={}",
                segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if self.size.div_ceil(self.segment_size as u64) > u32::MAX as u64 {
            return Err(GridError::InvalidParameters(format!(
                "object of {} bytes has too many segments",
                self.size
            )));
        }
        Ok(())
    }

    /// Number of segments; an empty object is one empty segment
    pub fn num_segments(&self) -> u32 {
        self.size.div_ceil(self.segment_size as u64).max(1) as u32
    }

    /// Byte offset of `segment` within the object (and its keystream)
    pub fn segment_offset(&self, segment: u32) -> u64 {
        segment as u64 * self.segment_size as u64
    }

    /// Length of `segment` in bytes (zero past the end)
    pub fn segment_len(&self, segment: u32) -> usize {
        let start = self.segment_offset(segment);
        let end = (start + self.segment_size as u64).min(self.size);
        end.saturating_sub(start) as usize
    }

    /// Byte range of `segment` within the object
    pub fn segment_range(&self, segment: u32) -> Range<usize> {
        let start = self.segment_offset(segment).min(self.size) as usize;
        start..start + self.segment_len(segment)
    }

    /// Size of every share of `segment` under `params`
    pub fn share_size(&self, segment: u32, params: &CodingParams) -> usize {
        shard_size(self.segment_len(segment), params.needed())
    }

    /// Number of Merkle leaves (one per share of every segment)
    pub fn leaf_count(&self, params: &CodingParams) -> usize {
        self.num_segments() as usize * params.total()
    }
}

/// Merkle leaf position of a share: segment-major, then share index
pub fn leaf_index(params: &CodingParams, segment: u32, index: u16) -> usize {
    segment as usize * params.total() + index as usize
}

/// A plaintext or encrypted segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment number
    pub index: u32,
    /// Offset of the first byte within the object
    pub offset: u64,
    /// Segment bytes
    pub data: Bytes,
}

/// Split an object into segments of `segment_size` bytes
pub fn split_into_segments(data: &Bytes, segment_size: usize) -> Result<Vec<Segment>> {
    let layout = SegmentLayout::new(data.len() as u64, segment_size)?;
    Ok((0..layout.num_segments())
        .map(|s| Segment {
            index: s,
            offset: layout.segment_offset(s),
            data: data.slice(layout.segment_range(s)),
        })
        .collect())
}

/// Reassemble segments into the object described by `layout`
///
/// Segments may arrive in any order; each must appear exactly once and have
/// the length the layout assigns it.
pub fn reassemble_segments(segments: &[Segment], layout: &SegmentLayout) -> Result<Bytes> {
    let expected = layout.num_segments() as usize;
    if segments.len() != expected {
        return Err(GridError::InvalidParameters(format!(
            "expected {} segments, got {}",
            expected,
            segments.len()
        )));
    }

    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.index);

    let mut result = Vec::with_capacity(layout.size as usize);
    for (i, segment) in sorted.iter().enumerate() {
        if segment.index as usize != i {
            return Err(GridError::InvalidShareIndex {
                index: segment.index as usize,
                max: expected - 1,
            });
        }
        if segment.data.len() != layout.segment_len(segment.index) {
            return Err(GridError::InvalidParameters(format!(
                "segment {} has {} bytes, expected {}",
                segment.index,
                segment.data.len(),
                layout.segment_len(segment.index)
            )));
        }
        result.extend_from_slice(&segment.data);
    }

    Ok(Bytes::from(result))
}

/// Stored form of a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEnvelope {
    pub storage_index: StorageIndex,
    pub params: CodingParams,
    pub layout: SegmentLayout,
    /// Root over every share hash of the object
    pub merkle_root: ContentHash,
    /// Inclusion proof of `share.digest` under `merkle_root`
    pub proof: Vec<ContentHash>,
    /// Signed version header (mutable objects only)
    pub version: Option<SignedVersion>,
    pub share: Share,
}

impl ShareEnvelope {
    /// Wrap a share with its proof taken from `tree`
    pub fn new(
        storage_index: StorageIndex,
        params: CodingParams,
        layout: SegmentLayout,
        tree: &MerkleTree,
        share: Share,
    ) -> Result<Self> {
        let proof = tree.proof(leaf_index(&params, share.segment, share.index))?;
        Ok(Self {
            storage_index,
            params,
            layout,
            merkle_root: tree.root(),
            proof,
            version: None,
            share,
        })
    }

    /// Attach a signed version header
    pub fn with_version(mut self, version: SignedVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Grid address of the wrapped share
    pub fn id(&self) -> ShareId {
        ShareId::new(self.storage_index, self.share.segment, self.share.index)
    }

    /// Digest this envelope claims to belong to
    pub fn anchor_digest(&self) -> ContentHash {
        bind_digest(&self.params, &self.layout, &self.merkle_root)
    }

    /// Check the share against its own envelope and return the anchor digest.
    ///
    /// A caller still has to compare the returned digest (or the version
    /// signature) against its capability; this only proves internal
    /// consistency.
    pub fn verify_integrity(&self) -> Result<ContentHash> {
        let share = &self.share;
        let corrupt = || GridError::CorruptShare {
            segment: share.segment,
            index: share.index,
        };

        self.layout.validate().map_err(|_| corrupt())?;
        if share.segment >= self.layout.num_segments() {
            return Err(corrupt());
        }
        if share.index as usize >= self.params.total() {
            return Err(GridError::InvalidShareIndex {
                index: share.index as usize,
                max: self.params.total() - 1,
            });
        }
        if !share.verify() {
            return Err(corrupt());
        }
        if share.size() != self.layout.share_size(share.segment, &self.params) {
            return Err(corrupt());
        }
        if !MerkleTree::verify_proof(
            &self.merkle_root,
            &share.digest,
            leaf_index(&self.params, share.segment, share.index),
            self.layout.leaf_count(&self.params),
            &self.proof,
        ) {
            return Err(corrupt());
        }

        Ok(self.anchor_digest())
    }

    /// Check the version header against a signing-key fingerprint
    ///
    /// Returns the sequence number on success.
    pub fn verify_version(&self, fingerprint: &ContentHash) -> Result<u64> {
        let version = self
            .version
            .as_ref()
            .ok_or_else(|| GridError::InvalidSignature("share carries no version".to_string()))?;
        version.verify(
            fingerprint,
            &self.storage_index,
            &self.params,
            &self.layout,
            &self.merkle_root,
        )?;
        Ok(version.seqnum)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
