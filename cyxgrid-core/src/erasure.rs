//! Reed-Solomon Erasure Coding
//!
//! Implements systematic k-of-n coding over GF(2^8):
//! - shares 0..k carry the (zero padded) segment bytes unchanged
//! - shares k..n are parity
//! - any k distinct shares reconstruct the segment byte for byte
//!
//! The coefficient row of share `i` depends only on `(k, i)`: the encoding
//! matrix is a Vandermonde matrix normalised by the inverse of its top k rows.
//! Shares produced for a `(k, n)` pair therefore decode with any `n' >= i`,
//! which is what lets [`decode`] work without knowing `n`.

use crate::error::{GridError, Result};
use crate::share::Share;
use crate::{DEFAULT_SHARES_NEEDED, DEFAULT_SHARES_TOTAL, MAX_SEGMENT_SIZE, MAX_SHARES};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Coding parameters: `needed` (k) of `total` (n) shares reconstruct a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u16, u16)", into = "(u16, u16)")]
pub struct CodingParams {
    needed: u16,
    total: u16,
}

impl Default for CodingParams {
    fn default() -> Self {
        Self {
            needed: DEFAULT_SHARES_NEEDED as u16,
            total: DEFAULT_SHARES_TOTAL as u16,
        }
    }
}

impl CodingParams {
    /// Create validated coding parameters (`1 <= k <= n <= 256`)
    pub fn new(needed: usize, total: usize) -> Result<Self> {
        if needed == 0 {
            return Err(GridError::InvalidParameters(
                "needed shares (k) must be > 0".to_string(),
            ));
        }
        if needed > total {
            return Err(GridError::InvalidParameters(format!(
                "needed shares (k={}) exceeds total shares (n={})",
                needed, total
            )));
        }
        if total > MAX_SHARES {
            return Err(GridError::InvalidParameters(format!(
                "total shares (n={}) exceeds maximum {}",
                total, MAX_SHARES
            )));
        }
        Ok(Self {
            needed: needed as u16,
            total: total as u16,
        })
    }

    /// Number of shares needed to reconstruct (k)
    pub fn needed(&self) -> usize {
        self.needed as usize
    }

    /// Number of shares produced (n)
    pub fn total(&self) -> usize {
        self.total as usize
    }

    /// Number of parity shares (n - k)
    pub fn parity(&self) -> usize {
        self.total() - self.needed()
    }

    /// Storage expansion factor (n/k)
    pub fn expansion(&self) -> f64 {
        self.total as f64 / self.needed as f64
    }

    /// Maximum number of lost shares that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity()
    }
}

impl TryFrom<(u16, u16)> for CodingParams {
    type Error = GridError;

    fn try_from((needed, total): (u16, u16)) -> Result<Self> {
        Self::new(needed as usize, total as usize)
    }
}

impl From<CodingParams> for (u16, u16) {
    fn from(params: CodingParams) -> Self {
        (params.needed, params.total)
    }
}

impl fmt::Display for CodingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{}", self.needed, self.total)
    }
}

/// Size of every share produced for a segment of `len` bytes.
///
/// Never zero: an empty segment still yields one padding byte per share.
pub fn shard_size(len: usize, needed: usize) -> usize {
    len.div_ceil(needed).max(1)
}

/// Reed-Solomon encoder/decoder
pub struct ErasureCoder {
    params: CodingParams,
    max_segment_size: usize,
    /// `None` when `k == n`: there is no parity to compute
    encoder: Option<ReedSolomon>,
}

impl ErasureCoder {
    /// Create a coder with the default maximum segment size
    pub fn new(params: CodingParams) -> Result<Self> {
        Self::with_max_segment_size(params, MAX_SEGMENT_SIZE)
    }

    /// Create a coder that rejects segments longer than `max_segment_size`
    pub fn with_max_segment_size(params: CodingParams, max_segment_size: usize) -> Result<Self> {
        if max_segment_size == 0 {
            return Err(GridError::InvalidParameters(
                "max_segment_size must be > 0".to_string(),
            ));
        }
        let encoder = if params.parity() > 0 {
            Some(ReedSolomon::new(params.needed(), params.parity())?)
        } else {
            None
        };
        Ok(Self {
            params,
            max_segment_size,
            encoder,
        })
    }

    /// Get the coding parameters
    pub fn params(&self) -> CodingParams {
        self.params
    }

    /// Largest segment this coder accepts
    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    /// Encode a standalone segment (segment number 0)
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Share>> {
        self.encode_segment(0, data)
    }

    /// Encode one segment into `n` shares tagged with `segment`
    pub fn encode_segment(&self, segment: u32, data: &[u8]) -> Result<Vec<Share>> {
        if data.len() > self.max_segment_size {
            return Err(GridError::InvalidParameters(format!(
                "segment of {} bytes exceeds maximum {}",
                data.len(),
                self.max_segment_size
            )));
        }

        let needed = self.params.needed();
        let size = shard_size(data.len(), needed);

        // Data shards: the segment split into k columns, zero padded
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.params.total());
        for i in 0..needed {
            let mut shard = vec![0u8; size];
            let start = i * size;
            if start < data.len() {
                let end = (start + size).min(data.len());
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
            shards.push(shard);
        }

        // Parity shards, filled in by the encoder
        for _ in 0..self.params.parity() {
            shards.push(vec![0u8; size]);
        }
        if let Some(encoder) = &self.encoder {
            encoder.encode(&mut shards)?;
        }

        // Hashing dominates for large segments
        let shares: Vec<Share> = shards
            .into_par_iter()
            .enumerate()
            .map(|(i, shard)| Share::new(segment, i as u16, Bytes::from(shard)))
            .collect();

        Ok(shares)
    }

    /// Decode shares of one segment back into `original_len` bytes
    ///
    /// Requires at least `k` distinct, intact shares of the same segment.
    pub fn decode(&self, shares: &[Share], original_len: usize) -> Result<Bytes> {
        let total = self.params.total();
        let selected = select_shares(shares, self.params.needed(), Some(total))?;
        reconstruct(
            self.encoder.as_ref(),
            self.params.needed(),
            total,
            &selected,
            original_len,
        )
    }

    /// Verify that a full set of shares is parity-consistent (for health checking)
    pub fn verify_shares(&self, shares: &[Share]) -> Result<bool> {
        if shares.len() != self.params.total() {
            return Ok(false);
        }

        let expected_size = shares.first().map(|s| s.size()).unwrap_or(0);
        if !shares.iter().all(|s| s.size() == expected_size) {
            return Ok(false);
        }

        let mut ordered: Vec<&Share> = shares.iter().collect();
        ordered.sort_by_key(|s| s.index);
        if ordered.iter().enumerate().any(|(i, s)| s.index as usize != i) {
            return Ok(false);
        }

        match &self.encoder {
            Some(encoder) => {
                let refs: Vec<&[u8]> = ordered.iter().map(|s| s.data.as_ref()).collect();
                Ok(encoder.verify(&refs)?)
            }
            None => Ok(true),
        }
    }
}

/// Check a share set and pick one intact share per index.
///
/// Ordering of checks: segment consistency, index range, content digest,
/// then sufficiency and size agreement.
fn select_shares(
    shares: &[Share],
    needed: usize,
    total: Option<usize>,
) -> Result<BTreeMap<u16, &Share>> {
    let segment = match shares.first() {
        Some(first) => first.segment,
        None => {
            return Err(GridError::InsufficientShares {
                segment: 0,
                available: 0,
                required: needed,
                missing: (0..total.unwrap_or(needed) as u16).collect(),
            })
        }
    };

    let max_index = total.unwrap_or(MAX_SHARES);
    let mut selected: BTreeMap<u16, &Share> = BTreeMap::new();
    for share in shares {
        if share.segment != segment {
            return Err(GridError::MismatchedSegment {
                expected: segment,
                found: share.segment,
                index: share.index,
            });
        }
        if share.index as usize >= max_index {
            return Err(GridError::InvalidShareIndex {
                index: share.index as usize,
                max: max_index - 1,
            });
        }
        if !share.verify() {
            return Err(GridError::CorruptShare {
                segment,
                index: share.index,
            });
        }
        selected.entry(share.index).or_insert(share);
    }

    if selected.len() < needed {
        let span = total.unwrap_or_else(|| {
            let highest = selected.keys().next_back().map(|i| *i as usize + 1);
            highest.unwrap_or(0).max(needed)
        });
        return Err(GridError::InsufficientShares {
            segment,
            available: selected.len(),
            required: needed,
            missing: (0..span as u16)
                .filter(|i| !selected.contains_key(i))
                .collect(),
        });
    }

    let expected = selected.values().next().map(|s| s.size()).unwrap_or(0);
    if let Some(odd) = selected.values().find(|s| s.size() != expected) {
        return Err(GridError::CorruptShare {
            segment,
            index: odd.index,
        });
    }

    Ok(selected)
}

fn reconstruct(
    encoder: Option<&ReedSolomon>,
    needed: usize,
    total: usize,
    selected: &BTreeMap<u16, &Share>,
    original_len: usize,
) -> Result<Bytes> {
    let size = selected.values().next().map(|s| s.size()).unwrap_or(0);
    if original_len > size * needed {
        return Err(GridError::InvalidParameters(format!(
            "original length {} exceeds coded capacity {}",
            original_len,
            size * needed
        )));
    }

    // Systematic fast path: every data share is present
    if (0..needed as u16).all(|i| selected.contains_key(&i)) {
        let mut result = Vec::with_capacity(size * needed);
        for i in 0..needed as u16 {
            result.extend_from_slice(&selected[&i].data);
        }
        result.truncate(original_len);
        return Ok(Bytes::from(result));
    }

    let encoder = encoder.ok_or_else(|| {
        GridError::Internal("data shares missing but no parity rows available".to_string())
    })?;

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
    for (index, share) in selected {
        slots[*index as usize] = Some(share.data.to_vec());
    }

    encoder.reconstruct_data(&mut slots)?;

    let mut result = Vec::with_capacity(size * needed);
    for slot in slots.iter().take(needed) {
        match slot {
            Some(shard) => result.extend_from_slice(shard),
            None => return Err(GridError::Internal("Reconstruction failed".to_string())),
        }
    }

    result.truncate(original_len);
    Ok(Bytes::from(result))
}

/// Encode `data` into `n` shares of which any `k` reconstruct it
pub fn encode(data: &[u8], needed: usize, total: usize) -> Result<Vec<Share>> {
    ErasureCoder::new(CodingParams::new(needed, total)?)?.encode(data)
}

/// Decode shares produced with `needed` = k, without knowing `n`
pub fn decode(shares: &[Share], needed: usize, original_len: usize) -> Result<Bytes> {
    if needed == 0 || needed > MAX_SHARES {
        return Err(GridError::InvalidParameters(format!(
            "needed shares must be in 1..={}, got {}",
            MAX_SHARES, needed
        )));
    }

    let selected = select_shares(shares, needed, None)?;
    let highest = selected.keys().next_back().map(|i| *i as usize).unwrap_or(0);
    let total = (highest + 1).max(needed);

    let encoder = if total > needed {
        Some(ReedSolomon::new(needed, total - needed)?)
    } else {
        None
    };
    reconstruct(encoder.as_ref(), needed, total, &selected, original_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_coding_params() {
        let params = CodingParams::default();
        assert_eq!(params.needed(), 3);
        assert_eq!(params.total(), 10);
        assert_eq!(params.max_failures(), 7);
        assert!((params.expansion() - 10.0 / 3.0).abs() < 0.001);
        assert_eq!(params.to_string(), "3-of-10");
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            CodingParams::new(0, 3),
            Err(GridError::InvalidParameters(_))
        ));
        assert!(matches!(
            CodingParams::new(4, 3),
            Err(GridError::InvalidParameters(_))
        ));
        assert!(matches!(
            CodingParams::new(3, 257),
            Err(GridError::InvalidParameters(_))
        ));
        assert!(matches!(encode(b"x", 5, 2), Err(GridError::InvalidParameters(_))));
    }

    #[test]
    fn test_params_deserialize_validates() {
        let bytes = bincode::serialize(&(5u16, 2u16)).unwrap();
        assert!(bincode::deserialize::<CodingParams>(&bytes).is_err());

        let params = CodingParams::new(2, 5).unwrap();
        let bytes = bincode::serialize(&params).unwrap();
        assert_eq!(bincode::deserialize::<CodingParams>(&bytes).unwrap(), params);
    }

    #[test]
    fn test_encode_decode_simple() {
        let original = b"Hello, CyxGrid!";
        let shares = encode(original, 3, 10).unwrap();
        assert_eq!(shares.len(), 10);

        let decoded = decode(&shares, 3, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_systematic_layout() {
        let original = pattern(12);
        let shares = encode(&original, 3, 5).unwrap();

        assert_eq!(shares[0].data.as_ref(), &original[0..4]);
        assert_eq!(shares[1].data.as_ref(), &original[4..8]);
        assert_eq!(shares[2].data.as_ref(), &original[8..12]);
        for (i, share) in shares.iter().enumerate() {
            assert_eq!(share.index as usize, i);
            assert_eq!(share.is_parity(3), i >= 3);
        }
    }

    #[test]
    fn test_every_k_subset_decodes() {
        let original = pattern(1000);
        let shares = encode(&original, 3, 6).unwrap();

        for a in 0..6 {
            for b in (a + 1)..6 {
                for c in (b + 1)..6 {
                    let subset = vec![shares[a].clone(), shares[b].clone(), shares[c].clone()];
                    let decoded = decode(&subset, 3, original.len()).unwrap();
                    assert_eq!(decoded.as_ref(), original.as_slice(), "subset {a},{b},{c}");
                }
            }
        }
    }

    #[test]
    fn test_decode_without_n_matches_coder() {
        let params = CodingParams::new(4, 12).unwrap();
        let coder = ErasureCoder::new(params).unwrap();
        let original = pattern(4096);
        let shares = coder.encode(&original).unwrap();

        // Only the lowest parity rows: free decode sizes the matrix to index 6
        let subset: Vec<Share> = [0, 4, 5, 6].iter().map(|&i| shares[i].clone()).collect();
        let via_free = decode(&subset, 4, original.len()).unwrap();
        let via_coder = coder.decode(&subset, original.len()).unwrap();
        assert_eq!(via_free, via_coder);
        assert_eq!(via_free.as_ref(), original.as_slice());
    }

    #[test]
    fn test_insufficient_shares() {
        let shares = encode(b"test data", 3, 10).unwrap();
        let result = decode(&shares[..2], 3, 9);
        match result {
            Err(GridError::InsufficientShares {
                available,
                required,
                missing,
                ..
            }) => {
                assert_eq!(available, 2);
                assert_eq!(required, 3);
                assert_eq!(missing, vec![2]);
            }
            other => panic!("expected InsufficientShares, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_indices_do_not_count_twice() {
        let shares = encode(b"duplicate", 3, 5).unwrap();
        let dupes = vec![shares[1].clone(), shares[1].clone(), shares[4].clone()];
        assert!(matches!(
            decode(&dupes, 3, 9),
            Err(GridError::InsufficientShares { available: 2, .. })
        ));
    }

    #[test]
    fn test_mismatched_segment() {
        let coder = ErasureCoder::new(CodingParams::new(2, 4).unwrap()).unwrap();
        let seg0 = coder.encode_segment(0, b"segment zero").unwrap();
        let seg1 = coder.encode_segment(1, b"segment one!").unwrap();

        let mixed = vec![seg0[0].clone(), seg1[3].clone()];
        assert!(matches!(
            coder.decode(&mixed, 12),
            Err(GridError::MismatchedSegment {
                expected: 0,
                found: 1,
                index: 3
            })
        ));
    }

    #[test]
    fn test_corrupt_share_rejected_at_every_byte() {
        let original = pattern(64);
        let shares = encode(&original, 2, 4).unwrap();

        for share_index in 0..4 {
            for byte in 0..shares[share_index].size() {
                let mut tampered = shares.clone();
                let mut data = tampered[share_index].data.to_vec();
                data[byte] ^= 0x01;
                tampered[share_index].data = Bytes::from(data);

                let result = decode(&tampered, 2, original.len());
                assert!(
                    matches!(result, Err(GridError::CorruptShare { index, .. }) if index as usize == share_index),
                    "byte {} of share {} was not detected",
                    byte,
                    share_index
                );
            }
        }
    }

    #[test]
    fn test_index_beyond_n_rejected() {
        let coder = ErasureCoder::new(CodingParams::new(2, 3).unwrap()).unwrap();
        let wide = encode(b"wide", 2, 6).unwrap();
        assert!(matches!(
            coder.decode(&wide[3..5], 4),
            Err(GridError::InvalidShareIndex { index: 3, max: 2 })
        ));
    }

    #[test]
    fn test_segment_too_large() {
        let coder =
            ErasureCoder::with_max_segment_size(CodingParams::new(2, 3).unwrap(), 16).unwrap();
        assert!(matches!(
            coder.encode(&[0u8; 17]),
            Err(GridError::InvalidParameters(_))
        ));
        assert!(coder.encode(&[0u8; 16]).is_ok());
    }

    #[test]
    fn test_no_parity_configuration() {
        let original = pattern(100);
        let shares = encode(&original, 4, 4).unwrap();
        assert_eq!(shares.len(), 4);
        assert_eq!(decode(&shares, 4, 100).unwrap().as_ref(), original.as_slice());
        assert!(decode(&shares[..3], 4, 100).is_err());
    }

    #[test]
    fn test_empty_segment() {
        let shares = encode(b"", 3, 5).unwrap();
        assert!(shares.iter().all(|s| s.size() == 1));
        let decoded = decode(&shares[2..], 3, 0).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_verify_shares() {
        let coder = ErasureCoder::new(CodingParams::new(3, 5).unwrap()).unwrap();
        let shares = coder.encode(b"verify test").unwrap();
        assert!(coder.verify_shares(&shares).unwrap());

        let mut corrupted = shares.clone();
        let mut data = corrupted[4].data.to_vec();
        data[0] ^= 0xFF;
        corrupted[4] = Share::new(0, 4, Bytes::from(data));
        assert!(!coder.verify_shares(&corrupted).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_k_subset_reconstructs(
            (data, needed, total, subset) in (1usize..=6, 0usize..=6).prop_flat_map(|(k, extra)| {
                let n = k + extra;
                (
                    proptest::collection::vec(any::<u8>(), 0..2048),
                    Just(k),
                    Just(n),
                    proptest::sample::subsequence((0..n).collect::<Vec<_>>(), k),
                )
            })
        ) {
            let shares = encode(&data, needed, total).unwrap();
            let chosen: Vec<Share> = subset.iter().map(|&i| shares[i].clone()).collect();
            let decoded = decode(&chosen, needed, data.len()).unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }
    }
}
