//! Merkle tree over share hashes
//!
//! Leaves and interior nodes are hashed with distinct prefixes so a leaf can
//! never be passed off as a node. A level with an odd number of nodes promotes
//! its last node unchanged; proofs only carry siblings that exist.

use crate::crypto::ContentHash;
use crate::error::{GridError, Result};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn hash_leaf(leaf: &ContentHash) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(leaf.as_bytes());
    ContentHash::from_blake3(hasher.finalize())
}

fn hash_node(left: &ContentHash, right: &ContentHash) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    ContentHash::from_blake3(hasher.finalize())
}

/// Binary hash tree holding every level, leaves first
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<ContentHash>>,
}

impl MerkleTree {
    /// Build a tree over `leaves` (share hashes, segment-major)
    pub fn new(leaves: &[ContentHash]) -> Self {
        let mut levels = vec![leaves.iter().map(hash_leaf).collect::<Vec<_>>()];

        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let prev = &levels[levels.len() - 1];
            let next: Vec<ContentHash> = prev
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_node(left, right),
                    _ => pair[0],
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Root hash; the tree of no leaves has the hash of the empty input
    pub fn root(&self) -> ContentHash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(|| ContentHash::compute(&[]))
    }

    /// Inclusion proof for leaf `index`, bottom-up
    pub fn proof(&self, index: usize) -> Result<Vec<ContentHash>> {
        if index >= self.leaf_count() {
            return Err(GridError::InvalidShareIndex {
                index,
                max: self.leaf_count().saturating_sub(1),
            });
        }

        let mut proof = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            if let Some(sibling) = level.get(position ^ 1) {
                proof.push(*sibling);
            }
            position /= 2;
        }
        Ok(proof)
    }

    /// Check that `leaf` sits at `index` of a `leaf_count`-leaf tree with `root`
    pub fn verify_proof(
        root: &ContentHash,
        leaf: &ContentHash,
        index: usize,
        leaf_count: usize,
        proof: &[ContentHash],
    ) -> bool {
        if index >= leaf_count {
            return false;
        }

        let mut siblings = proof.iter();
        let mut acc = hash_leaf(leaf);
        let mut position = index;
        let mut width = leaf_count;

        while width > 1 {
            if (position ^ 1) < width {
                let Some(sibling) = siblings.next() else {
                    return false;
                };
                acc = if position % 2 == 0 {
                    hash_node(&acc, sibling)
                } else {
                    hash_node(sibling, &acc)
                };
            }
            position /= 2;
            width = width.div_ceil(2);
        }

        siblings.next().is_none() && &acc == root
    }
}
