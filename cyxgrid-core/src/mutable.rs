//! Signed versions for mutable slots
//!
//! A mutable slot is addressed by a write key. The write key derives an
//! Ed25519 signing key; capabilities carry only the fingerprint of the
//! matching verifying key. Every published version is signed over its
//! sequence number, coding parameters, layout and Merkle root, so a storage
//! endpoint can neither roll a reader back to a forged version nor splice
//! shares of two versions together.

use crate::crypto::{ContentHash, StorageIndex, WriteKey};
use crate::erasure::CodingParams;
use crate::error::{GridError, Result};
use crate::share::SegmentLayout;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

const SIGNING_KEY_CONTEXT: &str = "cyxgrid 2026-10 version signing key from write key";
const FINGERPRINT_CONTEXT: &str = "cyxgrid 2026-10 verifying key fingerprint";
const VERSION_MESSAGE_TAG: &[u8] = b"cyxgrid-version-v1";

impl WriteKey {
    /// Ed25519 key that signs versions of this slot
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&blake3::derive_key(SIGNING_KEY_CONTEXT, self.as_bytes()))
    }

    /// Fingerprint of the slot's verifying key
    pub fn fingerprint(&self) -> ContentHash {
        fingerprint_of(self.signing_key().verifying_key().as_bytes())
    }
}

/// Fingerprint of raw verifying key bytes
pub fn fingerprint_of(verifying_key: &[u8; 32]) -> ContentHash {
    ContentHash::from_bytes(blake3::derive_key(FINGERPRINT_CONTEXT, verifying_key))
}

fn version_message(
    storage_index: &StorageIndex,
    seqnum: u64,
    params: &CodingParams,
    layout: &SegmentLayout,
    merkle_root: &ContentHash,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(VERSION_MESSAGE_TAG.len() + 16 + 8 + 4 + 12 + 32);
    msg.extend_from_slice(VERSION_MESSAGE_TAG);
    msg.extend_from_slice(storage_index.as_bytes());
    msg.extend_from_slice(&seqnum.to_le_bytes());
    msg.extend_from_slice(&(params.needed() as u16).to_le_bytes());
    msg.extend_from_slice(&(params.total() as u16).to_le_bytes());
    msg.extend_from_slice(&layout.size.to_le_bytes());
    msg.extend_from_slice(&layout.segment_size.to_le_bytes());
    msg.extend_from_slice(merkle_root.as_bytes());
    msg
}

/// Version header carried by every share of a mutable slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVersion {
    /// Monotonic sequence number; readers take the highest valid one
    pub seqnum: u64,
    /// Ed25519 verifying key
    pub verifying_key: [u8; 32],
    /// Ed25519 signature (64 bytes)
    pub signature: Vec<u8>,
}

impl SignedVersion {
    /// Sign a version of the slot owned by `write_key`
    pub fn sign(
        write_key: &WriteKey,
        storage_index: &StorageIndex,
        seqnum: u64,
        params: &CodingParams,
        layout: &SegmentLayout,
        merkle_root: &ContentHash,
    ) -> Self {
        let signing_key = write_key.signing_key();
        let msg = version_message(storage_index, seqnum, params, layout, merkle_root);
        let signature: Signature = signing_key.sign(&msg);
        Self {
            seqnum,
            verifying_key: signing_key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check the embedded key against `fingerprint` and the signature
    /// against the version fields
    pub fn verify(
        &self,
        fingerprint: &ContentHash,
        storage_index: &StorageIndex,
        params: &CodingParams,
        layout: &SegmentLayout,
        merkle_root: &ContentHash,
    ) -> Result<()> {
        if &fingerprint_of(&self.verifying_key) != fingerprint {
            return Err(GridError::InvalidSignature(
                "verifying key does not match fingerprint".to_string(),
            ));
        }

        let verifying_key = VerifyingKey::from_bytes(&self.verifying_key)
            .map_err(|e| GridError::InvalidSignature(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| GridError::InvalidSignature(e.to_string()))?;
        let msg = version_message(storage_index, self.seqnum, params, layout, merkle_root);

        verifying_key
            .verify_strict(&msg, &signature)
            .map_err(|e| GridError::InvalidSignature(e.to_string()))
    }
}
