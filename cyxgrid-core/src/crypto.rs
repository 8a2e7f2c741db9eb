//! Cryptographic primitives for CyxGrid
//!
//! Provides:
//! - Blake3 content hashing for shares
//! - ChaCha20 stream sealing (ciphertext is exactly as long as plaintext)
//! - One-way key derivations: write key → read key → storage index
//! - Convergent key derivation and Argon2 convergence secrets
//! - The capability digest binding coding parameters, layout and share hashes

use crate::erasure::CodingParams;
use crate::error::{GridError, Result};
use crate::merkle::MerkleTree;
use crate::share::SegmentLayout;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Storage index size (16 bytes)
pub const STORAGE_INDEX_SIZE: usize = 16;

/// Every key seals exactly one keystream, so the nonce is fixed.
const STREAM_NONCE: [u8; 12] = [0u8; 12];

const READ_KEY_CONTEXT: &str = "cyxgrid 2026-10 read key from write key";
const STORAGE_INDEX_CONTEXT: &str = "cyxgrid 2026-10 storage index from read key";
const CONVERGENT_KEY_CONTEXT: &str = "cyxgrid 2026-10 convergent encryption key";
const VERSION_KEY_CONTEXT: &str = "cyxgrid 2026-10 mutable version encryption key";
const CAPABILITY_DIGEST_CONTEXT: &str = "cyxgrid 2026-10 capability digest";

/// 32-byte BLAKE3 digest: share hashes, Merkle nodes, capability digests
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Same digest as [`ContentHash::compute`], hashed across the rayon pool
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from(bytes))
    }

    pub(crate) fn from_blake3(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Token field form
    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_bytes()).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        Ok(Self::from_bytes(decode_base58_array::<32>(s)?))
    }

    /// Whether `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.debug_tuple("ContentHash").field(&&hex[..16]).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let bytes = <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
            serde::de::Error::invalid_length(raw.len(), &"a 32-byte BLAKE3 digest")
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

/// Decode a base58 field that must be exactly `N` bytes
pub(crate) fn decode_base58_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| GridError::MalformedCapability(e.to_string()))?;
    if bytes.len() != N {
        return Err(GridError::MalformedCapability(format!(
            "Invalid length: expected {}, got {}",
            N,
            bytes.len()
        )));
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn check_key_length(slice: &[u8]) -> Result<[u8; KEY_SIZE]> {
    if slice.len() != KEY_SIZE {
        return Err(GridError::KeyLengthError {
            expected: KEY_SIZE,
            actual: slice.len(),
        });
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(slice);
    Ok(key)
}

fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Read key: decrypts content. Derives the storage index, never the reverse.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        Self(random_key())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        Ok(Self(check_key_length(slice)?))
    }

    /// Convergent key: identical secret, parameters and plaintext give the same key.
    ///
    /// Parameters and segment size are mixed in so that re-encoding the same
    /// file differently lands on a different storage index.
    pub fn convergent(
        secret: &ConvergenceSecret,
        params: &CodingParams,
        segment_size: usize,
        plaintext: &[u8],
    ) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(CONVERGENT_KEY_CONTEXT);
        hasher.update(secret.as_bytes());
        hasher.update(&(params.needed() as u16).to_le_bytes());
        hasher.update(&(params.total() as u16).to_le_bytes());
        hasher.update(&(segment_size as u64).to_le_bytes());
        hasher.update_rayon(plaintext);
        Self(*hasher.finalize().as_bytes())
    }

    /// Per-version encryption key of a mutable slot
    pub fn version_key(&self, seqnum: u64) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(VERSION_KEY_CONTEXT);
        hasher.update(&self.0);
        hasher.update(&seqnum.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Storage index of the object this key reads
    pub fn storage_index(&self) -> StorageIndex {
        StorageIndex::derive(self)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt `plaintext` as the keystream window starting at `offset`
    pub fn seal_at(&self, plaintext: &[u8], offset: u64) -> Result<Vec<u8>> {
        let mut buf = plaintext.to_vec();
        self.apply_keystream(&mut buf, offset)?;
        Ok(buf)
    }

    /// Decrypt a window sealed with [`EncryptionKey::seal_at`]
    pub fn unseal_at(&self, ciphertext: &[u8], offset: u64) -> Result<Vec<u8>> {
        // XOR keystream: the inverse is the same operation
        self.seal_at(ciphertext, offset)
    }

    /// XOR the keystream at `offset` into `buf` in place
    pub fn apply_keystream(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut cipher = ChaCha20::new(Key::from_slice(&self.0), Nonce::from_slice(&STREAM_NONCE));
        cipher
            .try_seek(offset)
            .map_err(|e| GridError::Crypto(e.to_string()))?;
        cipher
            .try_apply_keystream(buf)
            .map_err(|e| GridError::Crypto(e.to_string()))
    }

    pub(crate) fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub(crate) fn from_base58(s: &str) -> Result<Self> {
        Ok(Self(decode_base58_array::<KEY_SIZE>(s)?))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        // Zeroize key on drop
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Write key of a mutable slot: derives the read key and the signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct WriteKey([u8; KEY_SIZE]);

impl WriteKey {
    /// Generate a new random write key
    pub fn generate() -> Self {
        Self(random_key())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        Ok(Self(check_key_length(slice)?))
    }

    /// Read key for this slot (one-way)
    pub fn read_key(&self) -> EncryptionKey {
        EncryptionKey(blake3::derive_key(READ_KEY_CONTEXT, &self.0))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub(crate) fn from_base58(s: &str) -> Result<Self> {
        Ok(Self(decode_base58_array::<KEY_SIZE>(s)?))
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteKey([REDACTED])")
    }
}

impl Drop for WriteKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Secret mixed into convergent keys so that only holders of the same
/// secret deduplicate against each other.
#[derive(Clone)]
pub struct ConvergenceSecret([u8; KEY_SIZE]);

impl ConvergenceSecret {
    /// Generate a new random secret
    pub fn generate() -> Self {
        Self(random_key())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a base58-encoded secret (configuration form)
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = decode_base58_array::<KEY_SIZE>(s)
            .map_err(|e| GridError::Configuration(format!("convergence secret: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Stretch a shared passphrase into a secret with Argon2id defaults
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> Result<Self> {
        use argon2::password_hash::SaltString;
        use argon2::{Argon2, PasswordHasher};
        use base64::engine::general_purpose::STANDARD_NO_PAD;
        use base64::Engine;

        let crypto_err = |e: argon2::password_hash::Error| GridError::Crypto(e.to_string());
        let salt = SaltString::from_b64(&STANDARD_NO_PAD.encode(salt)).map_err(crypto_err)?;
        let output = Argon2::default()
            .hash_password(password, &salt)
            .map_err(crypto_err)?
            .hash
            .ok_or_else(|| GridError::Crypto("argon2 produced no output".to_string()))?;

        Ok(Self(check_key_length(output.as_bytes())?))
    }

    /// Get the raw secret bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ConvergenceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConvergenceSecret([REDACTED])")
    }
}

impl Drop for ConvergenceSecret {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Grid-wide identifier of an object, derived one-way from its read key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageIndex([u8; STORAGE_INDEX_SIZE]);

impl StorageIndex {
    /// Derive from the read key
    pub fn derive(key: &EncryptionKey) -> Self {
        let full = blake3::derive_key(STORAGE_INDEX_CONTEXT, key.as_bytes());
        let mut index = [0u8; STORAGE_INDEX_SIZE];
        index.copy_from_slice(&full[..STORAGE_INDEX_SIZE]);
        Self(index)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; STORAGE_INDEX_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; STORAGE_INDEX_SIZE] {
        &self.0
    }

    /// Convert to base58 string
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self> {
        Ok(Self(decode_base58_array::<STORAGE_INDEX_SIZE>(s)?))
    }
}

impl fmt::Debug for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base58();
        write!(f, "StorageIndex({})", &text[..text.len().min(8)])
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Encrypt a whole stream with a raw 32-byte key
pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    EncryptionKey::from_slice(key)?.seal_at(plaintext, 0)
}

/// Decrypt a whole stream with a raw 32-byte key
pub fn unseal(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    EncryptionKey::from_slice(key)?.unseal_at(ciphertext, 0)
}

/// Bind a Merkle root over share hashes to the coding parameters and layout.
///
/// This is the integrity anchor carried by immutable capabilities.
pub fn bind_digest(
    params: &CodingParams,
    layout: &SegmentLayout,
    merkle_root: &ContentHash,
) -> ContentHash {
    let mut hasher = blake3::Hasher::new_derive_key(CAPABILITY_DIGEST_CONTEXT);
    hasher.update(&(params.needed() as u16).to_le_bytes());
    hasher.update(&(params.total() as u16).to_le_bytes());
    hasher.update(&layout.size.to_le_bytes());
    hasher.update(&layout.segment_size.to_le_bytes());
    hasher.update(merkle_root.as_bytes());
    ContentHash::from_blake3(hasher.finalize())
}

/// Capability digest over every share hash of an object.
///
/// `share_hashes` are ordered segment-major, then by share index.
pub fn derive_capability_digest(
    params: &CodingParams,
    layout: &SegmentLayout,
    share_hashes: &[ContentHash],
) -> ContentHash {
    let tree = MerkleTree::new(share_hashes);
    bind_digest(params, layout, &tree.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_hash_token_field() {
        let hash = ContentHash::compute(b"share bytes");
        assert_ne!(hash, ContentHash::compute(b"share bytez"));
        assert_eq!(ContentHash::from_base58(&hash.to_base58()).unwrap(), hash);
        assert!(matches!(
            ContentHash::from_base58(&bs58::encode([1u8; 31]).into_string()),
            Err(GridError::MalformedCapability(_))
        ));
        assert!(format!("{:?}", hash).starts_with("ContentHash(\""));
    }

    #[test]
    fn test_hash_checks_share_bytes() {
        let share = b"sealed share bytes";
        let digest = ContentHash::compute(share);
        assert!(digest.verify(share));

        let mut flipped = share.to_vec();
        flipped[3] ^= 0x01;
        assert!(!digest.verify(&flipped));
        assert!(!digest.verify(&share[..share.len() - 1]));
    }

    #[test]
    fn test_parallel_hash_matches_serial() {
        let segment: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
        assert_eq!(ContentHash::compute(&segment), ContentHash::compute_parallel(&segment));
    }

    #[test]
    fn test_seal_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"segment plaintext";

        let sealed = seal(plaintext, key.as_bytes()).unwrap();
        assert_eq!(sealed.len(), plaintext.len());
        assert_ne!(sealed.as_slice(), plaintext.as_slice());

        let opened = unseal(&sealed, key.as_bytes()).unwrap();
        assert_eq!(opened.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn test_seal_is_deterministic() {
        let key = EncryptionKey::from_bytes([7u8; KEY_SIZE]);
        let a = key.seal_at(b"same input", 0).unwrap();
        let b = key.seal_at(b"same input", 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_windows_match_whole_stream() {
        let key = EncryptionKey::generate();
        let plaintext: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let whole = key.seal_at(&plaintext, 0).unwrap();

        let mut pieces = Vec::new();
        for (i, chunk) in plaintext.chunks(999).enumerate() {
            pieces.extend(key.seal_at(chunk, (i * 999) as u64).unwrap());
        }
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_wrong_key_length() {
        let result = seal(b"data", &[0u8; 16]);
        assert!(matches!(
            result,
            Err(GridError::KeyLengthError {
                expected: 32,
                actual: 16
            })
        ));
        assert!(unseal(b"data", &[0u8; 33]).is_err());
    }

    #[test]
    fn test_wrong_key_does_not_unseal() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();
        let sealed = seal(b"secret", key1.as_bytes()).unwrap();
        let opened = unseal(&sealed, key2.as_bytes()).unwrap();
        assert_ne!(opened.as_slice(), b"secret");
    }

    #[test]
    fn test_key_derivations_are_one_way_chain() {
        let write = WriteKey::from_bytes([1u8; KEY_SIZE]);
        let read = write.read_key();
        assert_ne!(read.as_bytes(), write.as_bytes());
        assert_eq!(read, write.read_key());

        let index = read.storage_index();
        assert_eq!(index, StorageIndex::derive(&read));
        assert_ne!(&index.as_bytes()[..], &read.as_bytes()[..STORAGE_INDEX_SIZE]);

        assert_ne!(read.version_key(1), read.version_key(2));
    }

    #[test]
    fn test_convergent_key() {
        let secret = ConvergenceSecret::from_bytes([9u8; KEY_SIZE]);
        let params = CodingParams::new(3, 10).unwrap();

        let a = EncryptionKey::convergent(&secret, &params, 4096, b"same file");
        let b = EncryptionKey::convergent(&secret, &params, 4096, b"same file");
        assert_eq!(a, b);

        let other_file = EncryptionKey::convergent(&secret, &params, 4096, b"other file");
        assert_ne!(a, other_file);

        let other_params = CodingParams::new(2, 10).unwrap();
        assert_ne!(a, EncryptionKey::convergent(&secret, &other_params, 4096, b"same file"));

        let other_secret = ConvergenceSecret::from_bytes([8u8; KEY_SIZE]);
        assert_ne!(a, EncryptionKey::convergent(&other_secret, &params, 4096, b"same file"));
    }

    #[test]
    fn test_secret_from_password() {
        let a = ConvergenceSecret::derive_from_password(b"hunter2", b"grid-salt").unwrap();
        let b = ConvergenceSecret::derive_from_password(b"hunter2", b"grid-salt").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let c = ConvergenceSecret::derive_from_password(b"hunter3", b"grid-salt").unwrap();
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let key = EncryptionKey::generate();
        assert_eq!(format!("{:?}", key), "EncryptionKey([REDACTED])");
        assert_eq!(format!("{:?}", WriteKey::generate()), "WriteKey([REDACTED])");
    }

    #[test]
    fn test_capability_digest_binds_layout() {
        let params = CodingParams::new(2, 3).unwrap();
        let hashes: Vec<ContentHash> = (0u8..6).map(|i| ContentHash::compute(&[i])).collect();

        let layout_a = SegmentLayout::new(8000, 4096).unwrap();
        let layout_b = SegmentLayout::new(8000, 5000).unwrap();

        let a = derive_capability_digest(&params, &layout_a, &hashes);
        assert_eq!(a, derive_capability_digest(&params, &layout_a, &hashes));
        assert_ne!(a, derive_capability_digest(&params, &layout_b, &hashes));

        let mut swapped = hashes.clone();
        swapped.swap(0, 1);
        assert_ne!(a, derive_capability_digest(&params, &layout_a, &swapped));
    }
}
