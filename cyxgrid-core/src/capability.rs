//! Capability tokens
//!
//! A capability is the only thing a client needs to find, check or read an
//! object. It carries key material (or, for verify-only tokens, just the
//! storage index), an integrity anchor and the coding parameters. It never
//! names a server.
//!
//! Text format, all binary fields base58:
//!
//! ```text
//! cyxgrid:CHK:<key>:<digest>:<k>:<n>:<size>
//! cyxgrid:CHK-V:<storage-index>:<digest>:<k>:<n>:<size>
//! cyxgrid:SSK:<write-key>:<fingerprint>:<k>:<n>
//! cyxgrid:SSK-RO:<read-key>:<fingerprint>:<k>:<n>
//! cyxgrid:SSK-V:<storage-index>:<fingerprint>:<k>:<n>
//! ```

use crate::crypto::{ContentHash, EncryptionKey, StorageIndex, WriteKey};
use crate::erasure::CodingParams;
use crate::error::{GridError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "cyxgrid";
const TAG_CHK: &str = "CHK";
const TAG_CHK_VERIFY: &str = "CHK-V";
const TAG_SSK: &str = "SSK";
const TAG_SSK_READ: &str = "SSK-RO";
const TAG_SSK_VERIFY: &str = "SSK-V";

/// Authority carried by a capability, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityKind {
    Write,
    Read,
    Verify,
}

impl CapabilityKind {
    fn rank(self) -> u8 {
        match self {
            CapabilityKind::Write => 2,
            CapabilityKind::Read => 1,
            CapabilityKind::Verify => 0,
        }
    }

    /// Whether a holder of `self` may derive `other`
    pub fn covers(self, other: CapabilityKind) -> bool {
        self.rank() >= other.rank()
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Write => write!(f, "write"),
            CapabilityKind::Read => write!(f, "read"),
            CapabilityKind::Verify => write!(f, "verify"),
        }
    }
}

/// Read capability for an immutable object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableRead {
    pub key: EncryptionKey,
    pub digest: ContentHash,
    pub params: CodingParams,
    pub size: u64,
}

/// Verify-only capability for an immutable object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableVerify {
    pub storage_index: StorageIndex,
    pub digest: ContentHash,
    pub params: CodingParams,
    pub size: u64,
}

/// Write capability for a mutable slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableWrite {
    pub write_key: WriteKey,
    pub fingerprint: ContentHash,
    pub params: CodingParams,
}

/// Read capability for a mutable slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableRead {
    pub read_key: EncryptionKey,
    pub fingerprint: ContentHash,
    pub params: CodingParams,
}

/// Verify-only capability for a mutable slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableVerify {
    pub storage_index: StorageIndex,
    pub fingerprint: ContentHash,
    pub params: CodingParams,
}

/// Unforgeable reference to an object on the grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    ImmutableRead(ImmutableRead),
    ImmutableVerify(ImmutableVerify),
    MutableWrite(MutableWrite),
    MutableRead(MutableRead),
    MutableVerify(MutableVerify),
}

impl Capability {
    /// Build a capability from raw key material.
    ///
    /// - `Read`: immutable read capability; `key` is the encryption key.
    /// - `Verify`: immutable verify-only capability; the key is reduced to
    ///   its storage index and dropped.
    /// - `Write`: mutable write capability; `key` is the write key and
    ///   `digest` must be its fingerprint. `size` is ignored.
    pub fn mint(
        key: &[u8],
        digest: ContentHash,
        params: CodingParams,
        size: u64,
        kind: CapabilityKind,
    ) -> Result<Self> {
        match kind {
            CapabilityKind::Read => Ok(Capability::ImmutableRead(ImmutableRead {
                key: EncryptionKey::from_slice(key)?,
                digest,
                params,
                size,
            })),
            CapabilityKind::Verify => Ok(Capability::ImmutableVerify(ImmutableVerify {
                storage_index: EncryptionKey::from_slice(key)?.storage_index(),
                digest,
                params,
                size,
            })),
            CapabilityKind::Write => {
                let write_key = WriteKey::from_slice(key)?;
                if write_key.fingerprint() != digest {
                    return Err(GridError::MalformedCapability(
                        "fingerprint does not belong to write key".to_string(),
                    ));
                }
                Ok(Capability::MutableWrite(MutableWrite {
                    write_key,
                    fingerprint: digest,
                    params,
                }))
            }
        }
    }

    /// Fresh write capability for a new mutable slot
    pub fn new_mutable(write_key: WriteKey, params: CodingParams) -> Self {
        let fingerprint = write_key.fingerprint();
        Capability::MutableWrite(MutableWrite {
            write_key,
            fingerprint,
            params,
        })
    }

    /// Parse a capability token
    pub fn parse(token: &str) -> Result<Self> {
        let cap = parse_fields(token)?;
        // Exactly one token per capability
        if cap.to_string() != token {
            return Err(GridError::MalformedCapability(
                "token is not in canonical form".to_string(),
            ));
        }
        Ok(cap)
    }

    /// Authority of this capability
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::MutableWrite(_) => CapabilityKind::Write,
            Capability::ImmutableRead(_) | Capability::MutableRead(_) => CapabilityKind::Read,
            Capability::ImmutableVerify(_) | Capability::MutableVerify(_) => {
                CapabilityKind::Verify
            }
        }
    }

    /// Whether this refers to a mutable slot
    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            Capability::MutableWrite(_) | Capability::MutableRead(_) | Capability::MutableVerify(_)
        )
    }

    /// Coding parameters of the object
    pub fn params(&self) -> CodingParams {
        match self {
            Capability::ImmutableRead(c) => c.params,
            Capability::ImmutableVerify(c) => c.params,
            Capability::MutableWrite(c) => c.params,
            Capability::MutableRead(c) => c.params,
            Capability::MutableVerify(c) => c.params,
        }
    }

    /// Storage index the object's shares are filed under
    pub fn storage_index(&self) -> StorageIndex {
        match self {
            Capability::ImmutableRead(c) => c.key.storage_index(),
            Capability::ImmutableVerify(c) => c.storage_index,
            Capability::MutableWrite(c) => c.write_key.read_key().storage_index(),
            Capability::MutableRead(c) => c.read_key.storage_index(),
            Capability::MutableVerify(c) => c.storage_index,
        }
    }

    /// Key that decrypts the object, if this capability grants reading
    pub fn read_key(&self) -> Option<EncryptionKey> {
        match self {
            Capability::ImmutableRead(c) => Some(c.key.clone()),
            Capability::MutableWrite(c) => Some(c.write_key.read_key()),
            Capability::MutableRead(c) => Some(c.read_key.clone()),
            Capability::ImmutableVerify(_) | Capability::MutableVerify(_) => None,
        }
    }

    /// Capability digest (immutable objects)
    pub fn digest(&self) -> Option<ContentHash> {
        match self {
            Capability::ImmutableRead(c) => Some(c.digest),
            Capability::ImmutableVerify(c) => Some(c.digest),
            _ => None,
        }
    }

    /// Verifying-key fingerprint (mutable slots)
    pub fn fingerprint(&self) -> Option<ContentHash> {
        match self {
            Capability::MutableWrite(c) => Some(c.fingerprint),
            Capability::MutableRead(c) => Some(c.fingerprint),
            Capability::MutableVerify(c) => Some(c.fingerprint),
            _ => None,
        }
    }

    /// Object size (immutable objects; a mutable slot's size varies by version)
    pub fn size(&self) -> Option<u64> {
        match self {
            Capability::ImmutableRead(c) => Some(c.size),
            Capability::ImmutableVerify(c) => Some(c.size),
            _ => None,
        }
    }

    /// Read capability derived from this one; `None` for verify-only tokens
    pub fn to_read_cap(&self) -> Option<Capability> {
        match self {
            Capability::ImmutableRead(_) | Capability::MutableRead(_) => Some(self.clone()),
            Capability::MutableWrite(c) => Some(Capability::MutableRead(MutableRead {
                read_key: c.write_key.read_key(),
                fingerprint: c.fingerprint,
                params: c.params,
            })),
            Capability::ImmutableVerify(_) | Capability::MutableVerify(_) => None,
        }
    }

    /// Verify-only capability derived from this one
    pub fn to_verify_cap(&self) -> Capability {
        match self {
            Capability::ImmutableRead(c) => Capability::ImmutableVerify(ImmutableVerify {
                storage_index: c.key.storage_index(),
                digest: c.digest,
                params: c.params,
                size: c.size,
            }),
            Capability::MutableWrite(c) => Capability::MutableVerify(MutableVerify {
                storage_index: c.write_key.read_key().storage_index(),
                fingerprint: c.fingerprint,
                params: c.params,
            }),
            Capability::MutableRead(c) => Capability::MutableVerify(MutableVerify {
                storage_index: c.read_key.storage_index(),
                fingerprint: c.fingerprint,
                params: c.params,
            }),
            Capability::ImmutableVerify(_) | Capability::MutableVerify(_) => self.clone(),
        }
    }

    /// Derive a capability of `kind`, which may not exceed this one's authority
    pub fn attenuate(&self, kind: CapabilityKind) -> Result<Capability> {
        if !self.kind().covers(kind) {
            return Err(GridError::InsufficientAuthority {
                required: kind.to_string(),
            });
        }
        match kind {
            CapabilityKind::Write => Ok(self.clone()),
            CapabilityKind::Read => self.to_read_cap().ok_or(GridError::InsufficientAuthority {
                required: kind.to_string(),
            }),
            CapabilityKind::Verify => Ok(self.to_verify_cap()),
        }
    }

    /// Binary form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&WireCapability::from(self))?)
    }

    /// Parse the binary form; trailing or non-canonical bytes are rejected
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireCapability = bincode::deserialize(bytes)
            .map_err(|e| GridError::MalformedCapability(e.to_string()))?;
        let cap = Capability::try_from(wire)?;
        if cap.to_bytes()? != bytes {
            return Err(GridError::MalformedCapability(
                "binary capability is not in canonical form".to_string(),
            ));
        }
        Ok(cap)
    }
}

fn malformed(msg: impl Into<String>) -> GridError {
    GridError::MalformedCapability(msg.into())
}

fn parse_params(k: &str, n: &str) -> Result<CodingParams> {
    let needed: usize = k.parse().map_err(|_| malformed(format!("bad k: {:?}", k)))?;
    let total: usize = n.parse().map_err(|_| malformed(format!("bad n: {:?}", n)))?;
    CodingParams::new(needed, total).map_err(|e| malformed(e.to_string()))
}

fn parse_fields(token: &str) -> Result<Capability> {
    let fields: Vec<&str> = token.split(':').collect();
    if fields.len() < 2 || fields[0] != SCHEME {
        return Err(malformed(format!("token must start with {}:", SCHEME)));
    }

    match (fields[1], &fields[2..]) {
        (TAG_CHK, [key, digest, k, n, size]) => Ok(Capability::ImmutableRead(ImmutableRead {
            key: EncryptionKey::from_base58(key)?,
            digest: ContentHash::from_base58(digest)?,
            params: parse_params(k, n)?,
            size: size
                .parse()
                .map_err(|_| malformed(format!("bad size: {:?}", size)))?,
        })),
        (TAG_CHK_VERIFY, [si, digest, k, n, size]) => {
            Ok(Capability::ImmutableVerify(ImmutableVerify {
                storage_index: StorageIndex::from_base58(si)?,
                digest: ContentHash::from_base58(digest)?,
                params: parse_params(k, n)?,
                size: size
                    .parse()
                    .map_err(|_| malformed(format!("bad size: {:?}", size)))?,
            }))
        }
        (TAG_SSK, [wk, fp, k, n]) => {
            let write_key = WriteKey::from_base58(wk)?;
            let fingerprint = ContentHash::from_base58(fp)?;
            if write_key.fingerprint() != fingerprint {
                return Err(malformed("fingerprint does not belong to write key"));
            }
            Ok(Capability::MutableWrite(MutableWrite {
                write_key,
                fingerprint,
                params: parse_params(k, n)?,
            }))
        }
        (TAG_SSK_READ, [rk, fp, k, n]) => Ok(Capability::MutableRead(MutableRead {
            read_key: EncryptionKey::from_base58(rk)?,
            fingerprint: ContentHash::from_base58(fp)?,
            params: parse_params(k, n)?,
        })),
        (TAG_SSK_VERIFY, [si, fp, k, n]) => Ok(Capability::MutableVerify(MutableVerify {
            storage_index: StorageIndex::from_base58(si)?,
            fingerprint: ContentHash::from_base58(fp)?,
            params: parse_params(k, n)?,
        })),
        (tag, rest) => Err(malformed(format!(
            "unknown tag {:?} with {} fields",
            tag,
            rest.len()
        ))),
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ImmutableRead(c) => write!(
                f,
                "{}:{}:{}:{}:{}:{}:{}",
                SCHEME,
                TAG_CHK,
                c.key.to_base58(),
                c.digest.to_base58(),
                c.params.needed(),
                c.params.total(),
                c.size
            ),
            Capability::ImmutableVerify(c) => write!(
                f,
                "{}:{}:{}:{}:{}:{}:{}",
                SCHEME,
                TAG_CHK_VERIFY,
                c.storage_index.to_base58(),
                c.digest.to_base58(),
                c.params.needed(),
                c.params.total(),
                c.size
            ),
            Capability::MutableWrite(c) => write!(
                f,
                "{}:{}:{}:{}:{}:{}",
                SCHEME,
                TAG_SSK,
                c.write_key.to_base58(),
                c.fingerprint.to_base58(),
                c.params.needed(),
                c.params.total()
            ),
            Capability::MutableRead(c) => write!(
                f,
                "{}:{}:{}:{}:{}:{}",
                SCHEME,
                TAG_SSK_READ,
                c.read_key.to_base58(),
                c.fingerprint.to_base58(),
                c.params.needed(),
                c.params.total()
            ),
            Capability::MutableVerify(c) => write!(
                f,
                "{}:{}:{}:{}:{}:{}",
                SCHEME,
                TAG_SSK_VERIFY,
                c.storage_index.to_base58(),
                c.fingerprint.to_base58(),
                c.params.needed(),
                c.params.total()
            ),
        }
    }
}

impl FromStr for Capability {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::parse(s)
    }
}

impl Serialize for Capability {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        Capability::parse(&token).map_err(serde::de::Error::custom)
    }
}

/// Binary representation; keys travel as raw bytes
#[derive(Serialize, Deserialize)]
enum WireCapability {
    ImmutableRead {
        key: [u8; 32],
        digest: ContentHash,
        params: CodingParams,
        size: u64,
    },
    ImmutableVerify {
        storage_index: StorageIndex,
        digest: ContentHash,
        params: CodingParams,
        size: u64,
    },
    MutableWrite {
        write_key: [u8; 32],
        fingerprint: ContentHash,
        params: CodingParams,
    },
    MutableRead {
        read_key: [u8; 32],
        fingerprint: ContentHash,
        params: CodingParams,
    },
    MutableVerify {
        storage_index: StorageIndex,
        fingerprint: ContentHash,
        params: CodingParams,
    },
}

impl From<&Capability> for WireCapability {
    fn from(cap: &Capability) -> Self {
        match cap {
            Capability::ImmutableRead(c) => WireCapability::ImmutableRead {
                key: *c.key.as_bytes(),
                digest: c.digest,
                params: c.params,
                size: c.size,
            },
            Capability::ImmutableVerify(c) => WireCapability::ImmutableVerify {
                storage_index: c.storage_index,
                digest: c.digest,
                params: c.params,
                size: c.size,
            },
            Capability::MutableWrite(c) => WireCapability::MutableWrite {
                write_key: *c.write_key.as_bytes(),
                fingerprint: c.fingerprint,
                params: c.params,
            },
            Capability::MutableRead(c) => WireCapability::MutableRead {
                read_key: *c.read_key.as_bytes(),
                fingerprint: c.fingerprint,
                params: c.params,
            },
            Capability::MutableVerify(c) => WireCapability::MutableVerify {
                storage_index: c.storage_index,
                fingerprint: c.fingerprint,
                params: c.params,
            },
        }
    }
}

impl TryFrom<WireCapability> for Capability {
    type Error = GridError;

    fn try_from(wire: WireCapability) -> Result<Self> {
        Ok(match wire {
            WireCapability::ImmutableRead {
                key,
                digest,
                params,
                size,
            } => Capability::ImmutableRead(ImmutableRead {
                key: EncryptionKey::from_bytes(key),
                digest,
                params,
                size,
            }),
            WireCapability::ImmutableVerify {
                storage_index,
                digest,
                params,
                size,
            } => Capability::ImmutableVerify(ImmutableVerify {
                storage_index,
                digest,
                params,
                size,
            }),
            WireCapability::MutableWrite {
                write_key,
                fingerprint,
                params,
            } => {
                let write_key = WriteKey::from_bytes(write_key);
                if write_key.fingerprint() != fingerprint {
                    return Err(malformed("fingerprint does not belong to write key"));
                }
                Capability::MutableWrite(MutableWrite {
                    write_key,
                    fingerprint,
                    params,
                })
            }
            WireCapability::MutableRead {
                read_key,
                fingerprint,
                params,
            } => Capability::MutableRead(MutableRead {
                read_key: EncryptionKey::from_bytes(read_key),
                fingerprint,
                params,
            }),
            WireCapability::MutableVerify {
                storage_index,
                fingerprint,
                params,
            } => Capability::MutableVerify(MutableVerify {
                storage_index,
                fingerprint,
                params,
            }),
        })
    }
}
