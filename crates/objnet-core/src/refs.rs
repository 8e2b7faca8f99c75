//! Container, object and owner identifiers plus the addresses built from them.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ObjnetError, Result};

pub const CONTAINER_ID_SIZE: usize = 32;
pub const OWNER_ID_SIZE: usize = 25;

const OWNER_ID_VERSION: u8 = 0x35;
const OWNER_CHECKSUM_SIZE: usize = 4;

/// 32-byte container identifier, rendered as lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(#[serde(with = "crate::serde_hex")] [u8; CONTAINER_ID_SIZE]);

impl ContainerId {
    pub fn from_bytes(bytes: [u8; CONTAINER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTAINER_ID_SIZE] {
        &self.0
    }
}

impl FromStr for ContainerId {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| ObjnetError::format("container id", e))?;
        let arr: [u8; CONTAINER_ID_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            ObjnetError::format(
                "container id",
                format!("expected {CONTAINER_ID_SIZE} bytes, got {}", v.len()),
            )
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Object identifier. Fixed at creation and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ObjnetError::format("object id", e))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Owner identifier derived from an Ed25519 public key:
/// version byte, 20-byte key hash, 4-byte checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(#[serde(with = "crate::serde_hex")] [u8; OWNER_ID_SIZE]);

impl OwnerId {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let key_hash = Sha256::digest(key.as_bytes());
        let mut out = [0u8; OWNER_ID_SIZE];
        out[0] = OWNER_ID_VERSION;
        out[1..21].copy_from_slice(&key_hash[..20]);
        let checksum = owner_checksum(&out[..21]);
        out[21..].copy_from_slice(&checksum);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; OWNER_ID_SIZE] {
        &self.0
    }
}

fn owner_checksum(prefix: &[u8]) -> [u8; OWNER_CHECKSUM_SIZE] {
    let first = Sha256::digest(prefix);
    let second = Sha256::digest(first);
    let mut out = [0u8; OWNER_CHECKSUM_SIZE];
    out.copy_from_slice(&second[..OWNER_CHECKSUM_SIZE]);
    out
}

impl FromStr for OwnerId {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| ObjnetError::format("owner id", e))?;
        let arr: [u8; OWNER_ID_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            ObjnetError::format(
                "owner id",
                format!("expected {OWNER_ID_SIZE} bytes, got {}", v.len()),
            )
        })?;
        if arr[0] != OWNER_ID_VERSION {
            return Err(ObjnetError::format("owner id", "unknown version byte"));
        }
        if owner_checksum(&arr[..21]) != arr[21..] {
            return Err(ObjnetError::format("owner id", "checksum mismatch"));
        }
        Ok(Self(arr))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Immutable (container, object) pair naming one stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    container_id: ContainerId,
    object_id: ObjectId,
}

impl Address {
    pub fn new(container_id: ContainerId, object_id: ObjectId) -> Self {
        Self {
            container_id,
            object_id,
        }
    }

    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }
}

impl FromStr for Address {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        let (cid, oid) = s
            .split_once('/')
            .ok_or_else(|| ObjnetError::format("address", "expected '<cid>/<oid>'"))?;
        Ok(Self::new(cid.parse()?, oid.parse()?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_id, self.object_id)
    }
}
