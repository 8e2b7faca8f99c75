//! Object data model: system header, typed headers, payload ranges and
//! search queries.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{ObjnetError, Result};
use crate::refs::{Address, ContainerId, ObjectId, OwnerId};
use crate::session::SessionToken;

/// Search key matching objects that carry a [`Header::Root`] marker.
pub const KEY_ROOT_OBJECT: &str = "ROOT";
/// Search key matching objects that carry a [`Header::StorageGroup`] marker.
pub const KEY_STORAGE_GROUP: &str = "STORAGE_GROUP";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationPoint {
    pub unix_time: i64,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHeader {
    pub id: ObjectId,
    pub owner_id: OwnerId,
    pub container_id: ContainerId,
    pub payload_length: u64,
    pub version: u64,
    pub created_at: CreationPoint,
}

impl SystemHeader {
    pub fn address(&self) -> Address {
        Address::new(self.container_id, self.id)
    }
}

/// Typed header entry. Order within an object is significant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Header {
    User {
        key: String,
        value: String,
    },
    Tombstone,
    StorageGroup,
    Root,
    /// Session token that authorised the operation producing the object.
    Session {
        token: SessionToken,
    },
    /// Checksum over everything before it, signed by the session key.
    Integrity {
        #[serde(with = "crate::serde_hex")]
        checksum: [u8; 32],
        #[serde(with = "crate::serde_hex")]
        signature: Vec<u8>,
    },
}

impl Header {
    pub fn user(key: impl Into<String>, value: impl Into<String>) -> Self {
        Header::User {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::User { key, value } => write!(f, "user: {key}={value}"),
            Header::Tombstone => f.write_str("tombstone"),
            Header::StorageGroup => f.write_str("storage group"),
            Header::Root => f.write_str("root"),
            Header::Session { token } => write!(
                f,
                "session: owner={} objects={} epochs=[{}, {}]",
                token.owner_id,
                token.object_ids.len(),
                token.first_epoch,
                token.last_epoch
            ),
            Header::Integrity { checksum, .. } => {
                write!(f, "integrity: checksum={}", hex::encode(checksum))
            }
        }
    }
}

/// Parse a `key=value` user header. Splits on the first `=`; a missing
/// `=` gives an empty value.
pub fn parse_user_header(s: &str) -> Header {
    match s.split_once('=') {
        Some((key, value)) => Header::user(key, value),
        None => Header::user(s, ""),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub system_header: SystemHeader,
    pub headers: Vec<Header>,
    #[serde(with = "crate::serde_hex")]
    pub payload: Vec<u8>,
}

impl Object {
    pub fn new(system_header: SystemHeader, headers: Vec<Header>) -> Self {
        Self {
            system_header,
            headers,
            payload: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.system_header.address()
    }

    /// Last header matching `pred`, with its position.
    pub fn last_header(&self, pred: impl Fn(&Header) -> bool) -> Option<(usize, &Header)> {
        self.headers.iter().enumerate().rev().find(|(_, h)| pred(h))
    }

    pub fn is_tombstone(&self) -> bool {
        self.last_header(|h| matches!(h, Header::Tombstone)).is_some()
    }

    pub fn user_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().filter_map(|h| match h {
            Header::User { key, value } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    fn checksum_until(&self, end: usize) -> Result<[u8; 32]> {
        let canonical = serde_json::to_vec(&(&self.system_header, &self.headers[..end]))
            .map_err(|e| ObjnetError::Corrupted(format!("can't encode header: {e}")))?;
        Ok(Sha256::digest(canonical).into())
    }

    /// Append an integrity header signed by `session_key`.
    pub fn seal(&mut self, session_key: &SigningKey) -> Result<()> {
        let checksum = self.checksum_until(self.headers.len())?;
        let signature = session_key.sign(&checksum);
        self.headers.push(Header::Integrity {
            checksum,
            signature: signature.to_bytes().to_vec(),
        });
        Ok(())
    }

    /// Check the integrity header against the session token carried by
    /// the object.
    pub fn verify(&self) -> Result<()> {
        let (idx, checksum, signature) = self
            .headers
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, h)| match h {
                Header::Integrity {
                    checksum,
                    signature,
                } => Some((i, checksum, signature)),
                _ => None,
            })
            .ok_or_else(|| ObjnetError::Corrupted("missing integrity header".into()))?;

        let token = self.headers[..idx]
            .iter()
            .rev()
            .find_map(|h| match h {
                Header::Session { token } => Some(token),
                _ => None,
            })
            .ok_or_else(|| ObjnetError::Corrupted("missing session header".into()))?;

        token
            .verify_owner()
            .map_err(|e| ObjnetError::Corrupted(format!("session token: {e}")))?;
        if token.owner_id != self.system_header.owner_id {
            return Err(ObjnetError::Corrupted(
                "session owner differs from object owner".into(),
            ));
        }
        if !token.object_ids.contains(&self.system_header.id) {
            return Err(ObjnetError::Corrupted(
                "session scope does not cover object".into(),
            ));
        }

        if self.checksum_until(idx)? != *checksum {
            return Err(ObjnetError::Corrupted("header checksum mismatch".into()));
        }

        let session_key = token
            .header
            .public_key
            .ok_or_else(|| ObjnetError::Corrupted("session token without public key".into()))?;
        let key = VerifyingKey::from_bytes(&session_key)
            .map_err(|e| ObjnetError::Corrupted(format!("session public key: {e}")))?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| ObjnetError::Corrupted(format!("integrity signature: {e}")))?;
        key.verify(checksum, &sig)
            .map_err(|_| ObjnetError::Corrupted("integrity signature invalid".into()))
    }
}

/// Byte range over an object payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.offset, self.length)
    }
}

impl std::str::FromStr for Range {
    type Err = ObjnetError;

    fn from_str(s: &str) -> Result<Self> {
        let (offset, length) = s
            .split_once(':')
            .ok_or_else(|| ObjnetError::format("range", "range must have form 'offset:length'"))?;
        let offset = offset
            .parse()
            .map_err(|e| ObjnetError::format("range offset", e))?;
        let length = length
            .parse()
            .map_err(|e| ObjnetError::format("range length", e))?;
        Ok(Range { offset, length })
    }
}

pub fn parse_ranges<S: AsRef<str>>(items: &[S]) -> Result<Vec<Range>> {
    items.iter().map(|s| s.as_ref().parse()).collect()
}

/// Hex-decode a salt; the empty string means no salt.
pub fn parse_salt(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim()).map_err(|e| ObjnetError::format("salt", e))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Exact,
    Regex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kind: FilterKind,
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
}

impl Query {
    /// Regex filters from positional `name value` pairs.
    pub fn from_pairs<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() % 2 != 0 {
            return Err(ObjnetError::format(
                "query",
                "number of positional arguments must be even",
            ));
        }
        let filters = args
            .chunks(2)
            .map(|pair| Filter {
                kind: FilterKind::Regex,
                name: pair[0].as_ref().to_string(),
                value: pair[1].as_ref().to_string(),
            })
            .collect();
        Ok(Self { filters })
    }

    pub fn with_exact(mut self, name: &str) -> Self {
        self.filters.push(Filter {
            kind: FilterKind::Exact,
            name: name.to_string(),
            value: String::new(),
        });
        self
    }

    /// Whether `object` satisfies every filter.
    pub fn matches(&self, object: &Object) -> Result<bool> {
        for filter in &self.filters {
            let hit = match (filter.name.as_str(), filter.kind) {
                (KEY_ROOT_OBJECT, FilterKind::Exact) => {
                    object.headers.iter().any(|h| matches!(h, Header::Root))
                }
                (KEY_STORAGE_GROUP, FilterKind::Exact) => object
                    .headers
                    .iter()
                    .any(|h| matches!(h, Header::StorageGroup)),
                (name, FilterKind::Exact) => object
                    .user_headers()
                    .any(|(k, v)| k == name && v == filter.value),
                (name, FilterKind::Regex) => {
                    let re = Regex::new(&filter.value)
                        .map_err(|e| ObjnetError::format("query regex", e))?;
                    object
                        .user_headers()
                        .any(|(k, v)| k == name && re.is_match(v))
                }
            };
            if !hit {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
