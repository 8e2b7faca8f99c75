//! Request and response messages of the remote object service.

use serde::{Deserialize, Serialize};

use crate::object::{Object, Query, Range};
use crate::refs::{Address, ContainerId, OwnerId};
use crate::session::SessionToken;
use crate::tz::Digest;

/// Default request time-to-live (hops through the storage network).
pub const DEFAULT_TTL: u32 = 2;

/// Operation selector sent as the first frame of a network stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rpc {
    Put,
    Get,
    Delete,
    Head,
    Search,
    GetRange,
    GetRangeHash,
    CreateSession,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum PutRequest {
    Header {
        object: Object,
        token: Option<SessionToken>,
        ttl: u32,
    },
    Chunk {
        #[serde(with = "crate::serde_hex")]
        data: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub address: Address,
    pub ttl: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum GetResponse {
    /// First frame: object header, possibly with a leading payload slice.
    Object { object: Object },
    Chunk {
        #[serde(with = "crate::serde_hex")]
        data: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub address: Address,
    pub owner_id: OwnerId,
    pub token: SessionToken,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadRequest {
    pub address: Address,
    pub full_headers: bool,
    pub ttl: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadResponse {
    pub object: Object,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub container_id: ContainerId,
    pub query: Query,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub addresses: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRangeRequest {
    pub address: Address,
    pub ranges: Vec<Range>,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRangeResponse {
    #[serde(with = "fragments")]
    pub fragments: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRangeHashRequest {
    pub address: Address,
    pub ranges: Vec<Range>,
    #[serde(with = "crate::serde_hex")]
    pub salt: Vec<u8>,
    pub ttl: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRangeHashResponse {
    pub hashes: Vec<Digest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CreateRequest {
    /// Client proposal: owner, scope and epoch window.
    Init { token: SessionToken },
    /// The echoed token, signed by the client.
    Signed { token: SessionToken },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CreateResponse {
    /// Echo of the proposal carrying the negotiated public key.
    Unsigned { token: SessionToken },
    /// Final token accepted by the service.
    Result { token: SessionToken },
}

mod fragments {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(value.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| hex::decode(s).map_err(D::Error::custom))
            .collect()
    }
}
