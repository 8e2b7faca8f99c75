use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ObjnetError, Result};
use crate::net::MAX_FRAME_SIZE;
use crate::rpc::DEFAULT_TTL;
use crate::transfer::DEFAULT_CHUNK_SIZE;

/// Largest chunk whose hex-encoded frame still fits under [`MAX_FRAME_SIZE`],
/// leaving room for the frame envelope.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE / 2 - 64 * 1024;

/// Client tunables. Populated from command-line flags by the binaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Payload bytes per upload frame.
    pub chunk_size: usize,
    pub ttl: u32,
    /// Deadline for a whole operation, handshake included.
    pub timeout: Option<Duration>,
    /// Cross-check every upload with a full-range hash request.
    pub verify_after_put: bool,
    pub first_epoch: u64,
    pub last_epoch: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ttl: DEFAULT_TTL,
            timeout: None,
            verify_after_put: false,
            first_epoch: 0,
            last_epoch: u64::MAX,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ObjnetError::format("chunk size", "must be greater than zero"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ObjnetError::format(
                "chunk size",
                format!("{} exceeds the {MAX_CHUNK_SIZE} byte limit", self.chunk_size),
            ));
        }
        if self.first_epoch > self.last_epoch {
            return Err(ObjnetError::format(
                "epoch window",
                format!("first epoch {} after last epoch {}", self.first_epoch, self.last_epoch),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.chunk_size, 3 * 1024 * 1024);
        assert_eq!(cfg.ttl, 2);
        assert_eq!((cfg.first_epoch, cfg.last_epoch), (0, u64::MAX));
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_values() {
        let cfg = ClientConfig {
            chunk_size: 0,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ClientConfig {
            chunk_size: 40 * 1024 * 1024,
            ..ClientConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ObjnetError::Format { .. })));
        let cfg = ClientConfig {
            chunk_size: MAX_CHUNK_SIZE,
            ..ClientConfig::default()
        };
        cfg.validate().unwrap();
        let cfg = ClientConfig {
            first_epoch: 5,
            last_epoch: 4,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ClientConfig = serde_json::from_str(r#"{"ttl": 7}"#).unwrap();
        assert_eq!(cfg.ttl, 7);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
