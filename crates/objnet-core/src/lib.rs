//! Core of the objnet object-storage client.
//!
//! The crate covers the stateful half of talking to an object node:
//!
//! * [`refs`] — container, object and owner identifiers and addresses.
//! * [`tz`] — homomorphic Tillich–Zémor digests whose concatenation is
//!   computable from the parts.
//! * [`session`] — the echo-then-sign handshake producing a session token
//!   scoped to object ids and an epoch window.
//! * [`transfer`] — chunked upload and download state machines.
//! * [`verify`] — salted range-hash checks against local data.
//!
//! [`client::Client`] ties them together over any [`ObjectService`]:
//! [`net::TcpClient`] for a remote node or [`memory::MemoryNode`] in process.

pub mod client;
pub mod config;
pub mod memory;
pub mod net;
pub mod object;
pub mod refs;
pub mod rpc;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod tz;
pub mod verify;

mod error;
mod serde_hex;

pub use client::{Client, GetOutcome, PutOutcome, Verification};
pub use config::ClientConfig;
pub use error::{ObjnetError, Result, Status, StatusCode};
pub use object::{Header, Object, Query, Range};
pub use refs::{Address, ContainerId, ObjectId, OwnerId};
pub use session::SessionToken;
pub use transport::ObjectService;
pub use tz::Digest;
