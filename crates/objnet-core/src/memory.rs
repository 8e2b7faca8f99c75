//! In-process object node.
//!
//! Implements [`ObjectService`] with the service side of every protocol:
//! session creation, authorised upload that commits only on a clean end of
//! stream, framed download, tombstoning delete and salted range hashes.
//! Backs the test suites and `objnet-node`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, Status, StatusCode};
use crate::object::{Header, Object, Range};
use crate::refs::{Address, ObjectId, OwnerId};
use crate::rpc::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRangeHashRequest,
    GetRangeHashResponse, GetRangeRequest, GetRangeResponse, GetRequest, GetResponse, HeadRequest,
    HeadResponse, PutRequest, PutResponse, SearchRequest, SearchResponse,
};
use crate::session::{SessionToken, TokenHeader};
use crate::transport::{
    duplex, response_channel, Duplex, Incoming, ObjectService, ResponseSender, ResponseStream,
    ServerEnd, DEFAULT_STREAM_CAPACITY,
};
use crate::tz;

/// Payload bytes per download frame.
pub const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct MemoryNode {
    inner: Arc<Inner>,
}

struct Inner {
    epoch: AtomicU64,
    frame_size: usize,
    objects: RwLock<HashMap<Address, Object>>,
    /// Negotiated session keys by public key.
    sessions: RwLock<HashMap<[u8; 32], SigningKey>>,
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryNode {
    pub fn new(epoch: u64) -> Self {
        Self::with_frame_size(epoch, DEFAULT_FRAME_SIZE)
    }

    pub fn with_frame_size(epoch: u64, frame_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                epoch: AtomicU64::new(epoch),
                frame_size: frame_size.max(1),
                objects: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Relaxed)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.inner.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Stored object, tombstones included.
    pub async fn stored(&self, address: &Address) -> Option<Object> {
        self.inner.objects.read().await.get(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Flip one stored payload byte. Returns false when there is no such byte.
    pub async fn tamper_payload(&self, address: &Address, offset: usize) -> bool {
        let mut objects = self.inner.objects.write().await;
        match objects
            .get_mut(address)
            .and_then(|obj| obj.payload.get_mut(offset))
        {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    /// Service side of the session handshake.
    pub async fn serve_create_session(&self, mut stream: ServerEnd<CreateRequest, CreateResponse>) {
        let mut token = match stream.recv().await {
            Incoming::Message(CreateRequest::Init { token }) => token,
            Incoming::Message(CreateRequest::Signed { .. }) => {
                stream
                    .reject(Status::invalid_argument("expected session proposal"))
                    .await;
                return;
            }
            Incoming::End | Incoming::Aborted => return,
        };
        if token.first_epoch > token.last_epoch {
            stream
                .reject(Status::invalid_argument("empty epoch window"))
                .await;
            return;
        }

        let session_key = SigningKey::generate(&mut OsRng);
        let public_key = session_key.verifying_key().to_bytes();
        token.header = TokenHeader {
            public_key: Some(public_key),
            key_signature: None,
        };
        token.signature = None;
        let echo = token.clone();
        if !stream.send(CreateResponse::Unsigned { token }).await {
            return;
        }

        let mut signed = match stream.recv().await {
            Incoming::Message(CreateRequest::Signed { token }) => token,
            Incoming::Message(CreateRequest::Init { .. }) => {
                stream
                    .reject(Status::invalid_argument("expected signed token"))
                    .await;
                return;
            }
            Incoming::End | Incoming::Aborted => return,
        };
        let mut unsigned = signed.clone();
        unsigned.signature = None;
        if unsigned != echo {
            stream
                .reject(Status::invalid_argument("signed token differs from echo"))
                .await;
            return;
        }
        if let Err(err) = signed.verify_owner() {
            stream
                .reject(Status::permission_denied(err.to_string()))
                .await;
            return;
        }
        if let Err(err) = signed.accept(&session_key) {
            stream
                .reject(Status::new(StatusCode::Internal, err.to_string()))
                .await;
            return;
        }

        self.inner
            .sessions
            .write()
            .await
            .insert(public_key, session_key);
        debug!(owner = %signed.owner_id, objects = signed.object_ids.len(), "session created");
        stream.send(CreateResponse::Result { token: signed }).await;
    }

    /// Session key behind `token` if it authorises `owner` to touch `id` now.
    async fn authorize(
        &self,
        token: &SessionToken,
        owner: &OwnerId,
        id: ObjectId,
    ) -> std::result::Result<SigningKey, Status> {
        let public_key = token
            .header
            .public_key
            .ok_or_else(|| Status::permission_denied("token without session key"))?;
        let session_key = self
            .inner
            .sessions
            .read()
            .await
            .get(&public_key)
            .cloned()
            .ok_or_else(|| Status::permission_denied("unknown session"))?;
        token
            .verify_owner()
            .and_then(|_| token.verify_acceptance())
            .map_err(|e| Status::permission_denied(e.to_string()))?;
        if token.owner_id != *owner {
            return Err(Status::permission_denied("token owner differs from object owner"));
        }
        if !token.authorizes(&[id], self.epoch()) {
            return Err(Status::permission_denied(
                "token does not cover object at current epoch",
            ));
        }
        Ok(session_key)
    }

    /// Service side of an upload. Nothing is stored unless the client
    /// closes the stream after sending the full declared payload.
    pub async fn serve_put(&self, mut stream: ServerEnd<PutRequest, PutResponse>) {
        let (mut object, token) = match stream.recv().await {
            Incoming::Message(PutRequest::Header { object, token, .. }) => (object, token),
            Incoming::Message(PutRequest::Chunk { .. }) => {
                stream
                    .reject(Status::invalid_argument("chunk before object header"))
                    .await;
                return;
            }
            Incoming::End | Incoming::Aborted => return,
        };
        let address = object.address();

        let Some(token) = token else {
            stream
                .reject(Status::permission_denied("put requires a session token"))
                .await;
            return;
        };
        let session_key = match self
            .authorize(&token, &object.system_header.owner_id, object.system_header.id)
            .await
        {
            Ok(key) => key,
            Err(status) => {
                warn!(%address, %status, "upload rejected");
                stream.reject(status).await;
                return;
            }
        };
        if !object.payload.is_empty() {
            stream
                .reject(Status::invalid_argument("payload in header frame"))
                .await;
            return;
        }

        let declared = object.system_header.payload_length;
        let mut payload = Vec::new();
        loop {
            match stream.recv().await {
                Incoming::Message(PutRequest::Chunk { data }) => {
                    if (payload.len() + data.len()) as u64 > declared {
                        stream
                            .reject(Status::new(
                                StatusCode::OutOfRange,
                                "payload exceeds declared length",
                            ))
                            .await;
                        return;
                    }
                    payload.extend_from_slice(&data);
                }
                Incoming::Message(PutRequest::Header { .. }) => {
                    stream
                        .reject(Status::invalid_argument("second object header"))
                        .await;
                    return;
                }
                Incoming::Aborted => {
                    debug!(%address, received = payload.len(), "upload aborted");
                    return;
                }
                Incoming::End => break,
            }
        }
        if payload.len() as u64 != declared {
            stream
                .reject(Status::invalid_argument(format!(
                    "received {} of {declared} payload bytes",
                    payload.len()
                )))
                .await;
            return;
        }

        object.payload = payload;
        object.headers.push(Header::Session { token });
        if let Err(err) = object.seal(&session_key) {
            stream
                .reject(Status::new(StatusCode::Internal, err.to_string()))
                .await;
            return;
        }

        {
            let mut objects = self.inner.objects.write().await;
            if objects.contains_key(&address) {
                drop(objects);
                stream
                    .reject(Status::new(
                        StatusCode::FailedPrecondition,
                        "object already exists",
                    ))
                    .await;
                return;
            }
            objects.insert(address, object);
        }
        info!(%address, bytes = declared, "object committed");
        stream.send(PutResponse { address }).await;
    }

    /// Service side of a download: header frame with a leading payload
    /// slice, then the rest in frames. Tombstones go out as a single frame.
    pub async fn serve_get(&self, request: GetRequest, tx: ResponseSender<GetResponse>) {
        let Some(object) = self.stored(&request.address).await else {
            tx.reject(Status::not_found(format!("object {} not found", request.address)))
                .await;
            return;
        };
        if object.is_tombstone() {
            tx.send(GetResponse::Object { object }).await;
            return;
        }

        let Object {
            system_header,
            headers,
            payload,
        } = object;
        let frame = self.inner.frame_size;
        let split = payload.len().min(frame);
        let mut head = Object::new(system_header, headers);
        head.payload = payload[..split].to_vec();
        if !tx.send(GetResponse::Object { object: head }).await {
            return;
        }
        for chunk in payload[split..].chunks(frame) {
            if !tx.send(GetResponse::Chunk { data: chunk.to_vec() }).await {
                debug!(address = %request.address, "download abandoned");
                return;
            }
        }
    }

    async fn live_object(&self, address: &Address) -> std::result::Result<Object, Status> {
        match self.stored(address).await {
            Some(obj) if obj.is_tombstone() => {
                Err(Status::not_found(format!("object {address} removed")))
            }
            Some(obj) => Ok(obj),
            None => Err(Status::not_found(format!("object {address} not found"))),
        }
    }
}

fn slice<'a>(payload: &'a [u8], range: &Range) -> std::result::Result<&'a [u8], Status> {
    let end = range
        .end()
        .filter(|end| *end <= payload.len() as u64)
        .ok_or_else(|| {
            Status::new(
                StatusCode::OutOfRange,
                format!("range {range} outside payload of {} bytes", payload.len()),
            )
        })?;
    Ok(&payload[range.offset as usize..end as usize])
}

#[async_trait]
impl ObjectService for MemoryNode {
    async fn put(&self) -> Result<Duplex<PutRequest, PutResponse>> {
        let (client, server) = duplex(DEFAULT_STREAM_CAPACITY);
        let node = self.clone();
        tokio::spawn(async move { node.serve_put(server).await });
        Ok(client)
    }

    async fn get(&self, request: GetRequest) -> Result<ResponseStream<GetResponse>> {
        let (tx, rx) = response_channel(DEFAULT_STREAM_CAPACITY);
        let node = self.clone();
        tokio::spawn(async move { node.serve_get(request, tx).await });
        Ok(rx)
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        let object = self.live_object(&request.address).await?;
        if request.owner_id != object.system_header.owner_id {
            return Err(Status::permission_denied("not the object owner").into());
        }
        let session_key = self
            .authorize(&request.token, &request.owner_id, object.system_header.id)
            .await?;

        let mut system_header = object.system_header;
        system_header.payload_length = 0;
        let mut tombstone = Object::new(
            system_header,
            vec![
                Header::Tombstone,
                Header::Session {
                    token: request.token,
                },
            ],
        );
        tombstone.seal(&session_key)?;
        self.inner
            .objects
            .write()
            .await
            .insert(request.address, tombstone);
        info!(address = %request.address, "object removed");
        Ok(DeleteResponse {})
    }

    async fn head(&self, request: HeadRequest) -> Result<HeadResponse> {
        let mut object = self
            .stored(&request.address)
            .await
            .ok_or_else(|| Status::not_found(format!("object {} not found", request.address)))?;
        object.payload.clear();
        if !request.full_headers {
            object.headers.retain(|h| !matches!(h, Header::User { .. }));
        }
        Ok(HeadResponse { object })
    }

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let objects = self.inner.objects.read().await;
        let mut addresses = Vec::new();
        for (address, object) in objects.iter() {
            if address.container_id() != request.container_id || object.is_tombstone() {
                continue;
            }
            let hit = request
                .query
                .matches(object)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            if hit {
                addresses.push(*address);
            }
        }
        addresses.sort();
        Ok(SearchResponse { addresses })
    }

    async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse> {
        let object = self.live_object(&request.address).await?;
        let fragments = request
            .ranges
            .iter()
            .map(|r| slice(&object.payload, r).map(<[u8]>::to_vec))
            .collect::<std::result::Result<Vec<_>, Status>>()?;
        Ok(GetRangeResponse { fragments })
    }

    async fn get_range_hash(&self, request: GetRangeHashRequest) -> Result<GetRangeHashResponse> {
        let object = self.live_object(&request.address).await?;
        let hashes = request
            .ranges
            .iter()
            .map(|r| slice(&object.payload, r).map(|bytes| tz::salted_digest(bytes, &request.salt)))
            .collect::<std::result::Result<Vec<_>, Status>>()?;
        Ok(GetRangeHashResponse { hashes })
    }

    async fn create_session(&self) -> Result<Duplex<CreateRequest, CreateResponse>> {
        let (client, server) = duplex(DEFAULT_STREAM_CAPACITY);
        let node = self.clone();
        tokio::spawn(async move { node.serve_create_session(server).await });
        Ok(client)
    }
}
