//! Chunked object transfer.
//!
//! Upload and download are typestate machines: the methods available on a
//! transfer depend on its state, so a chunk can't be sent before the header
//! and a download can't be copied before its first frame was classified.
//!
//! The download side treats the first frame as the complete object header.
//! Services split payloads across frames but never headers.

use std::mem;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::MAX_CHUNK_SIZE;
use crate::error::{ObjnetError, Result};
use crate::object::Object;
use crate::refs::Address;
use crate::rpc::{GetResponse, PutRequest, PutResponse};
use crate::session::SessionToken;
use crate::transport::{Duplex, ResponseStream};
use crate::tz::{Accumulator, Digest};

/// Payload bytes per upload frame.
pub const DEFAULT_CHUNK_SIZE: usize = 3 * 1024 * 1024;

pub type PutStream = Duplex<PutRequest, PutResponse>;
pub type GetStream = ResponseStream<GetResponse>;

pub struct Idle;

pub struct Streaming {
    address: Address,
    declared: u64,
    sent: u64,
    chunks: u64,
    hasher: Accumulator,
}

/// Client-streamed upload of one object.
///
/// Dropping an upload before [`Upload::finish`] aborts the stream and the
/// service commits nothing.
pub struct Upload<S> {
    stream: PutStream,
    chunk_size: usize,
    state: S,
}

/// Outcome of a committed upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    pub address: Address,
    /// Running digest over every payload byte sent.
    pub digest: Digest,
    pub chunks: u64,
    pub bytes: u64,
}

impl Upload<Idle> {
    pub fn new(stream: PutStream, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ObjnetError::format("chunk size", "must be greater than zero"));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ObjnetError::format("chunk size", "exceeds the frame limit"));
        }
        Ok(Self {
            stream,
            chunk_size,
            state: Idle,
        })
    }

    /// Send the header frame. The declared payload length is fixed from here on.
    pub async fn send_header(
        mut self,
        object: Object,
        token: Option<SessionToken>,
        ttl: u32,
    ) -> Result<Upload<Streaming>> {
        if !object.payload.is_empty() {
            return Err(ObjnetError::format(
                "upload header",
                "payload travels in chunk frames",
            ));
        }
        let address = object.address();
        let declared = object.system_header.payload_length;
        debug!(%address, declared, "sending object header");
        self.stream
            .send(PutRequest::Header { object, token, ttl })
            .await?;
        Ok(Upload {
            stream: self.stream,
            chunk_size: self.chunk_size,
            state: Streaming {
                address,
                declared,
                sent: 0,
                chunks: 0,
                hasher: Accumulator::new(),
            },
        })
    }
}

impl Upload<Streaming> {
    /// Payload bytes still owed to the service.
    pub fn remaining(&self) -> u64 {
        self.state.declared - self.state.sent
    }

    pub async fn send_chunk(&mut self, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() as u64 > self.remaining() {
            return Err(ObjnetError::integrity(format!(
                "chunk of {} bytes exceeds declared payload length {}",
                data.len(),
                self.state.declared
            )));
        }
        self.state.hasher.absorb(&data);
        self.state.sent += data.len() as u64;
        self.state.chunks += 1;
        self.stream.send(PutRequest::Chunk { data }).await
    }

    /// Stream the rest of the declared payload from `source`, one full chunk
    /// per frame. A source that ends early is an I/O error.
    pub async fn stream_from<R>(&mut self, source: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        while self.remaining() > 0 {
            let want = self.remaining().min(self.chunk_size as u64) as usize;
            let mut buf = vec![0u8; want];
            let got = read_full(source, &mut buf).await?;
            if got < want {
                warn!(
                    address = %self.state.address,
                    sent = self.state.sent + got as u64,
                    declared = self.state.declared,
                    "source ended early"
                );
                return Err(ObjnetError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "source shorter than declared payload length",
                )));
            }
            self.send_chunk(buf).await?;
        }
        Ok(())
    }

    /// Close the send side and wait for the committed address.
    pub async fn finish(mut self) -> Result<UploadReceipt> {
        if self.remaining() > 0 {
            return Err(ObjnetError::integrity(format!(
                "only {} of {} payload bytes sent",
                self.state.sent, self.state.declared
            )));
        }
        let PutResponse { address } = self.stream.close_and_recv().await?;
        if address != self.state.address {
            return Err(ObjnetError::integrity(format!(
                "service committed {address}, expected {}",
                self.state.address
            )));
        }
        let Streaming {
            sent,
            chunks,
            hasher,
            ..
        } = self.state;
        info!(%address, bytes = sent, chunks, "object stored");
        Ok(UploadReceipt {
            address,
            digest: hasher.finalize(),
            chunks,
            bytes: sent,
        })
    }
}

async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct AwaitingFirst;

pub struct Receiving {
    object: Object,
    inline: Vec<u8>,
}

/// Server-streamed download of one object.
pub struct Download<S> {
    stream: GetStream,
    state: S,
}

/// Classification of the first download frame.
pub enum DownloadStart {
    /// The address holds a tombstone whose signature verified.
    Removed(Object),
    Receiving(Download<Receiving>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadReport {
    /// Object header, payload stripped.
    pub object: Object,
    pub bytes: u64,
    pub chunks: u64,
    pub digest: Digest,
}

impl Download<AwaitingFirst> {
    pub fn new(stream: GetStream) -> Self {
        Self {
            stream,
            state: AwaitingFirst,
        }
    }

    pub async fn receive_header(mut self) -> Result<DownloadStart> {
        let mut object = match self.stream.recv().await? {
            Some(GetResponse::Object { object }) => object,
            Some(GetResponse::Chunk { .. }) => {
                return Err(ObjnetError::integrity("payload chunk before object header"))
            }
            None => return Err(ObjnetError::integrity("stream ended before object header")),
        };

        if object.is_tombstone() {
            object.verify()?;
            info!(address = %object.address(), "object removed");
            return Ok(DownloadStart::Removed(object));
        }

        let inline = mem::take(&mut object.payload);
        if inline.len() as u64 > object.system_header.payload_length {
            return Err(ObjnetError::integrity(
                "inline payload exceeds declared payload length",
            ));
        }
        debug!(
            address = %object.address(),
            length = object.system_header.payload_length,
            "receiving object"
        );
        Ok(DownloadStart::Receiving(Download {
            stream: self.stream,
            state: Receiving { object, inline },
        }))
    }
}

impl Download<Receiving> {
    pub fn object(&self) -> &Object {
        &self.state.object
    }

    /// Append the payload to `sink` in arrival order. On error the sink
    /// keeps whatever was already written.
    pub async fn copy_to<W>(mut self, sink: &mut W) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let declared = self.state.object.system_header.payload_length;
        let mut hasher = Accumulator::new();
        let mut chunks = 0u64;

        let inline = mem::take(&mut self.state.inline);
        if !inline.is_empty() {
            sink.write_all(&inline).await?;
            hasher.absorb(&inline);
        }

        while let Some(frame) = self.stream.recv().await? {
            let data = match frame {
                GetResponse::Chunk { data } => data,
                GetResponse::Object { .. } => {
                    return Err(ObjnetError::integrity("object header after first frame"))
                }
            };
            if hasher.absorbed() + data.len() as u64 > declared {
                return Err(ObjnetError::integrity(format!(
                    "received more than declared payload length {declared}"
                )));
            }
            sink.write_all(&data).await?;
            hasher.absorb(&data);
            chunks += 1;
        }
        sink.flush().await?;

        let bytes = hasher.absorbed();
        if bytes != declared {
            return Err(ObjnetError::integrity(format!(
                "stream ended after {bytes} of {declared} payload bytes"
            )));
        }
        Ok(DownloadReport {
            object: self.state.object,
            bytes,
            chunks,
            digest: hasher.finalize(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CreationPoint, Header, SystemHeader};
    use crate::refs::{ContainerId, ObjectId, OwnerId};
    use crate::session::{SessionScope, SessionToken};
    use crate::transport::{duplex, response_channel, Incoming, ServerEnd};
    use crate::tz;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::io::Cursor;
    use tokio::task::JoinHandle;

    fn object(length: u64) -> Object {
        Object::new(
            SystemHeader {
                id: ObjectId::new(),
                owner_id: OwnerId::from_public_key(
                    &SigningKey::generate(&mut OsRng).verifying_key(),
                ),
                container_id: ContainerId::from_bytes([9u8; 32]),
                payload_length: length,
                version: 1,
                created_at: CreationPoint::default(),
            },
            vec![Header::user("name", "blob")],
        )
    }

    /// Records every frame and acks with the header's address on a clean end.
    fn recording_service(
        mut server: ServerEnd<PutRequest, PutResponse>,
    ) -> JoinHandle<(Vec<PutRequest>, bool)> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            loop {
                match server.recv().await {
                    Incoming::Message(frame) => frames.push(frame),
                    Incoming::End => break,
                    Incoming::Aborted => return (frames, false),
                }
            }
            if let Some(PutRequest::Header { object, .. }) = frames.first() {
                let address = object.address();
                server.send(PutResponse { address }).await;
            }
            (frames, true)
        })
    }

    fn chunk_sizes(frames: &[PutRequest]) -> Vec<usize> {
        frames
            .iter()
            .filter_map(|f| match f {
                PutRequest::Chunk { data } => Some(data.len()),
                _ => None,
            })
            .collect()
    }

    async fn upload(payload: Vec<u8>, chunk_size: usize) -> (UploadReceipt, Vec<PutRequest>) {
        let (client, server) = duplex(4);
        let service = recording_service(server);
        let obj = object(payload.len() as u64);
        let mut upload = Upload::new(client, chunk_size)
            .unwrap()
            .send_header(obj, None, 2)
            .await
            .unwrap();
        upload.stream_from(&mut Cursor::new(payload)).await.unwrap();
        let receipt = upload.finish().await.unwrap();
        let (frames, ended) = service.await.unwrap();
        assert!(ended);
        (receipt, frames)
    }

    #[tokio::test]
    async fn seven_units_in_threes_is_header_plus_three_chunks() {
        let payload: Vec<u8> = (0..7u8).collect();
        let (receipt, frames) = upload(payload.clone(), 3).await;
        assert!(matches!(frames[0], PutRequest::Header { .. }));
        assert_eq!(chunk_sizes(&frames), vec![3, 3, 1]);
        assert_eq!(receipt.chunks, 3);
        assert_eq!(receipt.bytes, 7);
        assert_eq!(receipt.digest, tz::digest(&payload));
    }

    #[tokio::test]
    async fn exact_multiple_sends_exactly_n_chunks() {
        let (receipt, frames) = upload(vec![0xab; 4096 * 3], 4096).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(chunk_sizes(&frames), vec![4096; 3]);
        assert_eq!(receipt.chunks, 3);
    }

    #[tokio::test]
    async fn empty_payload_sends_only_the_header() {
        let (receipt, frames) = upload(Vec::new(), 16).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(receipt.chunks, 0);
        assert_eq!(receipt.digest, tz::digest(&[]));
    }

    #[tokio::test]
    async fn short_source_never_commits() {
        let (client, server) = duplex(4);
        let service = recording_service(server);
        let mut upload = Upload::new(client, 4)
            .unwrap()
            .send_header(object(10), None, 2)
            .await
            .unwrap();
        let err = upload
            .stream_from(&mut Cursor::new(vec![1u8; 6]))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::Io(_)));
        drop(upload);
        let (_, ended) = service.await.unwrap();
        assert!(!ended);
    }

    #[test]
    fn chunk_size_must_fit_a_frame() {
        let (client, _server) = duplex::<PutRequest, PutResponse>(4);
        assert!(matches!(
            Upload::new(client, MAX_CHUNK_SIZE + 1),
            Err(ObjnetError::Format { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_locally() {
        let (client, server) = duplex(4);
        let _service = recording_service(server);
        let mut upload = Upload::new(client, 8)
            .unwrap()
            .send_header(object(4), None, 2)
            .await
            .unwrap();
        let err = upload.send_chunk(vec![0; 5]).await.unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
        assert_eq!(upload.remaining(), 4);
    }

    #[tokio::test]
    async fn finish_before_full_payload_fails() {
        let (client, server) = duplex(4);
        let _service = recording_service(server);
        let mut upload = Upload::new(client, 8)
            .unwrap()
            .send_header(object(4), None, 2)
            .await
            .unwrap();
        upload.send_chunk(vec![0; 2]).await.unwrap();
        assert!(upload.finish().await.is_err());
    }

    fn tombstone(tamper: bool) -> Object {
        let owner = SigningKey::generate(&mut OsRng);
        let session = SigningKey::generate(&mut OsRng);
        let mut obj = object(0);
        obj.system_header.owner_id = OwnerId::from_public_key(&owner.verifying_key());
        let mut token = SessionToken::proposal(
            &owner,
            &SessionScope::unbounded(vec![obj.system_header.id]),
        );
        token.header.public_key = Some(session.verifying_key().to_bytes());
        token.sign(&owner);
        obj.headers = vec![Header::Tombstone, Header::Session { token }];
        obj.seal(&session).unwrap();
        if tamper {
            obj.system_header.version += 1;
        }
        obj
    }

    async fn serve(frames: Vec<GetResponse>) -> GetStream {
        let (tx, rx) = response_channel(frames.len() + 1);
        for frame in frames {
            tx.send(frame).await;
        }
        rx
    }

    #[tokio::test]
    async fn tombstone_reports_removed() {
        let stream = serve(vec![GetResponse::Object {
            object: tombstone(false),
        }])
        .await;
        match Download::new(stream).receive_header().await.unwrap() {
            DownloadStart::Removed(obj) => assert!(obj.is_tombstone()),
            DownloadStart::Receiving(_) => panic!("tombstone treated as payload"),
        }
    }

    #[tokio::test]
    async fn corrupted_tombstone_is_an_error() {
        let stream = serve(vec![GetResponse::Object {
            object: tombstone(true),
        }])
        .await;
        let err = Download::new(stream).receive_header().await.err().unwrap();
        assert!(matches!(err, ObjnetError::Corrupted(_)));
    }

    #[tokio::test]
    async fn chunk_before_header_is_rejected() {
        let stream = serve(vec![GetResponse::Chunk { data: vec![1] }]).await;
        let err = Download::new(stream).receive_header().await.err().unwrap();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
        let stream = serve(Vec::new()).await;
        assert!(Download::new(stream).receive_header().await.is_err());
    }

    async fn download(frames: Vec<GetResponse>) -> (Result<DownloadReport>, Vec<u8>) {
        let stream = serve(frames).await;
        let mut sink = Vec::new();
        let report = match Download::new(stream).receive_header().await.unwrap() {
            DownloadStart::Receiving(dl) => dl.copy_to(&mut sink).await,
            DownloadStart::Removed(_) => panic!("unexpected tombstone"),
        };
        (report, sink)
    }

    #[tokio::test]
    async fn inline_payload_then_chunks_in_arrival_order() {
        let mut obj = object(6);
        obj.payload = b"ab".to_vec();
        let (report, sink) = download(vec![
            GetResponse::Object { object: obj },
            GetResponse::Chunk { data: b"cd".to_vec() },
            GetResponse::Chunk { data: b"ef".to_vec() },
        ])
        .await;
        let report = report.unwrap();
        assert_eq!(sink, b"abcdef");
        assert_eq!(report.bytes, 6);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.digest, tz::digest(b"abcdef"));
        assert!(report.object.payload.is_empty());
    }

    #[tokio::test]
    async fn excess_or_missing_bytes_are_integrity_errors() {
        let (report, _) = download(vec![
            GetResponse::Object { object: object(2) },
            GetResponse::Chunk { data: b"abc".to_vec() },
        ])
        .await;
        assert!(matches!(report, Err(ObjnetError::ProtocolIntegrity(_))));

        let (report, sink) = download(vec![
            GetResponse::Object { object: object(4) },
            GetResponse::Chunk { data: b"ab".to_vec() },
        ])
        .await;
        assert!(matches!(report, Err(ObjnetError::ProtocolIntegrity(_))));
        assert_eq!(sink, b"ab");
    }

    #[tokio::test]
    async fn second_header_is_rejected() {
        let (report, _) = download(vec![
            GetResponse::Object { object: object(2) },
            GetResponse::Object { object: object(2) },
        ])
        .await;
        assert!(matches!(report, Err(ObjnetError::ProtocolIntegrity(_))));
    }
}
