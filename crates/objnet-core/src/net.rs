//! TCP transport.
//!
//! Every operation gets its own connection. Frames are a big-endian `u32`
//! length followed by a JSON body. The first client frame names the
//! operation ([`Rpc`]); what follows depends on its shape:
//!
//! - unary: one request frame, one [`ServerFrame`];
//! - server-streamed: one request frame, then server frames until EOF;
//! - client-streamed and bidirectional: [`ClientFrame`]s ending in
//!   `End`, server frames until EOF.
//!
//! A client connection that closes without `End` is an aborted stream.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{ObjnetError, Result, Status, StatusCode};
use crate::rpc::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRangeHashRequest,
    GetRangeHashResponse, GetRangeRequest, GetRangeResponse, GetRequest, GetResponse, HeadRequest,
    HeadResponse, PutRequest, PutResponse, Rpc, SearchRequest, SearchResponse,
};
use crate::transport::{
    duplex, response_channel, Duplex, ObjectService, Outbound, ResponseSender, ResponseStream,
    DEFAULT_STREAM_CAPACITY,
};

/// Largest accepted frame body. Chunks travel hex-encoded, so this bounds
/// the usable chunk size at a bit under half of it.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ClientFrame<T> {
    Message(T),
    End,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerFrame<T> {
    Message(T),
    Status(Status),
}

impl<T> From<Result<T>> for ServerFrame<T> {
    fn from(item: Result<T>) -> Self {
        match item {
            Ok(msg) => ServerFrame::Message(msg),
            Err(ObjnetError::Remote(status)) => ServerFrame::Status(status),
            Err(err) => ServerFrame::Status(Status::new(StatusCode::Internal, err.to_string())),
        }
    }
}

fn connection(err: std::io::Error) -> ObjnetError {
    ObjnetError::Connection(err.to_string())
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| ObjnetError::integrity(format!("can't encode frame: {e}")))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ObjnetError::integrity(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(connection)?;
    writer.write_all(&body).await.map_err(connection)?;
    writer.flush().await.map_err(connection)
}

/// Next frame, or `None` on EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(connection(e)),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ObjnetError::integrity(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(connection)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| ObjnetError::integrity(format!("can't decode frame: {e}")))
}

/// [`ObjectService`] reached over TCP.
#[derive(Clone, Debug)]
pub struct TcpClient {
    host: String,
}

impl TcpClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self, rpc: Rpc) -> Result<TcpStream> {
        let mut socket = TcpStream::connect(&self.host)
            .await
            .map_err(|e| ObjnetError::Connection(format!("can't connect to {}: {e}", self.host)))?;
        socket.set_nodelay(true).map_err(connection)?;
        write_frame(&mut socket, &rpc).await?;
        debug!(host = %self.host, ?rpc, "stream opened");
        Ok(socket)
    }

    async fn call<Req, Resp>(&self, rpc: Rpc, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut socket = self.connect(rpc).await?;
        write_frame(&mut socket, request).await?;
        match read_frame::<_, ServerFrame<Resp>>(&mut socket).await? {
            Some(ServerFrame::Message(msg)) => Ok(msg),
            Some(ServerFrame::Status(status)) => Err(status.into()),
            None => Err(ObjnetError::Connection(
                "connection closed before response".into(),
            )),
        }
    }

    async fn open_duplex<Req, Resp>(&self, rpc: Rpc) -> Result<Duplex<Req, Resp>>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (reader, mut writer) = self.connect(rpc).await?.into_split();
        let (client, server) = duplex(DEFAULT_STREAM_CAPACITY);
        let (mut requests, responses) = server.split();
        let failures = responses.clone();
        tokio::spawn(async move {
            while let Some(item) = requests.recv().await {
                let (frame, last) = match item {
                    Outbound::Message(msg) => (ClientFrame::Message(msg), false),
                    Outbound::End => (ClientFrame::End, true),
                };
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    warn!(%err, "request frame not sent");
                    failures.send_raw(Err(err)).await;
                    return;
                }
                if last {
                    break;
                }
            }
            // Without a preceding End this is seen as an abort.
            let _ = writer.shutdown().await;
        });
        tokio::spawn(forward_responses(reader, responses));
        Ok(client)
    }
}

async fn forward_responses<Resp>(mut reader: OwnedReadHalf, tx: ResponseSender<Resp>)
where
    Resp: DeserializeOwned,
{
    loop {
        match read_frame::<_, ServerFrame<Resp>>(&mut reader).await {
            Ok(Some(ServerFrame::Message(msg))) => {
                if !tx.send(msg).await {
                    return;
                }
            }
            Ok(Some(ServerFrame::Status(status))) => {
                tx.reject(status).await;
                return;
            }
            Ok(None) => return,
            Err(err) => {
                tx.send_raw(Err(err)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl ObjectService for TcpClient {
    async fn put(&self) -> Result<Duplex<PutRequest, PutResponse>> {
        self.open_duplex(Rpc::Put).await
    }

    async fn get(&self, request: GetRequest) -> Result<ResponseStream<GetResponse>> {
        let mut socket = self.connect(Rpc::Get).await?;
        write_frame(&mut socket, &request).await?;
        let (reader, _writer) = socket.into_split();
        let (tx, rx) = response_channel(DEFAULT_STREAM_CAPACITY);
        tokio::spawn(forward_responses(reader, tx));
        Ok(rx)
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        self.call(Rpc::Delete, &request).await
    }

    async fn head(&self, request: HeadRequest) -> Result<HeadResponse> {
        self.call(Rpc::Head, &request).await
    }

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.call(Rpc::Search, &request).await
    }

    async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse> {
        self.call(Rpc::GetRange, &request).await
    }

    async fn get_range_hash(&self, request: GetRangeHashRequest) -> Result<GetRangeHashResponse> {
        self.call(Rpc::GetRangeHash, &request).await
    }

    async fn create_session(&self) -> Result<Duplex<CreateRequest, CreateResponse>> {
        self.open_duplex(Rpc::CreateSession).await
    }
}

/// Accept connections forever, serving each on its own task.
pub async fn serve<S>(listener: TcpListener, service: Arc<S>) -> Result<()>
where
    S: ObjectService + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    loop {
        let (socket, peer) = listener.accept().await.map_err(connection)?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, service).await {
                warn!(%peer, error = %err, "connection failed");
            }
        });
    }
}

async fn handle_connection<S>(socket: TcpStream, service: Arc<S>) -> Result<()>
where
    S: ObjectService + ?Sized,
{
    socket.set_nodelay(true).map_err(connection)?;
    let (mut reader, mut writer) = socket.into_split();
    let Some(rpc) = read_frame::<_, Rpc>(&mut reader).await? else {
        return Ok(());
    };
    debug!(?rpc, "serving");
    match rpc {
        Rpc::Put => match service.put().await {
            Ok(local) => bridge_duplex(reader, writer, local).await,
            Err(err) => reply::<PutResponse>(&mut writer, Err(err)).await,
        },
        Rpc::CreateSession => match service.create_session().await {
            Ok(local) => bridge_duplex(reader, writer, local).await,
            Err(err) => reply::<CreateResponse>(&mut writer, Err(err)).await,
        },
        Rpc::Get => {
            let request: GetRequest = expect_request(&mut reader).await?;
            match service.get(request).await {
                Ok(stream) => pump_responses(&mut writer, stream).await,
                Err(err) => reply::<GetResponse>(&mut writer, Err(err)).await,
            }
        }
        Rpc::Delete => {
            let request = expect_request(&mut reader).await?;
            reply(&mut writer, service.delete(request).await).await
        }
        Rpc::Head => {
            let request = expect_request(&mut reader).await?;
            reply(&mut writer, service.head(request).await).await
        }
        Rpc::Search => {
            let request = expect_request(&mut reader).await?;
            reply(&mut writer, service.search(request).await).await
        }
        Rpc::GetRange => {
            let request = expect_request(&mut reader).await?;
            reply(&mut writer, service.get_range(request).await).await
        }
        Rpc::GetRangeHash => {
            let request = expect_request(&mut reader).await?;
            reply(&mut writer, service.get_range_hash(request).await).await
        }
    }
}

async fn expect_request<T: DeserializeOwned>(reader: &mut OwnedReadHalf) -> Result<T> {
    read_frame(reader)
        .await?
        .ok_or_else(|| ObjnetError::integrity("connection closed before request"))
}

async fn reply<T: Serialize>(writer: &mut OwnedWriteHalf, result: Result<T>) -> Result<()> {
    write_frame(writer, &ServerFrame::from(result)).await?;
    writer.shutdown().await.map_err(connection)
}

async fn pump_responses<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    mut responses: ResponseStream<T>,
) -> Result<()> {
    while let Some(item) = responses.recv_raw().await {
        let failed = item.is_err();
        write_frame(writer, &ServerFrame::from(item)).await?;
        if failed {
            break;
        }
    }
    writer.shutdown().await.map_err(connection)
}

/// Feed client frames from the socket into the local stream and its
/// responses back out. EOF before `End` drops the local sender, which the
/// service sees as an abort.
async fn bridge_duplex<Req, Resp>(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    local: Duplex<Req, Resp>,
) -> Result<()>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize,
{
    let (tx, responses) = local.into_parts();
    let inbound = tokio::spawn(async move {
        let Some(tx) = tx else { return };
        loop {
            match read_frame::<_, ClientFrame<Req>>(&mut reader).await {
                Ok(Some(ClientFrame::Message(msg))) => {
                    if tx.send(Outbound::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(ClientFrame::End)) => {
                    let _ = tx.send(Outbound::End).await;
                    return;
                }
                Ok(None) | Err(_) => return,
            }
        }
    });
    let result = pump_responses(&mut writer, responses).await;
    inbound.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNode;
    use crate::refs::{Address, ContainerId, ObjectId};
    use std::io::Cursor;

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ClientFrame::Message(Rpc::GetRangeHash))
            .await
            .unwrap();
        write_frame(&mut buf, &ClientFrame::<Rpc>::End).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let first: Option<ClientFrame<Rpc>> = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(first, Some(ClientFrame::Message(Rpc::GetRangeHash))));
        let second: Option<ClientFrame<Rpc>> = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(second, Some(ClientFrame::End)));
        let eof: Option<ClientFrame<Rpc>> = read_frame(&mut cursor).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut cursor = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame::<_, Rpc>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[tokio::test]
    async fn remote_status_crosses_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(MemoryNode::default())));

        let client = TcpClient::new(addr.to_string());
        let missing = Address::new(ContainerId::from_bytes([0u8; 32]), ObjectId::new());
        let err = client
            .head(HeadRequest {
                address: missing,
                full_headers: false,
                ttl: 2,
            })
            .await
            .unwrap_err();
        match err {
            ObjnetError::Remote(status) => assert_eq!(status.code, StatusCode::NotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpClient::new(addr.to_string())
            .search(SearchRequest {
                container_id: ContainerId::from_bytes([0u8; 32]),
                query: Default::default(),
                ttl: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::Connection(_)));
    }

    #[tokio::test]
    async fn unsendable_frame_surfaces_as_stream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(MemoryNode::default())));

        let mut stream = TcpClient::new(addr.to_string()).put().await.unwrap();
        stream
            .send(PutRequest::Chunk {
                data: vec![0u8; MAX_FRAME_SIZE / 2 + 1],
            })
            .await
            .unwrap();
        let err = stream.close_and_recv().await.unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)), "{err}");
    }
}
