//! Ordered message streams and the remote object service seam.
//!
//! A stream is a pair of bounded channels. The request side carries an
//! explicit end-of-stream marker, so a sender that is dropped without
//! calling [`Duplex::close_send`] is seen by the service as an abort, never
//! as a completed upload.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ObjnetError, Result, Status};
use crate::rpc::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRangeHashRequest,
    GetRangeHashResponse, GetRangeRequest, GetRangeResponse, GetRequest, GetResponse, HeadRequest,
    HeadResponse, PutRequest, PutResponse, SearchRequest, SearchResponse,
};

/// Default number of in-flight frames per direction.
pub const DEFAULT_STREAM_CAPACITY: usize = 4;

pub(crate) enum Outbound<T> {
    Message(T),
    End,
}

/// What the service sees on the request side of a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming<T> {
    Message(T),
    /// The client closed its send side normally.
    End,
    /// The client went away without closing.
    Aborted,
}

/// Receiving half of a server-streamed response.
pub struct ResponseStream<T> {
    rx: mpsc::Receiver<Result<T>>,
}

/// Sending half of a response stream, held by the service.
pub struct ResponseSender<T> {
    tx: mpsc::Sender<Result<T>>,
}

impl<T> Clone for ResponseSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub fn response_channel<T>(capacity: usize) -> (ResponseSender<T>, ResponseStream<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ResponseSender { tx }, ResponseStream { rx })
}

impl<T> ResponseStream<T> {
    /// Next message; `Ok(None)` once the service ends the stream.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    pub(crate) async fn recv_raw(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }
}

impl<T> ResponseSender<T> {
    /// Returns false when the client is gone.
    pub async fn send(&self, msg: T) -> bool {
        self.tx.send(Ok(msg)).await.is_ok()
    }

    pub async fn reject(&self, status: Status) -> bool {
        self.tx.send(Err(ObjnetError::Remote(status))).await.is_ok()
    }

    pub(crate) async fn send_raw(&self, item: Result<T>) -> bool {
        self.tx.send(item).await.is_ok()
    }
}

/// Client end of a bidirectional stream.
pub struct Duplex<Req, Resp> {
    tx: Option<mpsc::Sender<Outbound<Req>>>,
    responses: ResponseStream<Resp>,
}

/// Service end of a bidirectional stream.
pub struct ServerEnd<Req, Resp> {
    rx: mpsc::Receiver<Outbound<Req>>,
    responses: ResponseSender<Resp>,
}

/// Open a connected pair of stream ends.
pub fn duplex<Req, Resp>(capacity: usize) -> (Duplex<Req, Resp>, ServerEnd<Req, Resp>) {
    let (req_tx, req_rx) = mpsc::channel(capacity.max(1));
    let (responses_tx, responses) = response_channel(capacity);
    (
        Duplex {
            tx: Some(req_tx),
            responses,
        },
        ServerEnd {
            rx: req_rx,
            responses: responses_tx,
        },
    )
}

impl<Req, Resp> Duplex<Req, Resp> {
    /// Send one message, waiting for buffer space.
    pub async fn send(&mut self, msg: Req) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ObjnetError::integrity("send after close"))?;
        if tx.send(Outbound::Message(msg)).await.is_ok() {
            return Ok(());
        }
        self.tx = None;
        Err(self.remote_failure().await)
    }

    /// Close the send side with an end-of-stream marker.
    pub async fn close_send(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            if tx.send(Outbound::End).await.is_err() {
                return Err(self.remote_failure().await);
            }
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Option<Resp>> {
        self.responses.recv().await
    }

    /// Close the send side and wait for exactly one response.
    pub async fn close_and_recv(&mut self) -> Result<Resp> {
        self.close_send().await?;
        self.recv()
            .await?
            .ok_or_else(|| ObjnetError::integrity("stream ended without a response"))
    }

    pub(crate) fn into_parts(self) -> (Option<mpsc::Sender<Outbound<Req>>>, ResponseStream<Resp>) {
        (self.tx, self.responses)
    }

    /// Best explanation for a request side the service stopped reading.
    async fn remote_failure(&mut self) -> ObjnetError {
        match self.responses.recv_raw().await {
            Some(Err(err)) => err,
            Some(Ok(_)) => ObjnetError::integrity("unexpected response before end of request"),
            None => ObjnetError::Connection("stream closed by remote".into()),
        }
    }
}

impl<Req, Resp> ServerEnd<Req, Resp> {
    pub async fn recv(&mut self) -> Incoming<Req> {
        match self.rx.recv().await {
            Some(Outbound::Message(msg)) => Incoming::Message(msg),
            Some(Outbound::End) => Incoming::End,
            None => Incoming::Aborted,
        }
    }

    pub fn responses(&self) -> &ResponseSender<Resp> {
        &self.responses
    }

    pub async fn send(&self, msg: Resp) -> bool {
        self.responses.send(msg).await
    }

    pub async fn reject(&self, status: Status) -> bool {
        self.responses.reject(status).await
    }

    /// Separate the request receiver from the response sender so each can
    /// be driven by its own task.
    pub(crate) fn split(self) -> (mpsc::Receiver<Outbound<Req>>, ResponseSender<Resp>) {
        (self.rx, self.responses)
    }
}

/// Remote object service operations consumed by the client.
#[async_trait]
pub trait ObjectService: Send + Sync {
    /// Client-streamed upload: header frame, chunk frames, close, one ack.
    async fn put(&self) -> Result<Duplex<PutRequest, PutResponse>>;

    /// Server-streamed download: object frame, then chunk frames.
    async fn get(&self, request: GetRequest) -> Result<ResponseStream<GetResponse>>;

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse>;

    async fn head(&self, request: HeadRequest) -> Result<HeadResponse>;

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse>;

    async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse>;

    async fn get_range_hash(&self, request: GetRangeHashRequest) -> Result<GetRangeHashResponse>;

    /// Bidirectional session handshake stream.
    async fn create_session(&self) -> Result<Duplex<CreateRequest, CreateResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[tokio::test]
    async fn end_marker_distinguishes_close_from_abort() {
        let (mut client, mut server) = duplex::<u32, u32>(2);
        client.send(1).await.unwrap();
        client.close_send().await.unwrap();
        assert_eq!(server.recv().await, Incoming::Message(1));
        assert_eq!(server.recv().await, Incoming::End);

        let (mut client, mut server) = duplex::<u32, u32>(2);
        client.send(7).await.unwrap();
        drop(client);
        assert_eq!(server.recv().await, Incoming::Message(7));
        assert_eq!(server.recv().await, Incoming::Aborted);
    }

    #[tokio::test]
    async fn send_after_rejection_surfaces_status() {
        let (mut client, server) = duplex::<u32, u32>(1);
        server
            .reject(Status::new(StatusCode::PermissionDenied, "no token"))
            .await;
        drop(server);
        match client.send(1).await {
            Err(ObjnetError::Remote(status)) => {
                assert_eq!(status.code, StatusCode::PermissionDenied)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_and_recv_requires_a_response() {
        let (mut client, server) = duplex::<u32, u32>(1);
        drop(server);
        assert!(client.close_and_recv().await.is_err());
    }
}
