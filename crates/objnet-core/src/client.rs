//! High-level client: one method per remote operation, each bounded by the
//! configured deadline.

use std::future::Future;
use std::io::SeekFrom;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ObjnetError, Result};
use crate::object::{CreationPoint, Header, Object, Query, Range, SystemHeader};
use crate::refs::{Address, ContainerId, ObjectId, OwnerId};
use crate::rpc::{DeleteRequest, GetRangeRequest, GetRequest, HeadRequest, SearchRequest};
use crate::session::{establish_session, SessionScope, SessionToken};
use crate::transfer::{Download, DownloadReport, DownloadStart, Upload, UploadReceipt};
use crate::transport::ObjectService;
use crate::verify::{self, RangeCheck};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub receipt: UploadReceipt,
    /// Full-range hash comparison, when verification was requested.
    pub verified: Option<Verification>,
}

/// Post-upload check of a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Matched,
    Mismatched,
    /// The hash request failed. The object is stored regardless.
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetOutcome {
    /// The address holds a verified tombstone; nothing was written.
    Removed(Object),
    Received(DownloadReport),
}

pub struct Client<S> {
    service: S,
    key: SigningKey,
    config: ClientConfig,
}

impl<S: ObjectService> Client<S> {
    pub fn new(service: S, key: SigningKey, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            service,
            key,
            config,
        })
    }

    pub fn owner_id(&self) -> OwnerId {
        OwnerId::from_public_key(&self.key.verifying_key())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| ObjnetError::DeadlineExceeded)?,
            None => op.await,
        }
    }

    fn scope(&self, object_ids: Vec<ObjectId>) -> SessionScope {
        SessionScope::new(object_ids, self.config.first_epoch, self.config.last_epoch)
    }

    pub async fn establish_session(&self, object_ids: Vec<ObjectId>) -> Result<SessionToken> {
        let scope = self.scope(object_ids);
        self.with_deadline(establish_session(&self.service, &self.key, &scope))
            .await
    }

    /// Store the whole of `source` as a new object in `container_id`.
    pub async fn put<R>(
        &self,
        container_id: ContainerId,
        source: &mut R,
        headers: Vec<Header>,
    ) -> Result<PutOutcome>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        let receipt = self
            .with_deadline(self.upload(container_id, source, headers))
            .await?;
        let verified = if self.config.verify_after_put {
            Some(match self.verify_upload(&receipt).await {
                Ok(true) => Verification::Matched,
                Ok(false) => {
                    warn!(address = %receipt.address, "stored payload differs from upload");
                    Verification::Mismatched
                }
                Err(err) => {
                    warn!(address = %receipt.address, %err, "can't verify upload");
                    Verification::Unavailable(err.to_string())
                }
            })
        } else {
            None
        };
        Ok(PutOutcome { receipt, verified })
    }

    async fn upload<R>(
        &self,
        container_id: ContainerId,
        source: &mut R,
        headers: Vec<Header>,
    ) -> Result<UploadReceipt>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        let payload_length = source.seek(SeekFrom::End(0)).await?;
        source.seek(SeekFrom::Start(0)).await?;

        let id = ObjectId::new();
        let object = Object::new(
            SystemHeader {
                id,
                owner_id: self.owner_id(),
                container_id,
                payload_length,
                version: 1,
                created_at: CreationPoint {
                    unix_time: unix_now(),
                    epoch: 0,
                },
            },
            headers,
        );
        let token = establish_session(&self.service, &self.key, &self.scope(vec![id])).await?;

        let mut upload = Upload::new(self.service.put().await?, self.config.chunk_size)?
            .send_header(object, Some(token), self.config.ttl)
            .await?;
        upload.stream_from(source).await?;
        upload.finish().await
    }

    /// Download `address` into `sink`. A partial payload stays in the sink
    /// when the transfer fails midway.
    pub async fn get<W>(&self, address: Address, sink: &mut W) -> Result<GetOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.get_into(address, |_| async move { Ok::<_, std::io::Error>(sink) })
            .await
    }

    /// Like [`Client::get`], but the sink is opened only once the first
    /// frame announced a live object. Removed objects and failed requests
    /// never call `open_sink`.
    pub async fn get_into<F, Fut, W>(&self, address: Address, open_sink: F) -> Result<GetOutcome>
    where
        F: FnOnce(&Object) -> Fut + Send,
        Fut: Future<Output = std::io::Result<W>> + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.with_deadline(async {
            let stream = self
                .service
                .get(GetRequest {
                    address,
                    ttl: self.config.ttl,
                })
                .await?;
            match Download::new(stream).receive_header().await? {
                DownloadStart::Removed(object) => Ok(GetOutcome::Removed(object)),
                DownloadStart::Receiving(download) => {
                    let mut sink = open_sink(download.object()).await?;
                    let report = download.copy_to(&mut sink).await?;
                    debug!(
                        %address,
                        bytes = report.bytes,
                        chunks = report.chunks,
                        "object received"
                    );
                    Ok(GetOutcome::Received(report))
                }
            }
        })
        .await
    }

    pub async fn delete(&self, address: Address) -> Result<()> {
        self.with_deadline(async {
            let token = establish_session(
                &self.service,
                &self.key,
                &self.scope(vec![address.object_id()]),
            )
            .await?;
            self.service
                .delete(DeleteRequest {
                    address,
                    owner_id: self.owner_id(),
                    token,
                    ttl: self.config.ttl,
                })
                .await?;
            info!(%address, "object deleted");
            Ok(())
        })
        .await
    }

    /// Object header with the payload stripped.
    pub async fn head(&self, address: Address, full_headers: bool) -> Result<Object> {
        let request = HeadRequest {
            address,
            full_headers,
            ttl: self.config.ttl,
        };
        let response = self.with_deadline(self.service.head(request)).await?;
        Ok(response.object)
    }

    pub async fn search(&self, container_id: ContainerId, query: Query) -> Result<Vec<Address>> {
        let request = SearchRequest {
            container_id,
            query,
            ttl: self.config.ttl,
        };
        let response = self.with_deadline(self.service.search(request)).await?;
        Ok(response.addresses)
    }

    /// One payload fragment per range, in request order.
    pub async fn get_range(&self, address: Address, ranges: &[Range]) -> Result<Vec<Vec<u8>>> {
        let request = GetRangeRequest {
            address,
            ranges: ranges.to_vec(),
            ttl: self.config.ttl,
        };
        let response = self.with_deadline(self.service.get_range(request)).await?;
        if response.fragments.len() != ranges.len() {
            return Err(ObjnetError::integrity(format!(
                "requested {} ranges, received {}",
                ranges.len(),
                response.fragments.len()
            )));
        }
        for (range, fragment) in ranges.iter().zip(&response.fragments) {
            if fragment.len() as u64 != range.length {
                return Err(ObjnetError::integrity(format!(
                    "range {range} returned {} bytes",
                    fragment.len()
                )));
            }
        }
        Ok(response.fragments)
    }

    /// Remote range digests, compared with `local` when given.
    pub async fn get_range_hash<R>(
        &self,
        address: Address,
        ranges: &[Range],
        salt: &[u8],
        local: Option<&mut R>,
    ) -> Result<Vec<RangeCheck>>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        self.with_deadline(verify::verify_ranges(
            &self.service,
            address,
            ranges,
            salt,
            self.config.ttl,
            local,
        ))
        .await
    }

    pub async fn verify_upload(&self, receipt: &UploadReceipt) -> Result<bool> {
        self.with_deadline(verify::verify_upload(&self.service, receipt, self.config.ttl))
            .await
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
