//! Client against the in-memory node: upload, download, delete and range
//! hash verification.

use std::io::Cursor;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use objnet_core::memory::MemoryNode;
use objnet_core::object::{parse_ranges, Header, Query, KEY_ROOT_OBJECT};
use objnet_core::rpc::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRangeHashRequest,
    GetRangeHashResponse, GetRangeRequest, GetRangeResponse, GetRequest, GetResponse, HeadRequest,
    HeadResponse, PutRequest, PutResponse, SearchRequest, SearchResponse,
};
use objnet_core::transport::{Duplex, ResponseStream};
use objnet_core::{
    tz, Client, ClientConfig, ContainerId, GetOutcome, ObjectService, ObjnetError, Result, Status,
    StatusCode, Verification,
};
use rand::rngs::OsRng;

const CID: [u8; 32] = [7u8; 32];

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn client_for<S: ObjectService>(service: S, config: ClientConfig) -> Client<S> {
    Client::new(service, SigningKey::generate(&mut OsRng), config).unwrap()
}

#[tokio::test]
async fn test_seven_units_split_into_three_chunks() {
    let node = MemoryNode::default();
    let client = client_for(
        node,
        ClientConfig {
            chunk_size: 3000,
            ..ClientConfig::default()
        },
    );
    let data = payload(7000);
    let out = client
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(data.clone()), Vec::new())
        .await
        .unwrap();
    assert_eq!(out.receipt.chunks, 3);
    assert_eq!(out.receipt.bytes, 7000);
    assert_eq!(out.receipt.digest, tz::digest(&data));
}

#[tokio::test]
async fn test_upload_verifies_until_remote_copy_changes() {
    let node = MemoryNode::default();
    let client = client_for(node.clone(), ClientConfig::default());
    let data = payload(5000);
    let out = client
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(data), Vec::new())
        .await
        .unwrap();
    assert!(client.verify_upload(&out.receipt).await.unwrap());

    assert!(node.tamper_payload(&out.receipt.address, 4321).await);
    assert!(!client.verify_upload(&out.receipt).await.unwrap());
}

#[tokio::test]
async fn test_two_ranges_yield_two_digests_in_order() {
    let node = MemoryNode::default();
    let client = client_for(node.clone(), ClientConfig::default());
    let data = payload(3000);
    let out = client
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(data.clone()), Vec::new())
        .await
        .unwrap();

    let ranges = parse_ranges(&["0:1000", "1000:2000"]).unwrap();
    let salt = [0xde, 0xad, 0xbe];
    let mut local = Cursor::new(data.clone());
    let checks = client
        .get_range_hash(out.receipt.address, &ranges, &salt, Some(&mut local))
        .await
        .unwrap();
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[0].range, ranges[0]);
    assert_eq!(checks[1].range, ranges[1]);
    assert_eq!(checks[0].digest, tz::salted_digest(&data[..1000], &salt));
    assert_eq!(checks[1].digest, tz::salted_digest(&data[1000..3000], &salt));
    assert!(checks.iter().all(|c| c.matches_local == Some(true)));

    // Without a local source there is nothing to compare.
    let checks = client
        .get_range_hash(out.receipt.address, &ranges, &[], None::<&mut Cursor<Vec<u8>>>)
        .await
        .unwrap();
    assert!(checks.iter().all(|c| c.matches_local.is_none()));

    node.tamper_payload(&out.receipt.address, 1500).await;
    let checks = client
        .get_range_hash(out.receipt.address, &ranges, &salt, Some(&mut local))
        .await
        .unwrap();
    assert_eq!(checks[0].matches_local, Some(true));
    assert_eq!(checks[1].matches_local, Some(false));
}

/// What a [`FaultyNode`] does to range hash responses.
#[derive(Clone, Copy, Debug)]
enum HashFault {
    ExtraHash,
    MissingHash,
    Unavailable,
}

/// Node wrapper that corrupts range hash responses.
struct FaultyNode {
    inner: MemoryNode,
    fault: HashFault,
}

#[async_trait]
impl ObjectService for FaultyNode {
    async fn put(&self) -> Result<Duplex<PutRequest, PutResponse>> {
        self.inner.put().await
    }

    async fn get(&self, request: GetRequest) -> Result<ResponseStream<GetResponse>> {
        self.inner.get(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        self.inner.delete(request).await
    }

    async fn head(&self, request: HeadRequest) -> Result<HeadResponse> {
        self.inner.head(request).await
    }

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.inner.search(request).await
    }

    async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse> {
        self.inner.get_range(request).await
    }

    async fn get_range_hash(&self, request: GetRangeHashRequest) -> Result<GetRangeHashResponse> {
        let mut response = self.inner.get_range_hash(request).await?;
        match self.fault {
            HashFault::ExtraHash => {
                let first = response.hashes[0];
                response.hashes.push(first);
            }
            HashFault::MissingHash => {
                response.hashes.pop();
            }
            HashFault::Unavailable => {
                return Err(Status::new(StatusCode::Internal, "hash unavailable").into())
            }
        }
        Ok(response)
    }

    async fn create_session(&self) -> Result<Duplex<CreateRequest, CreateResponse>> {
        self.inner.create_session().await
    }
}

#[tokio::test]
async fn test_range_hash_count_mismatch_is_protocol_error() {
    for fault in [HashFault::MissingHash, HashFault::ExtraHash] {
        let client = client_for(
            FaultyNode {
                inner: MemoryNode::default(),
                fault,
            },
            ClientConfig::default(),
        );
        let out = client
            .put(ContainerId::from_bytes(CID), &mut Cursor::new(payload(3000)), Vec::new())
            .await
            .unwrap();
        let ranges = parse_ranges(&["0:1000", "1000:2000"]).unwrap();
        let err = client
            .get_range_hash(out.receipt.address, &ranges, &[], None::<&mut Cursor<Vec<u8>>>)
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)), "{fault:?}: {err}");
    }
}

#[tokio::test]
async fn test_failed_verification_keeps_committed_address() {
    let node = MemoryNode::default();
    let client = client_for(
        FaultyNode {
            inner: node.clone(),
            fault: HashFault::Unavailable,
        },
        ClientConfig {
            verify_after_put: true,
            ..ClientConfig::default()
        },
    );
    let out = client
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(payload(300)), Vec::new())
        .await
        .unwrap();
    assert!(matches!(out.verified, Some(Verification::Unavailable(_))));
    assert_eq!(node.len().await, 1);
    assert!(node.stored(&out.receipt.address).await.is_some());
}

#[tokio::test]
async fn test_deleted_object_never_reaches_the_sink() {
    let node = MemoryNode::default();
    let client = client_for(node.clone(), ClientConfig::default());
    let out = client
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(payload(100)), Vec::new())
        .await
        .unwrap();
    client.delete(out.receipt.address).await.unwrap();

    let stored = node.stored(&out.receipt.address).await.unwrap();
    assert!(stored.is_tombstone());
    stored.verify().unwrap();

    let mut sink = Vec::new();
    let outcome = client.get(out.receipt.address, &mut sink).await.unwrap();
    assert!(matches!(outcome, GetOutcome::Removed(_)));
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_foreign_owner_cannot_delete() {
    let node = MemoryNode::default();
    let owner = client_for(node.clone(), ClientConfig::default());
    let intruder = client_for(node.clone(), ClientConfig::default());
    let out = owner
        .put(ContainerId::from_bytes(CID), &mut Cursor::new(payload(10)), Vec::new())
        .await
        .unwrap();
    let err = intruder.delete(out.receipt.address).await.unwrap_err();
    assert!(matches!(err, ObjnetError::Remote(_)));
    assert!(!node.stored(&out.receipt.address).await.unwrap().is_tombstone());
}

#[tokio::test]
async fn test_head_and_search() {
    let node = MemoryNode::default();
    let client = client_for(node, ClientConfig::default());
    let cid = ContainerId::from_bytes(CID);
    let root = client
        .put(
            cid,
            &mut Cursor::new(payload(10)),
            vec![Header::user("name", "cat.jpg"), Header::Root],
        )
        .await
        .unwrap();
    client
        .put(cid, &mut Cursor::new(payload(10)), vec![Header::user("name", "notes.txt")])
        .await
        .unwrap();

    let brief = client.head(root.receipt.address, false).await.unwrap();
    assert!(brief.user_headers().next().is_none());
    assert!(brief.payload.is_empty());
    let full = client.head(root.receipt.address, true).await.unwrap();
    assert_eq!(full.user_headers().collect::<Vec<_>>(), vec![("name", "cat.jpg")]);

    let jpgs = client
        .search(cid, Query::from_pairs(&["name", r"\.jpg$"]).unwrap())
        .await
        .unwrap();
    assert_eq!(jpgs, vec![root.receipt.address]);
    let roots = client
        .search(cid, Query::default().with_exact(KEY_ROOT_OBJECT))
        .await
        .unwrap();
    assert_eq!(roots, vec![root.receipt.address]);
    let all = client.search(cid, Query::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_concurrent_transfers_are_independent() {
    let node = MemoryNode::with_frame_size(0, 1024);
    let client = client_for(
        node,
        ClientConfig {
            chunk_size: 512,
            ..ClientConfig::default()
        },
    );
    let cid = ContainerId::from_bytes(CID);
    let a = payload(4000);
    let b: Vec<u8> = payload(3000).into_iter().rev().collect();
    let mut src_a = Cursor::new(a.clone());
    let mut src_b = Cursor::new(b.clone());
    let (ra, rb) = tokio::join!(
        client.put(cid, &mut src_a, Vec::new()),
        client.put(cid, &mut src_b, Vec::new()),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.receipt.digest, tz::digest(&a));
    assert_eq!(rb.receipt.digest, tz::digest(&b));

    let mut sink_a = Vec::new();
    let mut sink_b = Vec::new();
    let (ga, gb) = tokio::join!(
        client.get(ra.receipt.address, &mut sink_a),
        client.get(rb.receipt.address, &mut sink_b),
    );
    ga.unwrap();
    gb.unwrap();
    assert_eq!(sink_a, a);
    assert_eq!(sink_b, b);
}
