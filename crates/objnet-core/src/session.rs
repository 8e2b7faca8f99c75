//! Session tokens and the challenge-response negotiation that produces them.
//!
//! The handshake runs over one bidirectional stream:
//!
//! 1. the client proposes `{owner, scope, epochs}`;
//! 2. the service echoes it unsigned, adding the negotiated public key;
//! 3. the client checks the echo field-for-field against its proposal;
//! 4. the client signs the echo and sends it back;
//! 5. the service answers with the accepted token.
//!
//! [`Negotiation`] models each step as its own state type, so a token can
//! only be signed after its echo has been checked.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ObjnetError, Result};
use crate::refs::{ObjectId, OwnerId};
use crate::rpc::{CreateRequest, CreateResponse};
use crate::transport::{Duplex, ObjectService};

pub type SessionStream = Duplex<CreateRequest, CreateResponse>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Session public key chosen by the service.
    #[serde(with = "crate::serde_hex::option", default)]
    pub public_key: Option<[u8; 32]>,
    /// Service acceptance: session key signature over the owner signature.
    #[serde(with = "crate::serde_hex::option", default)]
    pub key_signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSignature {
    #[serde(with = "crate::serde_hex")]
    pub public_key: [u8; 32],
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
}

/// Credential scoping an owner's authority to object ids and an epoch window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub owner_id: OwnerId,
    pub object_ids: Vec<ObjectId>,
    pub first_epoch: u64,
    pub last_epoch: u64,
    #[serde(default)]
    pub header: TokenHeader,
    #[serde(default)]
    pub signature: Option<OwnerSignature>,
}

impl SessionToken {
    /// Unsigned proposal for `scope` on behalf of `key`'s owner.
    pub fn proposal(key: &SigningKey, scope: &SessionScope) -> Self {
        Self {
            owner_id: OwnerId::from_public_key(&key.verifying_key()),
            object_ids: scope.object_ids.clone(),
            first_epoch: scope.first_epoch,
            last_epoch: scope.last_epoch,
            header: TokenHeader::default(),
            signature: None,
        }
    }

    /// Digest covered by the owner signature.
    pub fn signed_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"objnet-session-v1");
        hasher.update(self.owner_id.as_bytes());
        hasher.update((self.object_ids.len() as u64).to_le_bytes());
        for oid in &self.object_ids {
            hasher.update(oid.as_bytes());
        }
        hasher.update(self.first_epoch.to_le_bytes());
        hasher.update(self.last_epoch.to_le_bytes());
        match &self.header.public_key {
            Some(pk) => {
                hasher.update([1u8]);
                hasher.update(pk);
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }

    pub fn sign(&mut self, key: &SigningKey) {
        let signature = key.sign(&self.signed_digest());
        self.signature = Some(OwnerSignature {
            public_key: key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        });
    }

    /// Check that the token is signed by the key its owner id derives from.
    pub fn verify_owner(&self) -> Result<()> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| ObjnetError::Signature("token is not signed".into()))?;
        let key = VerifyingKey::from_bytes(&sig.public_key)
            .map_err(|e| ObjnetError::Signature(e.to_string()))?;
        if OwnerId::from_public_key(&key) != self.owner_id {
            return Err(ObjnetError::Signature(
                "signing key does not belong to token owner".into(),
            ));
        }
        let signature = Signature::from_slice(&sig.signature)
            .map_err(|e| ObjnetError::Signature(e.to_string()))?;
        key.verify(&self.signed_digest(), &signature)
            .map_err(|_| ObjnetError::Signature("owner signature invalid".into()))
    }

    /// Service side: countersign with the negotiated session key.
    pub fn accept(&mut self, session_key: &SigningKey) -> Result<()> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| ObjnetError::Signature("token is not signed".into()))?;
        let acceptance = session_key.sign(&sig.signature);
        self.header.key_signature = Some(acceptance.to_bytes().to_vec());
        Ok(())
    }

    /// Check the service acceptance against the negotiated public key.
    pub fn verify_acceptance(&self) -> Result<()> {
        let pk = self
            .header
            .public_key
            .ok_or_else(|| ObjnetError::Signature("token without session key".into()))?;
        let owner_sig = self
            .signature
            .as_ref()
            .ok_or_else(|| ObjnetError::Signature("token is not signed".into()))?;
        let acceptance = self
            .header
            .key_signature
            .as_ref()
            .ok_or_else(|| ObjnetError::Signature("token is not accepted".into()))?;
        let key =
            VerifyingKey::from_bytes(&pk).map_err(|e| ObjnetError::Signature(e.to_string()))?;
        let signature = Signature::from_slice(acceptance)
            .map_err(|e| ObjnetError::Signature(e.to_string()))?;
        key.verify(&owner_sig.signature, &signature)
            .map_err(|_| ObjnetError::Signature("acceptance signature invalid".into()))
    }

    /// Whether every id is in scope and `epoch` lies in the window.
    pub fn authorizes(&self, object_ids: &[ObjectId], epoch: u64) -> bool {
        (self.first_epoch..=self.last_epoch).contains(&epoch)
            && object_ids.iter().all(|oid| self.object_ids.contains(oid))
    }

    fn same_proposal(&self, other: &SessionToken) -> bool {
        self.owner_id == other.owner_id
            && self.first_epoch == other.first_epoch
            && self.last_epoch == other.last_epoch
            && self.object_ids == other.object_ids
    }
}

/// Object ids and epoch window requested for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionScope {
    pub object_ids: Vec<ObjectId>,
    pub first_epoch: u64,
    pub last_epoch: u64,
}

impl SessionScope {
    pub fn new(object_ids: Vec<ObjectId>, first_epoch: u64, last_epoch: u64) -> Self {
        Self {
            object_ids,
            first_epoch,
            last_epoch,
        }
    }

    /// Scope covering every epoch.
    pub fn unbounded(object_ids: Vec<ObjectId>) -> Self {
        Self::new(object_ids, 0, u64::MAX)
    }
}

/// Step 3: the echo must match the proposal exactly and carry a key.
pub fn check_echo(proposal: &SessionToken, echo: &SessionToken) -> Result<()> {
    if !proposal.same_proposal(echo) {
        return Err(ObjnetError::integrity("received token differs from proposal"));
    }
    if echo.header.public_key.is_none() {
        return Err(ObjnetError::integrity("received token without public key"));
    }
    Ok(())
}

pub struct Proposed {
    proposal: SessionToken,
}

pub struct AwaitingEcho {
    proposal: SessionToken,
}

pub struct Echoed {
    proposal: SessionToken,
    echo: SessionToken,
}

pub struct AwaitingResult {
    proposal: SessionToken,
    signed: SessionToken,
}

/// One handshake in progress over its own stream.
pub struct Negotiation<'k, S> {
    key: &'k SigningKey,
    stream: SessionStream,
    state: S,
}

impl<'k> Negotiation<'k, Proposed> {
    pub fn new(key: &'k SigningKey, stream: SessionStream, scope: &SessionScope) -> Self {
        Self {
            key,
            stream,
            state: Proposed {
                proposal: SessionToken::proposal(key, scope),
            },
        }
    }

    pub async fn send_init(mut self) -> Result<Negotiation<'k, AwaitingEcho>> {
        let proposal = self.state.proposal;
        debug!(
            owner = %proposal.owner_id,
            objects = proposal.object_ids.len(),
            "proposing session"
        );
        self.stream
            .send(CreateRequest::Init {
                token: proposal.clone(),
            })
            .await?;
        Ok(Negotiation {
            key: self.key,
            stream: self.stream,
            state: AwaitingEcho { proposal },
        })
    }
}

impl<'k> Negotiation<'k, AwaitingEcho> {
    pub async fn receive_echo(mut self) -> Result<Negotiation<'k, Echoed>> {
        let echo = match self.stream.recv().await? {
            Some(CreateResponse::Unsigned { token }) => token,
            Some(CreateResponse::Result { .. }) => {
                return Err(ObjnetError::integrity("expected unsigned token"))
            }
            None => return Err(ObjnetError::integrity("stream ended before echo")),
        };
        if let Err(err) = check_echo(&self.state.proposal, &echo) {
            warn!(error = %err, "session echo rejected");
            return Err(err);
        }
        Ok(Negotiation {
            key: self.key,
            stream: self.stream,
            state: Echoed {
                proposal: self.state.proposal,
                echo,
            },
        })
    }
}

impl<'k> Negotiation<'k, Echoed> {
    pub async fn sign_and_send(mut self) -> Result<Negotiation<'k, AwaitingResult>> {
        let Echoed {
            proposal,
            echo: mut signed,
        } = self.state;
        signed.sign(self.key);
        self.stream
            .send(CreateRequest::Signed {
                token: signed.clone(),
            })
            .await?;
        Ok(Negotiation {
            key: self.key,
            stream: self.stream,
            state: AwaitingResult { proposal, signed },
        })
    }
}

impl<'k> Negotiation<'k, AwaitingResult> {
    pub async fn finish(mut self) -> Result<SessionToken> {
        let result = match self.stream.recv().await? {
            Some(CreateResponse::Result { token }) => token,
            Some(CreateResponse::Unsigned { .. }) => {
                return Err(ObjnetError::integrity("expected result token"))
            }
            None => return Err(ObjnetError::integrity("stream ended before result")),
        };
        let AwaitingResult { proposal, signed } = self.state;
        if !proposal.same_proposal(&result) {
            return Err(ObjnetError::integrity("result token differs from proposal"));
        }
        if result.signature != signed.signature
            || result.header.public_key != signed.header.public_key
        {
            return Err(ObjnetError::integrity("result token lost client signature"));
        }
        result
            .verify_acceptance()
            .map_err(|e| ObjnetError::integrity(format!("result token: {e}")))?;
        // Best effort: the service may already have closed its side.
        let _ = self.stream.close_send().await;
        debug!(owner = %result.owner_id, "session established");
        Ok(result)
    }
}

/// Run the whole handshake on a fresh stream from `service`.
pub async fn establish_session<S>(
    service: &S,
    key: &SigningKey,
    scope: &SessionScope,
) -> Result<SessionToken>
where
    S: ObjectService + ?Sized,
{
    let stream = service.create_session().await?;
    Negotiation::new(key, stream, scope)
        .send_init()
        .await?
        .receive_echo()
        .await?
        .sign_and_send()
        .await?
        .finish()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{duplex, Incoming, ServerEnd};
    use rand::rngs::OsRng;

    type Tamper = fn(&mut SessionToken);

    /// Scripted service: echoes the proposal through `tamper`, then accepts.
    async fn scripted_service(
        mut server: ServerEnd<CreateRequest, CreateResponse>,
        tamper: Tamper,
    ) {
        let session_key = SigningKey::generate(&mut OsRng);
        let mut token = match server.recv().await {
            Incoming::Message(CreateRequest::Init { token }) => token,
            _ => return,
        };
        token.header.public_key = Some(session_key.verifying_key().to_bytes());
        tamper(&mut token);
        server.send(CreateResponse::Unsigned { token }).await;
        if let Incoming::Message(CreateRequest::Signed { mut token }) = server.recv().await {
            token.accept(&session_key).unwrap();
            server.send(CreateResponse::Result { token }).await;
        }
    }

    async fn negotiate(tamper: Tamper, ids: Vec<ObjectId>) -> Result<SessionToken> {
        let key = SigningKey::generate(&mut OsRng);
        let (client, server) = duplex(4);
        tokio::spawn(scripted_service(server, tamper));
        Negotiation::new(&key, client, &SessionScope::new(ids, 3, 9))
            .send_init()
            .await?
            .receive_echo()
            .await?
            .sign_and_send()
            .await?
            .finish()
            .await
    }

    #[tokio::test]
    async fn honest_echo_yields_signed_token() {
        let ids = vec![ObjectId::new(), ObjectId::new()];
        let token = negotiate(|_| {}, ids.clone()).await.unwrap();
        assert_eq!(token.object_ids, ids);
        assert_eq!((token.first_epoch, token.last_epoch), (3, 9));
        token.verify_owner().unwrap();
        token.verify_acceptance().unwrap();
        assert!(token.authorizes(&ids[..1], 5));
        assert!(!token.authorizes(&ids, 10));
        assert!(!token.authorizes(&[ObjectId::new()], 5));
    }

    #[tokio::test]
    async fn dropped_object_id_is_rejected() {
        let ids = vec![ObjectId::new(), ObjectId::new()];
        let err = negotiate(
            |t| {
                t.object_ids.pop();
            },
            ids,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[tokio::test]
    async fn reordered_scope_is_rejected() {
        let ids = vec![ObjectId::new(), ObjectId::new()];
        let err = negotiate(|t| t.object_ids.reverse(), ids).await.unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[tokio::test]
    async fn widened_epochs_are_rejected() {
        let err = negotiate(|t| t.last_epoch = u64::MAX, vec![ObjectId::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[tokio::test]
    async fn missing_public_key_is_rejected() {
        let err = negotiate(|t| t.header.public_key = None, vec![ObjectId::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[tokio::test]
    async fn result_without_acceptance_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let (client, mut server) = duplex::<CreateRequest, CreateResponse>(4);
        tokio::spawn(async move {
            if let Incoming::Message(CreateRequest::Init { mut token }) = server.recv().await {
                token.header.public_key = Some([5u8; 32]);
                server.send(CreateResponse::Unsigned { token }).await;
            }
            if let Incoming::Message(CreateRequest::Signed { token }) = server.recv().await {
                server.send(CreateResponse::Result { token }).await;
            }
        });
        let err = Negotiation::new(&key, client, &SessionScope::unbounded(vec![ObjectId::new()]))
            .send_init()
            .await
            .unwrap()
            .receive_echo()
            .await
            .unwrap()
            .sign_and_send()
            .await
            .unwrap()
            .finish()
            .await
            .unwrap_err();
        assert!(matches!(err, ObjnetError::ProtocolIntegrity(_)));
    }

    #[test]
    fn signature_binds_scope() {
        let key = SigningKey::generate(&mut OsRng);
        let scope = SessionScope::unbounded(vec![ObjectId::new()]);
        let mut token = SessionToken::proposal(&key, &scope);
        token.sign(&key);
        token.verify_owner().unwrap();
        token.object_ids.push(ObjectId::new());
        assert!(token.verify_owner().is_err());
    }
}
