//! Contact pairing
//!
//! Pairing turns a discovered peer into a persisted contact with a shared
//! AES key. The responder issues a short numeric code out of band; the
//! initiator submits a hash of the code plus its public key wrapped with
//! that code. On acceptance both ends run ECDH and end up with the same
//! per-contact key without either private key, or the raw shared key, ever
//! crossing the wire.

use crate::discovery::DiscoveryRegistry;
use crate::events::{Event, EventBus};
use crate::protocol::{PairError, PairRequest, PairResponse};
use crate::secrets::{keys, SecretStore};
use crate::storage::{Contact, Profile, Storage};
use crate::{crypto, Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::rngs::OsRng;
use rand::Rng;
use std::time::Duration;
use tracing::info;
use zeroize::Zeroize;

/// How long an issued pairing code stays redeemable
pub const CODE_TTL: Duration = Duration::from_secs(60);

/// Issues pairing codes and runs both ends of the pairing handshake
#[derive(Clone)]
pub struct PairingCoordinator {
    secrets: SecretStore,
    storage: Storage,
    discovery: DiscoveryRegistry,
    events: EventBus,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl PairingCoordinator {
    /// Wire up a coordinator over the shared session components
    pub fn new(
        secrets: SecretStore,
        storage: Storage,
        discovery: DiscoveryRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            secrets,
            storage,
            discovery,
            events,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Issue a fresh six-digit pairing code, valid for [`CODE_TTL`]
    ///
    /// The code is three independently drawn two-digit groups, zero-padded,
    /// so "04" and "00" occur at full probability. Issuing a new code
    /// replaces any live one.
    pub async fn issue_code(&self) -> String {
        let mut rng = OsRng;
        let code: String = (0..3)
            .map(|_| format!("{:02}", rng.gen_range(0..100u32)))
            .collect();
        self.secrets
            .set_with_expiry(keys::PAIRING_CODE, code.clone().into_bytes(), CODE_TTL)
            .await;
        code
    }

    /// Responder side: validate an inbound pairing request and, on success,
    /// persist the contact and hand back our wrapped public key
    ///
    /// The live code admits exactly one pairing; it is deleted the moment a
    /// request succeeds, so a second initiator holding the same code is
    /// turned away.
    pub async fn handle_pairing_request(&self, req: PairRequest) -> Result<PairResponse> {
        let code = self
            .secrets
            .get_string(keys::PAIRING_CODE)
            .await
            .ok_or_else(|| Error::NotFound("no pairing code live".to_string()))?;

        if crypto::sha256_hex(code.as_bytes()) != req.code_hash {
            return Err(Error::Unauthorized("wrong pairing code".to_string()));
        }

        if self.storage.find_contact(&req.id).await?.is_some() {
            return Err(Error::Conflict("already paired".to_string()));
        }

        let wrapped_remote = BASE64
            .decode(&req.pubkey)
            .map_err(|_| Error::Crypto("malformed public key encoding".to_string()))?;
        let remote_pub = crypto::unwrap_with_password(code.as_bytes(), &wrapped_remote)?;

        let local_pub = self
            .secrets
            .get(keys::PUBLIC_KEY)
            .await
            .ok_or_else(|| Error::Validation("session key material unavailable".to_string()))?;

        let (shared, wrapped_shared) = self.derive_contact_key(&remote_pub).await?;

        self.storage
            .create_contact(&Contact {
                id: req.id.clone(),
                username: req.username.clone(),
                shared_key: wrapped_shared,
            })
            .await?;
        self.secrets.set(keys::shared(&req.id), shared).await;

        // Single use: invalidate before the TTL gets a chance to
        self.secrets.delete(keys::PAIRING_CODE).await;

        info!(id = %req.id, username = %req.username, "pairing accepted");
        self.events.emit(Event::ContactAdded(Profile {
            id: req.id,
            username: req.username,
        }));

        let pubkey = crypto::wrap_with_password(code.as_bytes(), &local_pub)?;
        Ok(PairResponse {
            pubkey: BASE64.encode(pubkey),
        })
    }

    /// Initiator side: redeem a code against a discovered peer
    ///
    /// On success the contact is persisted with the derived shared key and
    /// a [`Event::ContactAdded`] is emitted. Remote rejections are mapped
    /// back from the wire reason vocabulary, so a wrong code surfaces here
    /// as [`Error::Unauthorized`] just as it does on the responder.
    pub async fn request_pair(&self, peer_id: &str, code: &str) -> Result<Profile> {
        let peer = self
            .discovery
            .get_peer(peer_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id} not discovered")))?;

        if self.storage.find_contact(peer_id).await?.is_some() {
            return Err(Error::Conflict("already paired".to_string()));
        }

        let id = self
            .secrets
            .get_string(keys::USER_ID)
            .await
            .ok_or_else(|| Error::NotFound("not logged in".to_string()))?;
        let username = self
            .secrets
            .get_string(keys::USERNAME)
            .await
            .ok_or_else(|| Error::NotFound("not logged in".to_string()))?;
        let local_pub = self
            .secrets
            .get(keys::PUBLIC_KEY)
            .await
            .ok_or_else(|| Error::Validation("session key material unavailable".to_string()))?;

        let request = PairRequest {
            id,
            username,
            code_hash: crypto::sha256_hex(code.as_bytes()),
            pubkey: BASE64.encode(crypto::wrap_with_password(code.as_bytes(), &local_pub)?),
        };

        let uri: hyper::Uri = format!("http://{}/api/user/pair", peer.addr)
            .parse()
            .map_err(|_| Error::Transport("invalid peer address".to_string()))?;
        let body = serde_json::to_vec(&request)?;
        let http_req = Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response = self
            .client
            .request(http_req)
            .await
            .map_err(|e| Error::Transport(format!("pairing request failed: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(match serde_json::from_slice::<PairError>(&bytes) {
                Ok(rejection) => rejection.error.into_error(),
                Err(_) => Error::Transport(format!("peer returned {status}")),
            });
        }

        let accepted: PairResponse = serde_json::from_slice(&bytes)?;
        let wrapped_remote = BASE64
            .decode(&accepted.pubkey)
            .map_err(|_| Error::Crypto("malformed public key encoding".to_string()))?;
        let remote_pub = crypto::unwrap_with_password(code.as_bytes(), &wrapped_remote)?;

        let (shared, wrapped_shared) = self.derive_contact_key(&remote_pub).await?;
        let contact = Contact {
            id: peer.id.clone(),
            username: peer.username.clone(),
            shared_key: wrapped_shared,
        };
        self.storage.create_contact(&contact).await?;
        self.secrets.set(keys::shared(&peer.id), shared).await;

        let profile = contact.profile();
        info!(id = %profile.id, username = %profile.username, "paired with peer");
        self.events.emit(Event::ContactAdded(profile.clone()));
        Ok(profile)
    }

    /// Run ECDH against `remote_pub` and return the raw shared key together
    /// with its password-wrapped form for persistence
    async fn derive_contact_key(&self, remote_pub: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let password = self
            .secrets
            .get(keys::PASSWORD)
            .await
            .ok_or_else(|| Error::Validation("session password unavailable".to_string()))?;
        let identity = self
            .storage
            .find_identity()
            .await?
            .ok_or_else(|| Error::Validation("no local identity".to_string()))?;

        let mut priv_key = crypto::unwrap_with_password(&password, &identity.priv_key)
            .map_err(|_| Error::Validation("identity key unavailable".to_string()))?;

        let derived = crypto::derive_shared_key(&priv_key, remote_pub);
        priv_key.zeroize();
        let shared = derived?;

        let wrapped = crypto::wrap_with_password(&password, &shared)?;
        Ok((shared, wrapped))
    }
}
