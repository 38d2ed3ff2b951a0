//! Session lifecycle
//!
//! One [`Session`] per embedding process: register creates the single local
//! identity, login unlocks it and brings the listener and mDNS
//! advertisement up, logout tears both down and wipes every cached secret.

use crate::crypto::{self, KeyPair};
use crate::discovery::{DiscoveryRegistry, SERVICE_PORT};
use crate::events::EventBus;
use crate::pairing::PairingCoordinator;
use crate::secrets::{keys, SecretStore};
use crate::storage::{Identity, Profile, Storage};
use crate::transport::MessageTransport;
use crate::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=16;
const PASSWORD_LEN: std::ops::RangeInclusive<usize> = 8..=32;

/// The top-level handle an embedding UI holds
pub struct Session {
    storage: Storage,
    secrets: SecretStore,
    discovery: DiscoveryRegistry,
    transport: MessageTransport,
    pairing: PairingCoordinator,
    events: EventBus,
    listen_addr: SocketAddr,
    /// Present while logged in; canceling it stops the listener and the
    /// advertisement together
    cancel: Mutex<Option<CancellationToken>>,
}

impl Session {
    /// Build a session over the given storage, listening on the standard
    /// port on all interfaces
    pub fn new(storage: Storage) -> Self {
        Self::with_listen_addr(
            storage,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), SERVICE_PORT),
        )
    }

    /// Build a session with an explicit listen address; tests bind port 0
    pub fn with_listen_addr(storage: Storage, listen_addr: SocketAddr) -> Self {
        let secrets = SecretStore::new();
        let discovery = DiscoveryRegistry::new(secrets.clone());
        let events = EventBus::new();
        let transport = MessageTransport::new(
            secrets.clone(),
            storage.clone(),
            discovery.clone(),
            events.clone(),
        );
        let pairing = PairingCoordinator::new(
            secrets.clone(),
            storage.clone(),
            discovery.clone(),
            events.clone(),
        );

        Self {
            storage,
            secrets,
            discovery,
            transport,
            pairing,
            events,
            listen_addr,
            cancel: Mutex::new(None),
        }
    }

    /// Create the installation's identity
    ///
    /// Generates a fresh P-256 key pair and persists both halves wrapped
    /// with the password; the password itself is stored only as a bcrypt
    /// hash. One identity per installation.
    pub async fn register(&self, username: &str, password: &str) -> Result<Profile> {
        if !USERNAME_LEN.contains(&username.len())
            || !username.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::Validation(
                "username must be 3-16 alphanumeric characters".to_string(),
            ));
        }
        if !PASSWORD_LEN.contains(&password.len()) {
            return Err(Error::Validation(
                "password must be 8-32 characters".to_string(),
            ));
        }

        if self.storage.find_identity().await?.is_some() {
            return Err(Error::Conflict("an identity is already registered".to_string()));
        }

        let pair = KeyPair::generate();
        let identity = Identity {
            id: Uuid::now_v7().to_string(),
            username: username.to_string(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map_err(|e| Error::Crypto(format!("password hashing failed: {e}")))?,
            priv_key: crypto::wrap_with_password(password.as_bytes(), &pair.private_bytes())?,
            pub_key: crypto::wrap_with_password(password.as_bytes(), &pair.public_bytes())?,
        };
        self.storage.create_identity(&identity).await?;

        info!(id = %identity.id, %username, "identity registered");
        Ok(identity.profile())
    }

    /// Unlock the identity and bring the node online
    ///
    /// Binds the inbound listener, seeds the secret store with the session
    /// password and unwrapped public key, and starts advertising. The
    /// store is seeded only once the listener is up, so a failed login
    /// leaves no secrets cached. Advertisement failures are logged but do
    /// not fail the login; the node is still reachable by address.
    pub async fn login(&self, username: &str, password: &str) -> Result<Profile> {
        let mut cancel = self.cancel.lock().await;
        if cancel.is_some() {
            return Err(Error::Conflict("already logged in".to_string()));
        }

        let identity = self
            .storage
            .find_identity()
            .await?
            .ok_or_else(|| Error::NotFound("no identity registered".to_string()))?;

        let verified = identity.username == username
            && bcrypt::verify(password, &identity.password_hash)
                .map_err(|e| Error::Crypto(format!("password verification failed: {e}")))?;
        if !verified {
            return Err(Error::Unauthorized("invalid credentials".to_string()));
        }

        let pub_key = crypto::unwrap_with_password(password.as_bytes(), &identity.pub_key)?;

        let token = CancellationToken::new();
        self.transport
            .start(self.listen_addr, self.pairing.clone(), token.child_token())
            .await?;

        self.secrets
            .set(keys::USER_ID, identity.id.clone().into_bytes())
            .await;
        self.secrets
            .set(keys::USERNAME, username.as_bytes().to_vec())
            .await;
        self.secrets
            .set(keys::PASSWORD, password.as_bytes().to_vec())
            .await;
        self.secrets.set(keys::PUBLIC_KEY, pub_key).await;

        if let Err(e) = self.discovery.advertise(
            identity.id.clone(),
            username.to_string(),
            token.child_token(),
        ) {
            warn!("advertisement not started: {e}");
        }

        *cancel = Some(token);
        info!(id = %identity.id, %username, "logged in");
        Ok(identity.profile())
    }

    /// Take the node offline and wipe all session secrets
    ///
    /// Safe to call when not logged in.
    pub async fn logout(&self) {
        let mut cancel = self.cancel.lock().await;
        if let Some(token) = cancel.take() {
            token.cancel();
        }
        self.secrets.clear().await;
        info!("logged out");
    }

    /// Paired contacts, without key material
    pub async fn contacts(&self) -> Result<Vec<Profile>> {
        self.storage.list_contacts().await
    }

    /// Event stream for the embedding UI
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Message send and history surface
    pub fn transport(&self) -> &MessageTransport {
        &self.transport
    }

    /// Pairing code issue and redemption surface
    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    /// Peer discovery surface
    pub fn discovery(&self) -> &DiscoveryRegistry {
        &self.discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::with_listen_addr(
            Storage::open_in_memory().expect("in-memory storage"),
            "127.0.0.1:0".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_login_logout_lifecycle() {
        let session = session();

        let profile = session.register("alice", "hunter2hunter2").await.unwrap();
        assert_eq!(profile.username, "alice");

        let logged_in = session.login("alice", "hunter2hunter2").await.unwrap();
        assert_eq!(logged_in.id, profile.id);

        // Session secrets are seeded
        assert_eq!(
            session.secrets.get_string(keys::USER_ID).await.unwrap(),
            profile.id
        );
        assert_eq!(
            session.secrets.get(keys::PUBLIC_KEY).await.unwrap().len(),
            65
        );

        session.logout().await;
        assert!(session.secrets.get(keys::USER_ID).await.is_none());
        assert!(session.secrets.get(keys::PASSWORD).await.is_none());

        // Logging back in works after logout
        session.login("alice", "hunter2hunter2").await.unwrap();
    }

    #[tokio::test]
    async fn test_register_validation() {
        let session = session();

        assert!(matches!(
            session.register("ab", "hunter2hunter2").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            session.register("not a name", "hunter2hunter2").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            session.register("alice", "short").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_register_twice_is_conflict() {
        let session = session();
        session.register("alice", "hunter2hunter2").await.unwrap();

        let err = session.register("other", "hunter2hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let session = session();

        // No identity yet
        assert!(matches!(
            session.login("alice", "hunter2hunter2").await,
            Err(Error::NotFound(_))
        ));

        session.register("alice", "hunter2hunter2").await.unwrap();
        assert!(matches!(
            session.login("alice", "wrong password").await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            session.login("mallory", "hunter2hunter2").await,
            Err(Error::Unauthorized(_))
        ));

        // Failed logins leave no secrets behind
        assert!(session.secrets.get(keys::PASSWORD).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_listener_bind_leaves_no_secrets() {
        // Occupy a port so the session's bind fails
        let busy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = busy.local_addr().unwrap();

        let session =
            Session::with_listen_addr(Storage::open_in_memory().unwrap(), addr);
        session.register("alice", "hunter2hunter2").await.unwrap();

        let err = session.login("alice", "hunter2hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        // The node never came online, so nothing may behave as logged in
        assert!(session.secrets.get(keys::USER_ID).await.is_none());
        assert!(session.secrets.get(keys::PASSWORD).await.is_none());
        assert!(session.secrets.get(keys::PUBLIC_KEY).await.is_none());

        // And the session is not stuck half-open: once the port frees up,
        // login succeeds
        drop(busy);
        session.login("alice", "hunter2hunter2").await.unwrap();
    }

    #[tokio::test]
    async fn test_double_login_is_conflict() {
        let session = session();
        session.register("alice", "hunter2hunter2").await.unwrap();
        session.login("alice", "hunter2hunter2").await.unwrap();

        let err = session.login("alice", "hunter2hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_contacts_empty_until_paired() {
        let session = session();
        assert!(session.contacts().await.unwrap().is_empty());
    }
}
