//! Peer discovery
//!
//! Publishes this node's presence as a multicast DNS service record and
//! maintains a live in-memory map of peers learned from other nodes'
//! announcements. Peers are ephemeral: the map is rebuilt by [`refresh`]
//! snapshots and vanishes with the process.
//!
//! [`refresh`]: DiscoveryRegistry::refresh

use crate::secrets::{keys, SecretStore};
use crate::{Error, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// mDNS service type, fixed for all Lanchat nodes
pub const SERVICE_TYPE: &str = "_p2pchat._tcp.local.";

/// Port every node listens on for pairing and chat requests
pub const SERVICE_PORT: u16 = 60606;

/// TXT field carrying the identity id
const TXT_ID: &str = "ID";

/// TXT field carrying the username
const TXT_USERNAME: &str = "USERNAME";

/// Default bounded duration of a discovery query
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// A currently reachable peer, as learned from its latest announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's identity id
    pub id: String,
    /// The peer's advertised username
    pub username: String,
    /// Where the peer's endpoints are reachable
    pub addr: SocketAddr,
}

impl Peer {
    /// Decode a resolved service record into a typed peer
    ///
    /// Returns `None` for records missing an address or either TXT field,
    /// and for our own announcement (matched by username).
    pub(crate) fn from_service_info(info: &ServiceInfo, local_username: &str) -> Option<Self> {
        let id = info.get_property_val_str(TXT_ID)?;
        let username = info.get_property_val_str(TXT_USERNAME)?;
        if id.is_empty() || username.is_empty() || username == local_username {
            return None;
        }

        let addresses = info.get_addresses();
        let ip = addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addresses.iter().next())
            .copied()?;

        Some(Peer {
            id: id.to_string(),
            username: username.to_string(),
            addr: SocketAddr::new(ip, info.get_port()),
        })
    }
}

/// Live map of reachable peers plus the advertisement lifecycle
#[derive(Clone)]
pub struct DiscoveryRegistry {
    secrets: SecretStore,
    /// Keyed by mDNS instance fullname; newer announcements replace older
    /// entries wholesale
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    advertising: Arc<AtomicBool>,
}

impl DiscoveryRegistry {
    /// Create an empty registry
    pub fn new(secrets: SecretStore) -> Self {
        Self {
            secrets,
            peers: Arc::new(Mutex::new(HashMap::new())),
            advertising: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish this node's presence until the session token is canceled
    ///
    /// A node advertises at most once at a time; a second call while an
    /// advertisement is active is a conflict. Registration failures inside
    /// the spawned task are logged, not propagated, matching the original
    /// fire-and-forget broadcast.
    pub fn advertise(&self, id: String, username: String, cancel: CancellationToken) -> Result<()> {
        if self.advertising.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("already advertising".to_string()));
        }

        let advertising = self.advertising.clone();
        tokio::spawn(async move {
            let daemon = match ServiceDaemon::new() {
                Ok(daemon) => daemon,
                Err(e) => {
                    warn!("failed to start mdns daemon: {e}");
                    advertising.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let host = format!("{id}.local.");
            let props = [(TXT_ID, id.as_str()), (TXT_USERNAME, username.as_str())];
            let service = ServiceInfo::new(SERVICE_TYPE, &id, &host, "", SERVICE_PORT, &props[..])
                .map(|service| service.enable_addr_auto());

            match service {
                Ok(service) => match daemon.register(service) {
                    Ok(()) => info!(%id, %username, "advertising on {SERVICE_TYPE}"),
                    Err(e) => warn!("failed to register service: {e}"),
                },
                Err(e) => warn!("failed to build service record: {e}"),
            }

            cancel.cancelled().await;
            let _ = daemon.shutdown();
            advertising.store(false, Ordering::SeqCst);
            info!("stopped advertising");
        });

        Ok(())
    }

    /// Run a bounded multicast query and fold the responses into the map
    ///
    /// Blocks the caller until `timeout` elapses. Records missing required
    /// fields and our own announcement are ignored; an empty result is a
    /// valid outcome, not a fault. Returns the post-refresh snapshot.
    pub async fn refresh(&self, timeout: Duration) -> Result<Vec<Peer>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Transport(format!("failed to start mdns daemon: {e}")))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Transport(format!("failed to browse {SERVICE_TYPE}: {e}")))?;

        // The daemon runs its own thread; drain its channel off the runtime
        let resolved = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let deadline = Instant::now() + timeout;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match receiver.recv_timeout(remaining) {
                    Ok(ServiceEvent::ServiceResolved(info)) => found.push(info),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let _ = daemon.stop_browse(SERVICE_TYPE);
            let _ = daemon.shutdown();
            found
        })
        .await
        .map_err(|_| Error::Transport("discovery query task failed".to_string()))?;

        let local_username = self
            .secrets
            .get_string(keys::USERNAME)
            .await
            .unwrap_or_default();

        let mut peers = self.peers.lock().await;
        for info in &resolved {
            if let Some(peer) = Peer::from_service_info(info, &local_username) {
                debug!(id = %peer.id, addr = %peer.addr, "peer resolved");
                peers.insert(info.get_fullname().to_string(), peer);
            }
        }

        Ok(peers.values().cloned().collect())
    }

    /// Most recent known peer for an identity id
    pub async fn get_peer(&self, id: &str) -> Option<Peer> {
        let peers = self.peers.lock().await;
        peers.values().find(|peer| peer.id == id).cloned()
    }

    /// Snapshot of all currently known peers
    pub async fn list_peers(&self) -> Vec<Peer> {
        let peers = self.peers.lock().await;
        peers.values().cloned().collect()
    }

    /// Record a peer directly, bypassing the network; used by tests
    #[cfg(test)]
    pub(crate) async fn insert_peer(&self, instance: &str, peer: Peer) {
        let mut peers = self.peers.lock().await;
        peers.insert(instance.to_string(), peer);
    }
}
