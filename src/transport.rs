//! Encrypted message transport
//!
//! Outbound: encrypt under the per-contact shared key, POST the envelope to
//! the peer's chat endpoint, and persist only after the peer acknowledges.
//! Inbound: a plain-HTTP/1 listener serving the chat and pairing endpoints;
//! confidentiality lives entirely in the AES-GCM payload, not the channel.

use crate::discovery::DiscoveryRegistry;
use crate::events::{Event, EventBus};
use crate::pairing::PairingCoordinator;
use crate::protocol::{Ack, ChatEnvelope, PairError, PairReason, PairRequest};
use crate::secrets::{keys, SecretStore};
use crate::storage::{ChatMessage, MessageRecord, Storage};
use crate::{crypto, Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sends, receives, and replays encrypted chat messages
#[derive(Clone)]
pub struct MessageTransport {
    secrets: SecretStore,
    storage: Storage,
    discovery: DiscoveryRegistry,
    events: EventBus,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl MessageTransport {
    /// Wire up a transport over the shared session components
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

    /// Encrypt and deliver a message to a paired contact
    ///
    /// Fails before touching the network if the peer is not currently
    /// discovered. Delivery is best-effort with no retry; the message is
    /// persisted only after the peer acknowledges, so an undelivered
    /// message never appears in history.
    pub async fn send(&self, contact_id: &str, plaintext: &str) -> Result<ChatMessage> {
        let peer = self
            .discovery
            .get_peer(contact_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("peer {contact_id} not reachable")))?;
        let key = self.resolve_shared_key(contact_id).await?;
        let sender = self
            .secrets
            .get_string(keys::USER_ID)
            .await
            .ok_or_else(|| Error::NotFound("not logged in".to_string()))?;

        let ciphertext = crypto::encrypt(&key, plaintext.as_bytes())?;
        let envelope = ChatEnvelope {
            sender: sender.clone(),
            message: BASE64.encode(&ciphertext),
        };

        let uri: hyper::Uri = format!("http://{}/api/chat/send", peer.addr)
            .parse()
            .map_err(|_| Error::Transport("invalid peer address".to_string()))?;
        let body = serde_json::to_vec(&envelope)?;
        let request = Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Transport(format!("delivery failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "peer rejected message: {}",
                response.status()
            )));
        }

        let record = MessageRecord::new(contact_id, &sender, ciphertext);
        self.storage.insert_message(&record).await?;
        debug!(peer = %contact_id, id = %record.id, "message delivered");

        let message = ChatMessage {
            id: record.id,
            sender,
            message: plaintext.to_string(),
            created_at: record.created_at,
        };
        self.events.emit(Event::MessageSent {
            peer_id: contact_id.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Validate, decrypt, and persist an inbound envelope
    ///
    /// Envelopes from senders we never paired with are rejected before any
    /// crypto runs.
    pub(crate) async fn accept_envelope(&self, envelope: ChatEnvelope) -> Result<ChatMessage> {
        let contact = self
            .storage
            .find_contact(&envelope.sender)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown sender {}", envelope.sender)))?;
        let key = self.resolve_shared_key(&contact.id).await?;

        let ciphertext = BASE64
            .decode(&envelope.message)
            .map_err(|_| Error::Validation("message is not valid base64".to_string()))?;
        let plaintext = crypto::decrypt(&key, &ciphertext)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| Error::Validation("message is not valid UTF-8".to_string()))?;

        let record = MessageRecord::new(&contact.id, &contact.id, ciphertext);
        self.storage.insert_message(&record).await?;
        debug!(peer = %contact.id, id = %record.id, "message received");

        let message = ChatMessage {
            id: record.id,
            sender: contact.id.clone(),
            message: text,
            created_at: record.created_at,
        };
        self.events.emit(Event::MessageReceived {
            peer_id: contact.id,
            message: message.clone(),
        });
        Ok(message)
    }

    /// Decrypt a page of conversation history, newest first
    ///
    /// `cursor` is the id of the oldest message from the previous page; pass
    /// `None` for the newest page.
    pub async fn messages(
        &self,
        peer_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let key = self.resolve_shared_key(peer_id).await?;
        let records = self.storage.messages_for_peer(peer_id, cursor, limit).await?;

        records
            .into_iter()
            .map(|record| {
                let plaintext = crypto::decrypt(&key, &record.ciphertext)?;
                let text = String::from_utf8(plaintext)
                    .map_err(|_| Error::Validation("stored message is not UTF-8".to_string()))?;
                Ok(ChatMessage {
                    id: record.id,
                    sender: record.sender,
                    message: text,
                    created_at: record.created_at,
                })
            })
            .collect()
    }

    /// The contact's shared key, from cache or unwrapped from storage
    async fn resolve_shared_key(&self, contact_id: &str) -> Result<Vec<u8>> {
        if let Some(key) = self.secrets.get(&keys::shared(contact_id)).await {
            return Ok(key);
        }

        let contact = self
            .storage
            .find_contact(contact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no contact {contact_id}")))?;
        let password = self
            .secrets
            .get(keys::PASSWORD)
            .await
            .ok_or_else(|| Error::NotFound("not logged in".to_string()))?;

        let key = crypto::unwrap_with_password(&password, &contact.shared_key)?;
        self.secrets.set(keys::shared(contact_id), key.clone()).await;
        Ok(key)
    }

    /// Bind the inbound listener and serve until the token is canceled
    ///
    /// Returns the bound address; with port 0 this is how tests learn the
    /// ephemeral port. Each connection is served on its own task.
    pub async fn start(
        &self,
        addr: SocketAddr,
        pairing: PairingCoordinator,
        cancel: CancellationToken,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(addr = %local, "transport listening");

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("transport stopped");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, remote) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        debug!(%remote, "connection accepted");

                        let io = TokioIo::new(stream);
                        let transport = transport.clone();
                        let pairing = pairing.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let transport = transport.clone();
                                let pairing = pairing.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        handle_request(req, transport, pairing).await,
                                    )
                                }
                            });
                            if let Err(e) =
                                http1::Builder::new().serve_connection(io, service).await
                            {
                                debug!("connection error: {e}");
                            }
                        });
                    }
                }
            }
        });

        Ok(local)
    }
}

/// Route one inbound request to the chat or pairing handler
async fn handle_request(
    req: Request<Incoming>,
    transport: MessageTransport,
    pairing: PairingCoordinator,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unreadable body"),
    };

    match (method, path.as_str()) {
        (Method::POST, "/api/chat/send") => {
            let envelope: ChatEnvelope = match serde_json::from_slice(&body) {
                Ok(envelope) => envelope,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed envelope"),
            };
            match transport.accept_envelope(envelope).await {
                Ok(_) => json_response(StatusCode::OK, &Ack::received()),
                Err(e) => {
                    warn!("rejected inbound message: {e}");
                    error_response(status_for(&e), &e.to_string())
                }
            }
        }
        (Method::POST, "/api/user/pair") => {
            let request: PairRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed request"),
            };
            match pairing.handle_pairing_request(request).await {
                Ok(accepted) => json_response(StatusCode::OK, &accepted),
                Err(e) => {
                    warn!("rejected pairing request: {e}");
                    json_response(
                        status_for(&e),
                        &PairError {
                            error: PairReason::from_error(&e),
                        },
                    )
                }
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Crypto(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}
