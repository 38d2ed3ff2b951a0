//! Lanchat - serverless encrypted chat for local networks
//!
//! This library provides the protocol core for Lanchat: peers discover each
//! other over multicast DNS, establish a per-contact shared secret through a
//! short-lived pairing code, and exchange end-to-end-encrypted messages over
//! plain HTTP with only the payload encrypted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crypto;
pub mod discovery;
pub mod events;
pub mod pairing;
pub mod protocol;
pub mod secrets;
pub mod session;
pub mod storage;
pub mod transport;

/// Result type alias for Lanchat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Lanchat operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A peer, contact, pairing code, identity, or secret is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Wrong password or pairing code
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Duplicate pairing or registration
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed key, or decryption/authentication failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network failure or timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed external input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage-layer fault
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Initialize the Lanchat library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}
