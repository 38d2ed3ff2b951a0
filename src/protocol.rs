//! Wire protocol
//!
//! JSON bodies for the two peer-to-peer endpoints (pairing and chat), plus
//! the fixed vocabulary of machine-readable pairing failure reasons and its
//! mapping to and from the crate error taxonomy.

use crate::Error;
use serde::{Deserialize, Serialize};

/// Pairing request sent by the initiator to `POST /api/user/pair`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairRequest {
    /// Initiator's identity id
    pub id: String,
    /// Initiator's username
    pub username: String,
    /// Hex SHA-256 of the pairing code
    pub code_hash: String,
    /// Base64 of the initiator's public key, wrapped with the pairing code
    pub pubkey: String,
}

/// Successful pairing response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairResponse {
    /// Base64 of the responder's public key, wrapped with the pairing code
    pub pubkey: String,
}

/// Pairing failure body with a machine-readable reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairError {
    /// Why the pairing was rejected
    pub error: PairReason,
}

/// Fixed vocabulary of remote pairing failure reasons
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PairReason {
    /// No pairing code is currently live on the responder
    CodeNotLive,
    /// The submitted code hash did not match the live code
    WrongCode,
    /// A contact for the initiator's id already exists
    AlreadyPaired,
    /// The wrapped public key could not be unwrapped or parsed
    BadKey,
    /// Any other responder-side failure
    Internal,
}

impl PairReason {
    /// Classify a responder-side error for the wire
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => PairReason::CodeNotLive,
            Error::Unauthorized(_) => PairReason::WrongCode,
            Error::Conflict(_) => PairReason::AlreadyPaired,
            Error::Crypto(_) => PairReason::BadKey,
            _ => PairReason::Internal,
        }
    }

    /// Map a remote reason back to the local failure kind
    pub fn into_error(self) -> Error {
        match self {
            PairReason::CodeNotLive => Error::NotFound("pairing code not live".to_string()),
            PairReason::WrongCode => Error::Unauthorized("wrong pairing code".to_string()),
            PairReason::AlreadyPaired => Error::Conflict("already paired".to_string()),
            PairReason::BadKey => Error::Crypto("peer rejected public key".to_string()),
            PairReason::Internal => Error::Transport("peer internal error".to_string()),
        }
    }
}

/// Chat envelope sent to `POST /api/chat/send`
///
/// Only `message` is protected: it is the base64 of the AES-GCM ciphertext.
/// The envelope itself travels over plain HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEnvelope {
    /// Sender's identity id
    pub sender: String,
    /// Base64 of the encrypted message
    pub message: String,
}

/// Acknowledgment body for an accepted chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    /// Fixed status string
    pub status: String,
}

impl Ack {
    /// The acknowledgment for a received message
    pub fn received() -> Self {
        Self {
            status: "received".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_reason_wire_names() {
        let json = serde_json::to_string(&PairError {
            error: PairReason::CodeNotLive,
        })
        .unwrap();
        assert_eq!(json, r#"{"error":"code-not-live"}"#);

        let parsed: PairError = serde_json::from_str(r#"{"error":"already-paired"}"#).unwrap();
        assert_eq!(parsed.error, PairReason::AlreadyPaired);
    }

    #[test]
    fn test_reason_error_mapping_is_symmetric() {
        for reason in [
            PairReason::CodeNotLive,
            PairReason::WrongCode,
            PairReason::AlreadyPaired,
            PairReason::BadKey,
        ] {
            assert_eq!(PairReason::from_error(&reason.into_error()), reason);
        }
    }

    #[test]
    fn test_unrecognized_reason_is_rejected() {
        let parsed = serde_json::from_str::<PairError>(r#"{"error":"whatever"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_chat_envelope_fields() {
        let envelope = ChatEnvelope {
            sender: "peer-1".to_string(),
            message: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""sender":"peer-1""#));
        assert!(json.contains(r#""message":"aGVsbG8=""#));
    }
}
