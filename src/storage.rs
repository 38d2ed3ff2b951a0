//! Durable storage
//!
//! SQLite-backed records for the three persisted entities: the single local
//! Identity, one Contact per paired peer, and the append-only ChatMessage
//! log. Exposed as narrow create/find operations; the relational engine
//! itself is an implementation detail.

use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Public identity view, safe to hand to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Identity id
    pub id: String,
    /// Chosen username
    pub username: String,
}

/// The local node's identity, one row per installation
///
/// Both key halves are wrapped with the account password; nothing in this
/// row is usable without it.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Globally unique, time-sortable id
    pub id: String,
    /// Chosen username
    pub username: String,
    /// bcrypt hash of the account password
    pub password_hash: String,
    /// Password-wrapped P-256 private scalar
    pub priv_key: Vec<u8>,
    /// Password-wrapped SEC1 public key
    pub pub_key: Vec<u8>,
}

impl Identity {
    /// Public view of this identity
    pub fn profile(&self) -> Profile {
        Profile {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }
}

/// A paired peer, one row per successful pairing
#[derive(Debug, Clone)]
pub struct Contact {
    /// The peer's identity id
    pub id: String,
    /// The peer's username at pairing time
    pub username: String,
    /// Shared key wrapped with the local session password
    pub shared_key: Vec<u8>,
}

impl Contact {
    /// Public view of this contact, without key material
    pub fn profile(&self) -> Profile {
        Profile {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }
}

/// A persisted chat message; the payload is stored as ciphertext only
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Time-ordered unique id (UUIDv7, lexicographically sortable)
    pub id: String,
    /// Contact id the conversation belongs to
    pub peer_id: String,
    /// Identity id of the sender (local or remote)
    pub sender: String,
    /// AES-GCM ciphertext, nonce prefix included
    pub ciphertext: Vec<u8>,
    /// RFC 3339 creation timestamp
    pub created_at: String,
}

impl MessageRecord {
    /// Create a record for a freshly exchanged message
    pub fn new(peer_id: &str, sender: &str, ciphertext: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            peer_id: peer_id.to_string(),
            sender: sender.to_string(),
            ciphertext,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A decrypted message ready for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id
    pub id: String,
    /// Identity id of the sender
    pub sender: String,
    /// Decrypted plaintext
    pub message: String,
    /// RFC 3339 creation timestamp
    pub created_at: String,
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database at `path` and run migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                priv_key      BLOB NOT NULL,
                pub_key       BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS contacts (
                id         TEXT PRIMARY KEY,
                username   TEXT NOT NULL,
                shared_key BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id         TEXT PRIMARY KEY,
                peer_id    TEXT NOT NULL,
                sender     TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages (peer_id, id);",
        )?;
        Ok(())
    }

    /// Persist the local identity
    pub async fn create_identity(&self, identity: &Identity) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO identities (id, username, password_hash, priv_key, pub_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.id,
                identity.username,
                identity.password_hash,
                identity.priv_key,
                identity.pub_key
            ],
        )
        .map_err(map_constraint("identity already exists"))?;
        debug!(id = %identity.id, "identity created");
        Ok(())
    }

    /// Load the installation's identity, if one has been registered
    pub async fn find_identity(&self) -> Result<Option<Identity>> {
        let conn = self.conn.lock().await;
        let identity = conn
            .query_row(
                "SELECT id, username, password_hash, priv_key, pub_key FROM identities LIMIT 1",
                [],
                |row| {
                    Ok(Identity {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        priv_key: row.get(3)?,
                        pub_key: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    /// Persist a new contact
    ///
    /// The primary key on the contact id makes double pairing a storage-level
    /// conflict, which also settles the race when both ends initiate toward
    /// each other with the same code.
    pub async fn create_contact(&self, contact: &Contact) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO contacts (id, username, shared_key) VALUES (?1, ?2, ?3)",
            params![contact.id, contact.username, contact.shared_key],
        )
        .map_err(map_constraint("contact already paired"))?;
        debug!(id = %contact.id, "contact created");
        Ok(())
    }

    /// Look up a contact by peer id
    pub async fn find_contact(&self, id: &str) -> Result<Option<Contact>> {
        let conn = self.conn.lock().await;
        let contact = conn
            .query_row(
                "SELECT id, username, shared_key FROM contacts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Contact {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        shared_key: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(contact)
    }

    /// List all paired contacts, without key material
    pub async fn list_contacts(&self) -> Result<Vec<Profile>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, username FROM contacts ORDER BY username")?;
        let rows = stmt.query_map([], |row| {
            Ok(Profile {
                id: row.get(0)?,
                username: row.get(1)?,
            })
        })?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    /// Append a message to the log
    pub async fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (id, peer_id, sender, ciphertext, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.peer_id,
                message.sender,
                message.ciphertext,
                message.created_at
            ],
        )?;
        Ok(())
    }

    /// Page through a conversation, newest first
    ///
    /// `cursor` is an exclusive upper bound on the message id; UUIDv7 ids
    /// sort by creation time, so `id < cursor` walks backwards in history.
    pub async fn messages_for_peer(
        &self,
        peer_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, peer_id, sender, ciphertext, created_at FROM messages
             WHERE peer_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![peer_id, cursor, limit], |row| {
            Ok(MessageRecord {
                id: row.get(0)?,
                peer_id: row.get(1)?,
                sender: row.get(2)?,
                ciphertext: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

/// Translate a SQLite uniqueness violation into a Conflict, leaving other
/// database failures as Persistence errors
fn map_constraint(what: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| match e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(what.to_string())
        }
        other => Error::Persistence(other.to_string()),
    }
}
