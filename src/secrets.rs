//! In-memory secret store
//!
//! A mutex-guarded key/value cache for session secrets: the session
//! password, the unwrapped public key, cached per-contact shared keys, and
//! the transient pairing code. Entries may carry an expiry; expiration is a
//! cancelable timed task per entry, not a polling sweep. Deleted values are
//! zeroized before removal so secrets do not linger in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;
use zeroize::Zeroize;

/// Reserved keys used by the pairing, discovery, and transport paths
pub mod keys {
    /// Local identity id, seeded at login
    pub const USER_ID: &str = "user:id";
    /// Local username, seeded at login
    pub const USERNAME: &str = "user:username";
    /// Session password, seeded at login
    pub const PASSWORD: &str = "user:password";
    /// Unwrapped local public key, seeded at login
    pub const PUBLIC_KEY: &str = "key:public";
    /// The currently live pairing code (60-second TTL)
    pub const PAIRING_CODE: &str = "pairing:code";

    /// Cache key for a contact's raw shared key
    pub fn shared(contact_id: &str) -> String {
        format!("key:shared:{contact_id}")
    }
}

struct Entry {
    value: Vec<u8>,
    /// Monotonic generation stamp; an expiry timer only deletes the entry
    /// if its captured generation still matches, so a stale timer can never
    /// remove a newer value.
    generation: u64,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

impl Inner {
    fn remove_entry(&mut self, key: &str) {
        if let Some(mut entry) = self.entries.remove(key) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.value.zeroize();
        }
    }
}

/// Concurrent in-process secret cache with optional per-entry expiration
#[derive(Clone, Default)]
pub struct SecretStore {
    inner: Arc<Mutex<Inner>>,
}

impl SecretStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, canceling any pending expiration for `key`
    pub async fn set(&self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        let mut inner = self.inner.lock().await;
        inner.remove_entry(&key);
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.entries.insert(
            key,
            Entry {
                value,
                generation,
                timer: None,
            },
        );
    }

    /// Store a value that self-deletes after `ttl` unless overwritten or
    /// deleted first
    ///
    /// Re-setting the same key restarts the timer; the previous timer is
    /// aborted under the lock, so cancellation is immediate and race-free.
    pub async fn set_with_expiry(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock().await;
        inner.remove_entry(&key);
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let store = self.inner.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut inner = store.lock().await;
            let expired = inner
                .entries
                .get(&timer_key)
                .is_some_and(|entry| entry.generation == generation);
            if expired {
                debug!(key = %timer_key, "secret expired");
                inner.remove_entry(&timer_key);
            }
        });

        inner.entries.insert(
            key,
            Entry {
                value,
                generation,
                timer: Some(timer.abort_handle()),
            },
        );
    }

    /// Fetch a copy of the value for `key`, if present
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Fetch the value for `key` as a UTF-8 string, if present and valid
    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).await.and_then(|v| String::from_utf8(v).ok())
    }

    /// Delete `key`, zeroizing the backing bytes and canceling any pending
    /// expiration
    pub async fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.remove_entry(key);
    }

    /// Delete every key; invoked on session end
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let all: Vec<String> = inner.entries.keys().cloned().collect();
        for key in all {
            inner.remove_entry(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = SecretStore::new();
        store.set("a", b"value".to_vec()).await;

        assert_eq!(store.get("a").await, Some(b"value".to_vec()));
        assert_eq!(store.get_string("a").await, Some("value".to_string()));
        assert_eq!(store.get("missing").await, None);

        store.delete("a").await;
        assert_eq!(store.get("a").await, None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = SecretStore::new();
        store.set("a", b"one".to_vec()).await;
        store.set("a", b"two".to_vec()).await;
        assert_eq!(store.get("a").await, Some(b"two".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_deletes_entry() {
        let store = SecretStore::new();
        store
            .set_with_expiry("code", b"123456".to_vec(), Duration::from_millis(50))
            .await;

        assert_eq!(store.get("code").await, Some(b"123456".to_vec()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("code").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_set_cancels_expiry() {
        let store = SecretStore::new();
        store
            .set_with_expiry("k", b"short-lived".to_vec(), Duration::from_millis(50))
            .await;
        store.set("k", b"permanent".to_vec()).await;

        // The old timer must not fire against the new value
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get("k").await, Some(b"permanent".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_with_ttl_restarts_timer() {
        let store = SecretStore::new();
        store
            .set_with_expiry("k", b"first".to_vec(), Duration::from_millis(50))
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .set_with_expiry("k", b"second".to_vec(), Duration::from_millis(50))
            .await;

        // Past the first deadline but not the restarted one
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, Some(b"second".to_vec()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_expiry() {
        let store = SecretStore::new();
        store
            .set_with_expiry("k", b"v".to_vec(), Duration::from_millis(50))
            .await;
        store.delete("k").await;
        store.set("k", b"new".to_vec()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("k").await, Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let store = SecretStore::new();
        store.set(keys::PASSWORD, b"pw".to_vec()).await;
        store.set(keys::shared("peer-1"), b"key".to_vec()).await;
        store
            .set_with_expiry(keys::PAIRING_CODE, b"482913".to_vec(), Duration::from_secs(60))
            .await;

        store.clear().await;

        assert_eq!(store.get(keys::PASSWORD).await, None);
        assert_eq!(store.get(&keys::shared("peer-1")).await, None);
        assert_eq!(store.get(keys::PAIRING_CODE).await, None);
    }
}
