//! Local key-value store with refresh and expire discipline.
//!
//! Every entry carries two independent deadlines: `refresh_at`, after which
//! the owner is prompted to republish the pair into the network, and
//! `expire_at`, after which the entry is dropped entirely. The store does not
//! own a clock task; the node's maintenance driver calls
//! [`LocalStore::sweep_expired`] and republishes
//! [`LocalStore::keys_due_for_refresh`] on a periodic tick.
//!
//! All operations are linearizable: the store is held behind a single mutex
//! by its owner and every method completes without blocking.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::NodeId;

/// Seconds after which a stored key is due for republication.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Time-to-live of a key/value pair from its most recent store.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(86_410);

/// Interval after which the original publisher must republish a pair.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(86_400);

/// Interval between replication events of the whole local database.
pub const REPLICATE_INTERVAL: Duration = Duration::from_secs(3600);

/// One stored pair plus its lifecycle deadlines.
#[derive(Clone, Debug)]
pub(crate) struct StoredEntry {
    pub value: Vec<u8>,
    pub refresh_at: Instant,
    pub expire_at: Instant,
    /// True when this node published the pair itself, false when it arrived
    /// over the wire from another node.
    pub publisher: bool,
}

/// In-memory map of key → entry. Owned behind the node's store mutex.
#[derive(Default)]
pub struct LocalStore {
    entries: HashMap<NodeId, StoredEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Inserts or overwrites the entry for `key`.
    ///
    /// The refresh deadline is always reset to now + [`REFRESH_INTERVAL`];
    /// the expire deadline is taken as given by the caller (the listener
    /// path uses now + [`EXPIRE_INTERVAL`]).
    pub fn store(&mut self, key: NodeId, value: Vec<u8>, expire_at: Instant, publisher: bool) {
        let refresh_at = Instant::now() + REFRESH_INTERVAL;
        debug!(
            key = %hex::encode(&key.as_bytes()[..8]),
            len = value.len(),
            publisher,
            "storing entry"
        );
        self.entries.insert(
            key,
            StoredEntry {
                value,
                refresh_at: refresh_at.min(expire_at),
                expire_at,
                publisher,
            },
        );
    }

    /// Returns the stored value, or None when the key is absent.
    pub fn retrieve(&self, key: &NodeId) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Removes the entry locally. Never emits network traffic.
    pub fn delete(&mut self, key: &NodeId) {
        self.entries.remove(key);
    }

    /// Every key whose refresh deadline has passed.
    pub fn keys_due_for_refresh(&self) -> Vec<NodeId> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.refresh_at <= now)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Pushes the refresh deadline of `key` out by [`REFRESH_INTERVAL`]
    /// without disturbing its expiry, after a successful republication.
    pub fn mark_refreshed(&mut self, key: &NodeId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refresh_at = (Instant::now() + REFRESH_INTERVAL).min(entry.expire_at);
        }
    }

    /// Drops every entry whose expiry has passed; returns how many.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if entry.expire_at <= now {
                trace!(
                    key = %hex::encode(&key.as_bytes()[..8]),
                    publisher = entry.publisher,
                    "entry expired"
                );
                false
            } else {
                true
            }
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired entries");
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, key: &NodeId) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_key(seed: u8) -> NodeId {
        let mut bytes = [0u8; crate::identity::ID_BYTES];
        bytes[0] = seed;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn store_and_retrieve() {
        let mut store = LocalStore::new();
        let key = make_key(1);

        store.store(key, b"value".to_vec(), Instant::now() + EXPIRE_INTERVAL, true);
        assert_eq!(store.retrieve(&key), Some(b"value".to_vec()));
        assert!(store.entry(&key).unwrap().publisher);
    }

    #[test]
    fn store_overwrites_prior_entry() {
        let mut store = LocalStore::new();
        let key = make_key(1);
        let expire = Instant::now() + EXPIRE_INTERVAL;

        store.store(key, b"first".to_vec(), expire, true);
        store.store(key, b"second".to_vec(), expire, false);

        assert_eq!(store.retrieve(&key), Some(b"second".to_vec()));
        assert!(!store.entry(&key).unwrap().publisher);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_is_local_only() {
        let mut store = LocalStore::new();
        let key = make_key(1);

        store.store(key, b"value".to_vec(), Instant::now() + EXPIRE_INTERVAL, true);
        store.delete(&key);
        assert_eq!(store.retrieve(&key), None);
    }

    #[test]
    fn missing_key_returns_none() {
        let store = LocalStore::new();
        assert_eq!(store.retrieve(&make_key(9)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_exactly_the_expired() {
        let mut store = LocalStore::new();
        let short = make_key(1);
        let long = make_key(2);

        store.store(short, b"short".to_vec(), Instant::now() + Duration::from_secs(1), false);
        store.store(long, b"long".to_vec(), Instant::now() + EXPIRE_INTERVAL, false);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep_expired(), 1);

        assert_eq!(store.retrieve(&short), None);
        assert_eq!(store.retrieve(&long), Some(b"long".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn retrieval_survives_until_sweep() {
        let mut store = LocalStore::new();
        let key = make_key(1);

        store.store(key, b"v".to_vec(), Instant::now() + Duration::from_secs(1), false);
        tokio::time::advance(Duration::from_secs(2)).await;

        // Expiry is enforced by the sweep, not by retrieve.
        assert_eq!(store.retrieve(&key), Some(b"v".to_vec()));
        store.sweep_expired();
        assert_eq!(store.retrieve(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_deadline_tracks_the_clock() {
        let mut store = LocalStore::new();
        let key = make_key(1);
        store.store(key, b"v".to_vec(), Instant::now() + EXPIRE_INTERVAL, true);

        assert!(store.keys_due_for_refresh().is_empty());

        tokio::time::advance(REFRESH_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(store.keys_due_for_refresh(), vec![key]);

        store.mark_refreshed(&key);
        assert!(store.keys_due_for_refresh().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_never_outlives_expiry() {
        let mut store = LocalStore::new();
        let key = make_key(1);

        // Entry expires before the normal refresh interval elapses.
        store.store(key, b"v".to_vec(), Instant::now() + Duration::from_secs(60), false);
        let entry = store.entry(&key).unwrap();
        assert!(entry.refresh_at <= entry.expire_at);
    }
}
