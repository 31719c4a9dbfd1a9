//! The key-value / pub-sub store contract the presence store and onboarding
//! aggregator are built on (spec §6): a Redis-shaped `set/get/sadd/srem/
//! scard/expire/publish/subscribe` surface.
//!
//! `sagamesh-redis` implements [`KvStore`] against a real Redis/Valkey
//! instance; [`InMemoryKvStore`] backs this crate's own tests.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// A boxed stream of published payloads, returned by [`KvStore::subscribe`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Errors returned by a [`KvStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The backing transport failed (connection lost, command error).
    #[error("kv store transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The presence store's dependency contract.
///
/// `sadd`+`expire` SHOULD be issued as a pipeline where the backend
/// supports one (reduces round trips; not required for correctness).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    /// Get the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Add `members` to the set at `key`.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), KvError>;

    /// Remove `member` from the set at `key`. A no-op if absent (makes
    /// at-least-once delivery of the removal safe).
    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// Cardinality of the set at `key` (0 if the key doesn't exist).
    async fn scard(&self, key: &str) -> Result<usize, KvError>;

    /// Reset the TTL on `key` without changing its value.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    /// Publish `payload` on `channel`. No delivery guarantee to absent
    /// subscribers (fire-and-forget, matching Redis pub/sub).
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), KvError>;

    /// Subscribe to `channel`, yielding a stream of published payloads.
    async fn subscribe(&self, channel: &str) -> Result<ByteStream, KvError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl SetEntry {
    fn new() -> Self {
        Self { members: HashSet::new(), expires_at: None }
    }
}

#[derive(Default)]
struct Store {
    values: HashMap<String, Entry>,
    sets: HashMap<String, SetEntry>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Store {
    /// Evicts `key` from `sets` if its TTL has passed, mirroring the
    /// lazy-on-read eviction `values` gets in [`InMemoryKvStore::get`].
    fn evict_expired_set(&mut self, key: &str) {
        let expired = self.sets.get(key).map(|set| set.expires_at.map(|at| Instant::now() >= at).unwrap_or(false));
        if expired == Some(true) {
            self.sets.remove(key);
        }
    }
}

/// An in-memory [`KvStore`] for tests. TTLs are enforced lazily on read:
/// an expired entry is treated as absent and lazily evicted.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<Store>>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(store: &mut Store, name: &str) -> broadcast::Sender<Vec<u8>> {
        store
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut store = self.inner.lock().unwrap();
        store.values.insert(key.to_string(), Entry { value, expires_at: Some(Instant::now() + ttl) });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut store = self.inner.lock().unwrap();
        if let Some(entry) = store.values.get(key) {
            if entry.expires_at.map(|at| Instant::now() >= at).unwrap_or(false) {
                store.values.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), KvError> {
        let mut store = self.inner.lock().unwrap();
        store.evict_expired_set(key);
        store.sets.entry(key.to_string()).or_insert_with(SetEntry::new).members.extend(members.iter().cloned());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut store = self.inner.lock().unwrap();
        store.evict_expired_set(key);
        if let Some(set) = store.sets.get_mut(key) {
            set.members.remove(member);
        }
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<usize, KvError> {
        let mut store = self.inner.lock().unwrap();
        store.evict_expired_set(key);
        Ok(store.sets.get(key).map(|set| set.members.len()).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut store = self.inner.lock().unwrap();
        if let Some(entry) = store.values.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        if let Some(set) = store.sets.get_mut(key) {
            set.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), KvError> {
        let mut store = self.inner.lock().unwrap();
        let sender = Self::channel(&mut store, channel);
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, KvError> {
        let mut store = self.inner.lock().unwrap();
        let sender = Self::channel(&mut store, channel);
        let rx = sender.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
