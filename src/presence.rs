//! Presence tracking: which gateway instance, if any, currently holds a
//! live SSE connection for a user (spec §6.1).
//!
//! Presence is a TTL'd record in the [`crate::kv::KvStore`], not a
//! process-local map: any router or gateway instance can answer "is this
//! user online, and where" by reading the store, and a crashed gateway's
//! entries expire on their own rather than requiring explicit cleanup.

use crate::kv::{KvError, KvStore};
use crate::telemetry::{emit_best_effort, NullSink, PolicyEvent, PresenceEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a presence record survives without being refreshed.
///
/// Refreshed on every gateway heartbeat; a stale record past this point
/// means the owning gateway died without sending `offline`.
pub const PRESENCE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn presence_key(user_id: &str) -> String {
    format!("user_presence:{user_id}")
}

/// Connectivity state recorded for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A user's last-known presence, as stored in the kv backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub status: PresenceStatus,
    /// The gateway instance holding the connection, if online.
    pub instance_id: String,
    /// Unix millis of the last state change.
    pub updated_at_millis: u64,
}

impl UserPresence {
    fn now_millis() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }

    fn online(instance_id: impl Into<String>) -> Self {
        Self { status: PresenceStatus::Online, instance_id: instance_id.into(), updated_at_millis: Self::now_millis() }
    }

    fn offline(instance_id: impl Into<String>) -> Self {
        Self { status: PresenceStatus::Offline, instance_id: instance_id.into(), updated_at_millis: Self::now_millis() }
    }
}

/// Errors a [`PresenceStore`] can return.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("stored presence record for user {0:?} is not valid json: {1}")]
    Corrupt(String, serde_json::Error),
}

/// Presence operations layered on a [`KvStore`], emitting
/// [`PolicyEvent::Presence`] telemetry through `sink` on every state change.
#[derive(Clone)]
pub struct PresenceStore<Sink = NullSink> {
    kv: Arc<dyn KvStore>,
    sink: Sink,
}

impl PresenceStore<NullSink> {
    /// Build a presence store over `kv`, with no telemetry sink.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, sink: NullSink }
    }
}

impl<Sink> PresenceStore<Sink>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    /// Replace this store's telemetry sink.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> PresenceStore<NewSink> {
        PresenceStore { kv: self.kv, sink }
    }

    /// Record that `user_id` is now connected to gateway `instance_id`.
    /// Resets the TTL.
    pub async fn mark_online(&self, user_id: &str, instance_id: &str) -> Result<(), PresenceError> {
        let record = UserPresence::online(instance_id);
        let encoded = serde_json::to_vec(&record).expect("UserPresence always serializes");
        self.kv.set(&presence_key(user_id), encoded, PRESENCE_TTL).await?;
        emit_best_effort(
            self.sink.clone(),
            PolicyEvent::Presence(PresenceEvent::MarkedOnline { instance_id: instance_id.to_string() }),
        )
        .await;
        Ok(())
    }

    /// Record that `user_id` disconnected from `instance_id`.
    ///
    /// Writes an `offline` record rather than deleting the key, so a
    /// concurrent reader sees the disconnect reason instead of a bare miss.
    pub async fn mark_offline(&self, user_id: &str, instance_id: &str) -> Result<(), PresenceError> {
        let record = UserPresence::offline(instance_id);
        let encoded = serde_json::to_vec(&record).expect("UserPresence always serializes");
        self.kv.set(&presence_key(user_id), encoded, PRESENCE_TTL).await?;
        emit_best_effort(self.sink.clone(), PolicyEvent::Presence(PresenceEvent::MarkedOffline)).await;
        Ok(())
    }

    /// The user's current presence record, if any.
    pub async fn get(&self, user_id: &str) -> Result<Option<UserPresence>, PresenceError> {
        let Some(bytes) = self.kv.get(&presence_key(user_id)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|err| PresenceError::Corrupt(user_id.to_string(), err))?;
        Ok(Some(record))
    }

    /// The gateway instance currently holding `user_id`'s connection, or
    /// `None` if the user is offline or has no record.
    pub async fn online_instance(&self, user_id: &str) -> Result<Option<String>, PresenceError> {
        Ok(self.get(user_id).await?.and_then(|presence| match presence.status {
            PresenceStatus::Online => Some(presence.instance_id),
            PresenceStatus::Offline => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn store() -> PresenceStore {
        PresenceStore::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn unknown_user_has_no_presence() {
        let store = store();
        assert_eq!(store.get("ghost").await.unwrap(), None);
        assert_eq!(store.online_instance("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mark_online_then_online_instance_returns_it() {
        let store = store();
        store.mark_online("u1", "gateway-a").await.unwrap();
        assert_eq!(store.online_instance("u1").await.unwrap(), Some("gateway-a".to_string()));
    }

    #[tokio::test]
    async fn mark_offline_clears_online_instance_but_keeps_the_record() {
        let store = store();
        store.mark_online("u1", "gateway-a").await.unwrap();
        store.mark_offline("u1", "gateway-a").await.unwrap();

        assert_eq!(store.online_instance("u1").await.unwrap(), None);
        let presence = store.get("u1").await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn reconnecting_on_a_new_instance_overwrites_the_old_one() {
        let store = store();
        store.mark_online("u1", "gateway-a").await.unwrap();
        store.mark_online("u1", "gateway-b").await.unwrap();
        assert_eq!(store.online_instance("u1").await.unwrap(), Some("gateway-b".to_string()));
    }

    #[tokio::test]
    async fn mark_online_and_offline_emit_presence_telemetry() {
        use crate::telemetry::MemorySink;

        let sink = MemorySink::new();
        let store = PresenceStore::new(Arc::new(InMemoryKvStore::new())).with_sink(sink.clone());

        store.mark_online("u1", "gateway-a").await.unwrap();
        store.mark_offline("u1", "gateway-a").await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            PolicyEvent::Presence(PresenceEvent::MarkedOnline { ref instance_id }) if instance_id == "gateway-a"
        ));
        assert!(matches!(events[1], PolicyEvent::Presence(PresenceEvent::MarkedOffline)));
    }
}
