//! Shared state for a single gateway instance process.

use crate::auth::SseAuthenticator;
use sagamesh::gateway::ClientRegistry;
use sagamesh::kv::KvStore;
use sagamesh::presence::PresenceStore;
use std::sync::Arc;

/// Everything the SSE endpoint and the fanout listener need, shared across
/// every connection this process serves.
pub struct GatewayState {
    pub registry: ClientRegistry,
    pub presence: PresenceStore,
    /// Kept alongside `presence` so the fanout listener can subscribe
    /// directly without `PresenceStore` needing to expose its backend.
    pub kv: Arc<dyn KvStore>,
    pub authenticator: Arc<dyn SseAuthenticator>,
    /// This process's identity, as used in presence records and its
    /// `gateway_events:<instance_id>` fanout channel.
    pub instance_id: String,
}

impl GatewayState {
    /// Build state for a gateway instance identified by `instance_id`.
    pub fn new(kv: Arc<dyn KvStore>, authenticator: Arc<dyn SseAuthenticator>, instance_id: impl Into<String>) -> Self {
        Self {
            registry: ClientRegistry::new(),
            presence: PresenceStore::new(kv.clone()),
            kv,
            authenticator,
            instance_id: instance_id.into(),
        }
    }

    /// The channel this instance's fanout listener subscribes to.
    pub fn fanout_channel(&self) -> String {
        fanout_channel(&self.instance_id)
    }
}

/// The pub/sub channel a given gateway instance listens on for targeted
/// events addressed to its locally-connected users.
pub fn fanout_channel(instance_id: &str) -> String {
    format!("gateway_events:{instance_id}")
}
