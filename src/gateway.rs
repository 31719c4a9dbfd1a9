//! Transport-agnostic targeted delivery: map a user id to whichever local
//! connection is currently serving it, and route events there (spec §6.3).
//!
//! This module knows nothing about SSE, HTTP, or `axum` — it's the part of
//! the gateway that's the same regardless of wire protocol. `sagamesh-gateway`
//! pairs a [`ClientRegistry`] with an `axum::response::sse::Sse` endpoint and
//! the [`crate::presence::PresenceStore`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Channel capacity for a single user's local delivery queue. A slow or
/// stalled SSE writer drops further events rather than applying backpressure
/// to the gateway's pub/sub listener.
pub const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// An event addressed to one user, ready to be serialized onto whatever
/// wire format the transport uses. This is also the payload published on
/// `gateway_events:<instance_id>`, so it round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetedEvent {
    pub user_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_context: Option<String>,
}

impl TargetedEvent {
    /// Build an event with no trace context attached.
    pub fn new(user_id: impl Into<String>, event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { user_id: user_id.into(), event_type: event_type.into(), payload: payload.into(), trace_context: None }
    }

    /// Attach a trace context carrier, propagated from the event's origin.
    pub fn with_trace_context(mut self, trace_context: impl Into<String>) -> Self {
        self.trace_context = Some(trace_context.into());
        self
    }
}

/// Errors from [`ClientRegistry::send`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No connection (on this instance) is registered for the user.
    #[error("no connected client for user {0:?}")]
    NotConnected(String),
}

/// Tracks the live local connection for each connected user and routes
/// [`TargetedEvent`]s to it.
///
/// One registry per gateway instance/process: a user connected to a
/// different instance is simply absent here, even though
/// [`crate::presence::PresenceStore`] knows they're online elsewhere.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<HashMap<String, mpsc::Sender<TargetedEvent>>>>,
}

impl ClientRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user_id`, returning the receiving end
    /// the transport layer should drain. Replaces any prior registration for
    /// the same user (e.g. a reconnect on this instance). The channel is
    /// bounded at [`CLIENT_CHANNEL_CAPACITY`]: a stalled reader sheds events
    /// rather than backpressuring the broadcaster.
    pub fn register(&self, user_id: impl Into<String>) -> mpsc::Receiver<TargetedEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        self.clients.lock().unwrap().insert(user_id.into(), tx);
        rx
    }

    /// Remove `user_id`'s registration. Idempotent.
    pub fn unregister(&self, user_id: &str) {
        self.clients.lock().unwrap().remove(user_id);
    }

    /// Whether `user_id` has a live registration on this instance.
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.lock().unwrap().contains_key(user_id)
    }

    /// Route `event` to its addressee's connection.
    ///
    /// Returns [`GatewayError::NotConnected`] both when the user was never
    /// registered and when their channel's receiver was already dropped
    /// (the connection closed without calling [`Self::unregister`]).
    pub fn send(&self, event: TargetedEvent) -> Result<(), GatewayError> {
        let clients = self.clients.lock().unwrap();
        let sender = clients
            .get(&event.user_id)
            .ok_or_else(|| GatewayError::NotConnected(event.user_id.clone()))?;
        sender.try_send(event.clone()).map_err(|_| GatewayError::NotConnected(event.user_id))
    }

    /// Route `event` to its addressee's connection, the way the pub/sub
    /// fanout listener does: an absent user is an expected race (debug log,
    /// drop); a full channel means the reader has stalled (warn, drop).
    /// Never fails the caller — there is no one to report the error to.
    pub fn broadcast(&self, event: TargetedEvent) {
        let clients = self.clients.lock().unwrap();
        let Some(sender) = clients.get(&event.user_id) else {
            tracing::debug!(user_id = %event.user_id, "no local connection for targeted event");
            return;
        };
        if sender.try_send(event.clone()).is_err() {
            tracing::warn!(user_id = %event.user_id, "client channel full or closed; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_unregistered_user_errors() {
        let registry = ClientRegistry::new();
        let err = registry.send(TargetedEvent::new("u1", "registration_completed", b"{}".to_vec()));
        assert_eq!(err, Err(GatewayError::NotConnected("u1".to_string())));
    }

    #[test]
    fn registered_user_receives_sent_event() {
        let registry = ClientRegistry::new();
        let mut rx = registry.register("u1");
        registry.send(TargetedEvent::new("u1", "registration_completed", b"{}".to_vec())).unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.user_id, "u1");
        assert_eq!(received.event_type, "registration_completed");
    }

    #[test]
    fn unregister_makes_the_user_unreachable() {
        let registry = ClientRegistry::new();
        let _rx = registry.register("u1");
        registry.unregister("u1");
        assert!(!registry.is_connected("u1"));
        assert!(registry.send(TargetedEvent::new("u1", "x", b"{}".to_vec())).is_err());
    }

    #[test]
    fn re_registering_replaces_the_prior_connection() {
        let registry = ClientRegistry::new();
        let rx_old = registry.register("u1");
        let mut rx_new = registry.register("u1");

        registry.send(TargetedEvent::new("u1", "x", b"{}".to_vec())).unwrap();
        assert!(rx_new.try_recv().is_ok());
        drop(rx_old);
    }
}
