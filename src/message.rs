//! The wire envelope carried through the router's middleware chain, and the
//! cancellation handle threaded through every suspension point it crosses.

use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Well-known topic names from the onboarding wire contract.
pub mod topics {
    pub const USER_CREATED: &str = "user_created";
    pub const USER_SYNCED_POST: &str = "user_synced_post";
    pub const USER_SYNCED_SOCIAL: &str = "user_synced_social";
    pub const USER_SYNCED_SEARCH: &str = "user_synced_search";
    pub const USER_SYNCED_MESSAGING: &str = "user_synced_messaging";
    pub const USER_CREATION_FAILED: &str = "user_creation_failed";
    pub const DEAD_LETTERS: &str = "dead_letters";

    /// The `user_synced_<svc>` topic for a given service tag.
    pub fn user_synced(service: &str) -> String {
        format!("user_synced_{service}")
    }
}

/// Metadata key carrying the subject user id, present on every onboarding
/// event so failure paths can extract it without re-parsing the payload.
pub const META_USER_ID: &str = "user_id";
/// Metadata key the poison middleware attaches: why the message died.
pub const META_ERROR_REASON: &str = "_error_reason";
/// Metadata key the poison middleware attaches: where the message came from.
pub const META_SOURCE_TOPIC: &str = "_source_topic";
/// Metadata key carrying an injected trace context (W3C traceparent-shaped).
pub const META_TRACE_CONTEXT: &str = "_trace_context";

/// The envelope passed between a subscriber and the router's middleware
/// chain.
///
/// `metadata` carries `user_id`, trace context, and (for dead letters) the
/// original topic and failure reason. `payload` is opaque bytes; for the
/// onboarding events in this crate that's JSON, but the router never parses
/// it itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uuid: Uuid,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// Build a message with a fresh uuid.
    pub fn new(payload: impl Into<Vec<u8>>, metadata: HashMap<String, String>) -> Self {
        Self { uuid: Uuid::new_v4(), payload: payload.into(), metadata }
    }

    /// Build a message with an explicit uuid, for redelivery or tests that
    /// need to assert correlation with an originating message.
    pub fn with_uuid(
        uuid: Uuid,
        payload: impl Into<Vec<u8>>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self { uuid, payload: payload.into(), metadata }
    }

    /// Convenience accessor for the `user_id` metadata key.
    pub fn user_id(&self) -> Option<&str> {
        self.metadata.get(META_USER_ID).map(String::as_str)
    }

    /// Convenience accessor for the injected trace context, if any.
    pub fn trace_context(&self) -> Option<&str> {
        self.metadata.get(META_TRACE_CONTEXT).map(String::as_str)
    }

    /// Returns a copy of this message with `key` set to `value` in its
    /// metadata, overwriting any existing entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A cancellation handle shared by every message in flight, so that retry
/// sleeps, circuit-breaker admission, and consumer loops can all observe
/// host shutdown at their next suspension point.
///
/// Mirrors the `Sleeper`/`Clock` test-seam pattern: a thin trait-free wrapper
/// over `tokio::sync::watch<bool>` rather than depending on a particular
/// cancellation-token crate.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

/// The writer half of a [`ShutdownSignal`]; held by the process that owns
/// the router's lifecycle.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Create a linked handle/signal pair, initially not shut down.
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), ShutdownSignal(rx))
    }

    /// Signal shutdown to every clone of the paired [`ShutdownSignal`].
    ///
    /// Idempotent: calling this more than once is harmless.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}

impl Default for ShutdownSignal {
    /// A signal that is never triggered (its paired handle is dropped
    /// immediately). Useful for tests and examples that don't exercise
    /// shutdown.
    fn default() -> Self {
        ShutdownHandle::new().1
    }
}

impl ShutdownSignal {
    /// True if shutdown has already been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is signaled. Safe to call from multiple
    /// clones and multiple times on the same clone.
    pub async fn cancelled(&mut self) {
        if self.is_shutdown() {
            return;
        }
        while self.0.changed().await.is_ok() {
            if *self.0.borrow() {
                return;
            }
        }
    }
}

/// Per-message context: a cancellation handle plus the trace carrier lifted
/// out of metadata, threaded alongside the handler so middleware layers
/// don't need to re-parse `Message::metadata` for it.
#[derive(Debug, Clone)]
pub struct MessageContext {
    shutdown: ShutdownSignal,
    trace_context: Option<String>,
}

impl MessageContext {
    /// Build a context from a shutdown signal and an optional trace carrier.
    pub fn new(shutdown: ShutdownSignal, trace_context: Option<String>) -> Self {
        Self { shutdown, trace_context }
    }

    /// True if the host has begun shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Resolves once the host signals shutdown.
    pub async fn cancelled(&mut self) {
        self.shutdown.cancelled().await
    }

    /// The trace context carried alongside this message, if any.
    pub fn trace_context(&self) -> Option<&str> {
        self.trace_context.as_deref()
    }
}
