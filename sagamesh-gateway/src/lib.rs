#![forbid(unsafe_code)]

//! The onboarding gateway's SSE edge: per-connection targeted delivery over
//! `axum::response::sse`, backed by [`sagamesh::gateway::ClientRegistry`] and
//! [`sagamesh::presence::PresenceStore`].
//!
//! One process of this crate is one gateway instance. It owns a local
//! [`ClientRegistry`](sagamesh::gateway::ClientRegistry) mapping connected
//! users to their live SSE stream, subscribes to its own
//! `gateway_events:<instance_id>` pub/sub channel to receive events targeted
//! at those users, and writes presence records so the rest of the system can
//! find which instance (if any) currently holds a user's connection.
//!
//! JWT validation is deliberately not this crate's job: [`SseAuthenticator`]
//! is the seam an embedder wires a real validator into.

mod auth;
mod fanout;
mod sse;
mod state;

pub use auth::{SseAuthenticator, StaticTokenAuthenticator};
pub use fanout::spawn_fanout;
pub use sse::router;
pub use state::{fanout_channel, GatewayState};
