//! Authenticating an inbound SSE connection request (spec §6: `GET /events?token=<jwt>`).
//!
//! JWT validation itself is out of scope here — this crate defines the seam
//! ([`SseAuthenticator`]) an embedder wires a real validator into, and ships
//! [`StaticTokenAuthenticator`] as a fixed-table stand-in for local use and
//! tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a bearer token from an SSE connection request to the user id it
/// authenticates, or rejects it.
///
/// Implementations should treat an absent, malformed, or expired token the
/// same way: `None`. The handler has nothing more specific to report back
/// than a 401.
#[async_trait]
pub trait SseAuthenticator: Send + Sync {
    /// Resolve `token` to a user id, or `None` if it does not authenticate.
    async fn authenticate(&self, token: &str) -> Option<String>;
}

/// A fixed token-to-user table. Meant for local development and tests, not
/// production: tokens never expire and there is no issuer to revoke from.
#[derive(Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: Arc<HashMap<String, String>>,
}

impl StaticTokenAuthenticator {
    /// Build an authenticator from a fixed token -> user id table.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens: Arc::new(tokens) }
    }
}

#[async_trait]
impl SseAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}
