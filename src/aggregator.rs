//! Onboarding aggregation: wait for every downstream service to sync a
//! newly created user, then deliver completion exactly once, straight to
//! whichever gateway instance currently owns the user's live connection
//! (spec §4.10).
//!
//! A user's outstanding services live as a set in the [`crate::kv::KvStore`]
//! (`registration:<user_id>:pending_syncs`), seeded on `user_created` and
//! drained one member at a time as each `user_synced_<service>` arrives. The
//! set hitting zero is the completion signal; a separate
//! `registration:<user_id>:completed` key guards against firing twice if a
//! redelivered sync drains an already-empty set back to zero.
//!
//! Completion is NOT published on the event bus: per spec, the aggregator
//! looks up the user's presence and, if online, publishes a
//! [`TargetedEvent`] directly on that instance's `gateway_events:<id>`
//! pub/sub channel. An offline user's completion event is simply dropped —
//! there is no general subscriber for it to reach.

use crate::gateway::TargetedEvent;
use crate::kv::{KvError, KvStore};
use crate::presence::{PresenceError, PresenceStore};
use std::sync::Arc;
use std::time::Duration;

/// The services a fresh user must sync with before onboarding is complete.
pub const DEFAULT_SERVICES: &[&str] = &["post", "social", "search", "messaging"];

/// The SSE event type the gateway forwards once onboarding is complete.
pub const ONBOARDING_COMPLETED_EVENT: &str = "onboarding_completed";

/// TTL on the pending-syncs set: if a user never finishes onboarding (a
/// service is permanently down), the bookkeeping key expires rather than
/// accumulating forever.
pub const PENDING_SYNCS_TTL: Duration = Duration::from_secs(60 * 60);

/// TTL on the completed-once guard key. An hour is generous next to how
/// long redelivery of a stale sync event could plausibly lag.
pub const COMPLETED_GUARD_TTL: Duration = Duration::from_secs(60 * 60);

fn pending_syncs_key(user_id: &str) -> String {
    format!("registration:{user_id}:pending_syncs")
}

fn completed_key(user_id: &str) -> String {
    format!("registration:{user_id}:completed")
}

/// Marks that `user_id`'s pending-syncs set was actually seeded by
/// `on_user_created`, so `on_service_synced` can tell "the set emptied
/// because every service synced" apart from "the set was never seeded
/// because `user_synced_<svc>` raced ahead of `user_created`" -- both read
/// as `scard() == 0`, but only the former should trigger completion.
fn seeded_key(user_id: &str) -> String {
    format!("registration:{user_id}:seeded")
}

fn gateway_channel(instance_id: &str) -> String {
    format!("gateway_events:{instance_id}")
}

/// Errors from aggregator operations.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

/// Tracks per-user sync completion and delivers the completion event to the
/// user's owning gateway instance, if any.
#[derive(Clone)]
pub struct OnboardingAggregator {
    kv: Arc<dyn KvStore>,
    presence: PresenceStore,
    services: Vec<String>,
}

impl OnboardingAggregator {
    /// Build an aggregator watching [`DEFAULT_SERVICES`].
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_services(kv, DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect())
    }

    /// Build an aggregator watching a custom service set (spec §9 open
    /// question: the canonical set is a configuration input, not a
    /// hardcoded constant).
    pub fn with_services(kv: Arc<dyn KvStore>, services: Vec<String>) -> Self {
        let presence = PresenceStore::new(kv.clone());
        Self { kv, presence, services }
    }

    /// Seed the pending-syncs set for a newly created user, and mark it
    /// seeded so a later `on_service_synced` can recognize this user as
    /// genuinely registered.
    pub async fn on_user_created(&self, user_id: &str) -> Result<(), AggregatorError> {
        self.kv.sadd(&pending_syncs_key(user_id), &self.services).await?;
        self.kv.expire(&pending_syncs_key(user_id), PENDING_SYNCS_TTL).await?;
        self.kv.set(&seeded_key(user_id), b"1".to_vec(), PENDING_SYNCS_TTL).await?;
        Ok(())
    }

    /// Record that `service` finished syncing `user_id`. Returns `true` if
    /// this call observed the last outstanding service and delivered the
    /// completion event; `false` otherwise (services remain, the user is
    /// offline, completion was already announced by an earlier, possibly
    /// redelivered, call, or this user was never seeded).
    ///
    /// Tolerates out-of-order arrival relative to `user_created`: a
    /// `user_synced_<svc>` that races ahead of `user_created` finds the
    /// pending-syncs set unseeded, so `scard` reads zero the same way a
    /// genuinely-emptied set does. The [`seeded_key`] check below is what
    /// distinguishes the two -- without it this would proceed to claim
    /// completion and permanently set the completed-guard for a user who
    /// hasn't even been created yet, silently swallowing their real
    /// completion event once the genuine sync sequence runs.
    pub async fn on_service_synced(&self, user_id: &str, service: &str) -> Result<bool, AggregatorError> {
        self.kv.srem(&pending_syncs_key(user_id), service).await?;
        let remaining = self.kv.scard(&pending_syncs_key(user_id)).await?;
        if remaining > 0 {
            return Ok(false);
        }
        if self.kv.get(&seeded_key(user_id)).await?.is_none() {
            tracing::debug!(
                user_id = %user_id,
                service = %service,
                "user_synced arrived with no seeded pending-syncs registration; ignoring"
            );
            return Ok(false);
        }
        if !self.claim_completion(user_id).await? {
            return Ok(false);
        }
        self.trigger_onboarding_completed(user_id).await
    }

    async fn claim_completion(&self, user_id: &str) -> Result<bool, AggregatorError> {
        if self.kv.get(&completed_key(user_id)).await?.is_some() {
            return Ok(false);
        }
        self.kv.set(&completed_key(user_id), b"1".to_vec(), COMPLETED_GUARD_TTL).await?;
        Ok(true)
    }

    /// Deliver the completion event to the user's gateway instance, if
    /// they're currently online. Returns `true` if the event was published.
    async fn trigger_onboarding_completed(&self, user_id: &str) -> Result<bool, AggregatorError> {
        let Some(instance_id) = self.presence.online_instance(user_id).await? else {
            tracing::debug!(user_id = %user_id, "user offline at onboarding completion; dropping event");
            return Ok(false);
        };

        let event = TargetedEvent::new(user_id, ONBOARDING_COMPLETED_EVENT, br#"{"status":"completed"}"#.to_vec());
        let payload = serde_json::to_vec(&event).expect("TargetedEvent always serializes");
        self.kv.publish(&gateway_channel(&instance_id), payload).await?;
        Ok(true)
    }
}
