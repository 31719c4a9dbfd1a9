//! The per-instance pub/sub listener that turns a published [`TargetedEvent`]
//! into a local delivery via [`ClientRegistry::broadcast`] (spec §4.11).
//!
//! Each gateway instance subscribes to exactly one channel,
//! `gateway_events:<its instance id>`; a malformed payload or an event for a
//! user not connected here is logged and dropped, never fatal to the task.

use crate::state::GatewayState;
use futures::StreamExt;
use sagamesh::gateway::TargetedEvent;
use sagamesh::message::ShutdownSignal;
use std::sync::Arc;

/// Spawn the fanout listener for `state`'s instance, running until
/// `shutdown` fires or the subscription stream ends.
pub fn spawn_fanout(state: Arc<GatewayState>, mut shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let channel = state.fanout_channel();
        let mut stream = match state.kv.subscribe(&channel).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, %channel, "failed to subscribe to gateway fanout channel");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(%channel, "fanout listener shutting down");
                    break;
                }
                next = stream.next() => {
                    let Some(payload) = next else {
                        tracing::warn!(%channel, "fanout subscription ended");
                        break;
                    };
                    match serde_json::from_slice::<TargetedEvent>(&payload) {
                        Ok(event) => state.registry.broadcast(event),
                        Err(err) => tracing::warn!(error = %err, "dropping malformed gateway fanout payload"),
                    }
                }
            }
        }
    })
}
