//! The `GET /events` SSE endpoint (spec §6): authenticates the connection,
//! registers it for targeted delivery, and streams events plus a heartbeat
//! until the client disconnects.

use crate::state::GatewayState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream};
use sagamesh::gateway::{ClientRegistry, TargetedEvent};
use sagamesh::presence::PresenceStore;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// How often a connected client receives a heartbeat comment. Also the
/// cadence at which this connection's presence record is refreshed, so a
/// stalled heartbeat and a stale presence TTL fail together.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a disconnect's offline-presence write is given before it's
/// abandoned. The connection is already gone; this bounds how long a slow
/// kv store can hold up the cleanup task.
const DISCONNECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    token: Option<String>,
}

/// Build the gateway's axum router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/events", get(events)).with_state(state)
}

async fn events(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    let token = query.token.as_deref().ok_or((StatusCode::UNAUTHORIZED, "missing token"))?;
    let user_id = state
        .authenticator
        .authenticate(token)
        .await
        .ok_or((StatusCode::UNAUTHORIZED, "invalid or expired token"))?;

    let rx = state.registry.register(&user_id);
    state
        .presence
        .mark_online(&user_id, &state.instance_id)
        .await
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to record presence"))?;

    tracing::info!(%user_id, instance_id = %state.instance_id, "sse connection established");

    let connected = stream::once(std::future::ready(Ok(connected_event())));
    let delivered = delivery_stream(rx, state.presence.clone(), user_id.clone(), state.instance_id.clone());

    let guarded = DisconnectGuard::wrap(
        connected.chain(delivered),
        state.registry.clone(),
        state.presence.clone(),
        user_id,
        state.instance_id.clone(),
    );

    Ok(Sse::new(guarded))
}

fn connected_event() -> Event {
    Event::default().event("connected").data("{}")
}

fn to_sse_event(event: TargetedEvent) -> Event {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type).data(data)
}

/// Merge the registry's per-connection receiver with a 15-second heartbeat
/// tick into a single SSE item stream. The heartbeat also refreshes this
/// connection's presence record, so it doubles as the liveness proof spec
/// §4.9 requires every 15 seconds.
fn delivery_stream(
    rx: mpsc::Receiver<TargetedEvent>,
    presence: PresenceStore,
    user_id: String,
    instance_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    stream::unfold(
        (rx, heartbeat, presence, user_id, instance_id),
        |(mut rx, mut heartbeat, presence, user_id, instance_id)| async move {
            loop {
                tokio::select! {
                    biased;
                    maybe_event = rx.recv() => {
                        let event = maybe_event?;
                        return Some((Ok(to_sse_event(event)), (rx, heartbeat, presence, user_id, instance_id)));
                    }
                    _ = heartbeat.tick() => {
                        if let Err(err) = presence.mark_online(&user_id, &instance_id).await {
                            tracing::warn!(%user_id, error = %err, "heartbeat presence refresh failed");
                        }
                        return Some((Ok(Event::default().comment("keep-alive")), (rx, heartbeat, presence, user_id, instance_id)));
                    }
                }
            }
        },
    )
}

/// Wraps the SSE body stream so that when it's dropped -- which axum does as
/// soon as the client disconnects, since it stops polling the response body
/// -- the connection is torn down on the server side too: unregistered from
/// the [`ClientRegistry`] and its presence flipped to offline.
///
/// The offline write races the next reconnect on another instance, so it's
/// bounded by [`DISCONNECT_WRITE_TIMEOUT`] and detached: nothing downstream
/// of a disconnect is waiting on it.
#[pin_project::pin_project(PinnedDrop)]
struct DisconnectGuard<S> {
    #[pin]
    inner: S,
    registry: ClientRegistry,
    presence: PresenceStore,
    user_id: String,
    instance_id: String,
}

impl<S> DisconnectGuard<S> {
    fn wrap(inner: S, registry: ClientRegistry, presence: PresenceStore, user_id: String, instance_id: String) -> Self {
        Self { inner, registry, presence, user_id, instance_id }
    }
}

impl<S: Stream> Stream for DisconnectGuard<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[pin_project::pinned_drop]
impl<S> PinnedDrop for DisconnectGuard<S> {
    fn drop(self: Pin<&mut Self>) {
        let registry = self.registry.clone();
        let presence = self.presence.clone();
        let user_id = self.user_id.clone();
        let instance_id = self.instance_id.clone();
        registry.unregister(&user_id);
        tokio::spawn(async move {
            let write = presence.mark_offline(&user_id, &instance_id);
            if tokio::time::timeout(DISCONNECT_WRITE_TIMEOUT, write).await.is_err() {
                tracing::warn!(%user_id, %instance_id, "offline presence write timed out on disconnect");
            }
        });
    }
}
