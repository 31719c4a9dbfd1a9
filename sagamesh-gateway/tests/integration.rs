use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sagamesh::gateway::TargetedEvent;
use sagamesh::kv::{InMemoryKvStore, KvStore};
use sagamesh_gateway::{fanout_channel, router, spawn_fanout, GatewayState, StaticTokenAuthenticator};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn state_with_user(user: &str, token: &str, instance_id: &str) -> Arc<GatewayState> {
    let mut tokens = HashMap::new();
    tokens.insert(token.to_string(), user.to_string());
    let kv = Arc::new(InMemoryKvStore::new());
    Arc::new(GatewayState::new(kv, Arc::new(StaticTokenAuthenticator::new(tokens)), instance_id.to_string()))
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let state = state_with_user("u1", "tok-1", "gw-a");
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let state = state_with_user("u1", "tok-1", "gw-a");
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/events?token=garbage").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn valid_token_opens_a_stream_and_marks_presence_online() {
    let state = state_with_user("u1", "tok-1", "gw-a");
    let presence = state.presence.clone();
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/events?token=tok-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(1), body.frame()).await.unwrap().unwrap().unwrap();
    let chunk = frame.into_data().unwrap();
    assert!(String::from_utf8_lossy(&chunk).contains("connected"));

    assert_eq!(presence.online_instance("u1").await.unwrap(), Some("gw-a".to_string()));
}

#[tokio::test]
async fn broadcast_event_is_delivered_over_the_stream() {
    let state = state_with_user("u1", "tok-1", "gw-a");
    let registry = state.registry.clone();
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/events?token=tok-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();

    // Drain the initial "connected" event.
    tokio::time::timeout(Duration::from_secs(1), body.frame()).await.unwrap().unwrap().unwrap();

    registry.broadcast(TargetedEvent::new("u1", "registration_completed", b"{}".to_vec()));

    let frame = tokio::time::timeout(Duration::from_secs(1), body.frame()).await.unwrap().unwrap().unwrap();
    let chunk = frame.into_data().unwrap();
    assert!(String::from_utf8_lossy(&chunk).contains("registration_completed"));
}

#[tokio::test]
async fn disconnect_marks_the_user_offline() {
    let state = state_with_user("u1", "tok-1", "gw-a");
    let presence = state.presence.clone();
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/events?token=tok-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    drop(response.into_body());

    // Disconnect cleanup runs in a detached task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(presence.online_instance("u1").await.unwrap(), None);
}

#[tokio::test]
async fn fanout_only_delivers_to_its_own_instance() {
    let kv = Arc::new(InMemoryKvStore::new());
    let mut tokens = HashMap::new();
    tokens.insert("tok-1".to_string(), "u1".to_string());
    let auth = Arc::new(StaticTokenAuthenticator::new(tokens));

    let state_a = Arc::new(GatewayState::new(kv.clone(), auth.clone(), "gw-a"));
    let state_b = Arc::new(GatewayState::new(kv.clone(), auth, "gw-b"));

    let mut rx_a = state_a.registry.register("u1");
    let mut rx_b = state_b.registry.register("u1");

    let (_handle_a, shutdown_a) = sagamesh::ShutdownHandle::new();
    let (_handle_b, shutdown_b) = sagamesh::ShutdownHandle::new();
    spawn_fanout(state_a.clone(), shutdown_a);
    spawn_fanout(state_b.clone(), shutdown_b);

    tokio::time::sleep(Duration::from_millis(20)).await; // let both subscriptions land

    let event = TargetedEvent::new("u1", "registration_completed", b"{}".to_vec());
    let payload = serde_json::to_vec(&event).unwrap();
    kv.publish(&fanout_channel("gw-a"), payload).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap().unwrap();
    assert_eq!(received.user_id, "u1");

    assert!(tokio::time::timeout(Duration::from_millis(100), rx_b.recv()).await.is_err());
}
