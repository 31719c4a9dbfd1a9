//! Integration test for `sagamesh-redis` against a real Redis/Valkey server.

use futures::StreamExt;
use sagamesh::kv::KvStore;
use sagamesh_redis::RedisKvStore;
use std::time::Duration;

// Requires a reachable Redis/Valkey instance. If SAGAMESH_TEST_REDIS_URL is
// unset, skip (e.g. `redis://127.0.0.1:6379`).
#[tokio::test]
async fn set_sadd_and_publish_round_trip_through_a_real_redis() {
    let url = match std::env::var("SAGAMESH_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set SAGAMESH_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return;
        }
    };

    let store = RedisKvStore::connect(&url).await.expect("connect to redis");

    let key = format!("sagamesh-redis-test:{}", uuid::Uuid::new_v4());
    store.set(&key, b"hello".to_vec(), Duration::from_secs(30)).await.expect("set");
    assert_eq!(store.get(&key).await.expect("get"), Some(b"hello".to_vec()));

    let set_key = format!("{key}:set");
    store
        .sadd(&set_key, &["post".to_string(), "social".to_string()])
        .await
        .expect("sadd");
    assert_eq!(store.scard(&set_key).await.expect("scard"), 2);
    store.srem(&set_key, "post").await.expect("srem");
    assert_eq!(store.scard(&set_key).await.expect("scard"), 1);

    let channel = format!("{key}:channel");
    let mut stream = store.subscribe(&channel).await.expect("subscribe");
    // Give the subscription a moment to register server-side before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.publish(&channel, b"ping".to_vec()).await.expect("publish");
    let payload = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("message arrives before timeout")
        .expect("stream yields a payload");
    assert_eq!(payload, b"ping".to_vec());
}
