//! Redis-backed [`KvStore`](sagamesh::kv::KvStore) (spec §6): the real
//! backing store behind the presence store and onboarding aggregator when
//! running against an actual Redis or Valkey instance.
//!
//! Ordinary commands run over a `redis::aio::ConnectionManager`, which
//! transparently reconnects on connection loss so callers never see a
//! dropped-connection error mid-retry. `subscribe` opens its own dedicated
//! connection via `Client::get_async_pubsub`, since a connection driving
//! pub/sub can't also run ordinary commands.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sagamesh::kv::{ByteStream, KvError, KvStore};
use std::time::Duration;

fn transport_err(err: redis::RedisError) -> KvError {
    KvError::Transport(Box::new(err))
}

/// A [`KvStore`] backed by a real Redis/Valkey server.
#[derive(Clone)]
pub struct RedisKvStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisKvStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`), establishing the
    /// managed command connection eagerly.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(transport_err)?;
        let conn = client.get_connection_manager().await.map_err(transport_err)?;
        Ok(Self { client, conn })
    }

    /// Wrap an already-open client and managed connection.
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await.map_err(transport_err)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(transport_err)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), KvError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, members).await.map_err(transport_err)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(transport_err)
    }

    async fn scard(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(transport_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1) as i64;
        conn.expire::<_, ()>(key, seconds).await.map_err(transport_err)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await.map_err(transport_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, KvError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport_err)?;
        pubsub.subscribe(channel).await.map_err(transport_err)?;
        let stream = pubsub.into_on_message().map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }
}
