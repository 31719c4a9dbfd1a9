//! NATS JetStream-backed [`Publisher`](sagamesh::bus::Publisher)/[`Subscriber`](sagamesh::bus::Subscriber)
//! event bus (spec §6): durable JetStream consumers give at-least-once
//! redelivery on unacked messages.
//!
//! Metadata travels as NATS headers (plus a dedicated `uuid` header for
//! correlation); `payload` is the message body untouched. One JetStream
//! stream per topic, created on first use; one durable pull consumer per
//! [`Subscriber::subscribe`] call, named after the bus's configured
//! `durable_name`. Like `sagamesh-kafka`, `ack`/`nack` don't carry a backend
//! callback, so a received message is acked to JetStream as soon as it's
//! handed off, and a `nack`'d message is instead requeued onto an internal
//! channel the subscription stream drains with priority.

use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sagamesh::bus::{BusError, Delivery, DeliveryStream, Publisher, Subscriber};
use sagamesh::message::{Message, MessageContext, ShutdownSignal};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

fn transport_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> BusError {
    BusError::Transport(Box::new(err))
}

/// A [`Publisher`]/[`Subscriber`] pair backed by a real NATS JetStream
/// deployment.
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
    durable_name: String,
    shutdown: ShutdownSignal,
}

impl NatsBus {
    /// Connect to `url` (e.g. `nats://127.0.0.1:4222`); `durable_name` names
    /// the durable pull consumer every [`Subscriber::subscribe`] call joins.
    pub async fn connect(
        url: &str,
        durable_name: impl Into<String>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, BusError> {
        let client = async_nats::connect(url).await.map_err(transport_err)?;
        let jetstream = jetstream::new(client);
        Ok(Self { jetstream, durable_name: durable_name.into(), shutdown })
    }

    async fn ensure_stream(&self, topic: &str) -> Result<jetstream::stream::Stream, BusError> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: topic.to_string(),
                subjects: vec![topic.to_string()],
                ..Default::default()
            })
            .await
            .map_err(transport_err)
    }
}

fn headers_from_message(uuid: Uuid, metadata: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("uuid", uuid.to_string().as_str());
    for (key, value) in metadata {
        headers.insert(key.as_str(), value.as_str());
    }
    headers
}

fn message_from_jetstream(record: &jetstream::Message) -> Message {
    let payload = record.payload.to_vec();
    let mut metadata = HashMap::new();
    let mut uuid = Uuid::new_v4();

    if let Some(headers) = &record.headers {
        for (name, values) in headers.iter() {
            let Some(value) = values.iter().next() else { continue };
            let value = value.to_string();
            if name.as_str() == "uuid" {
                if let Ok(parsed) = Uuid::parse_str(&value) {
                    uuid = parsed;
                }
            } else {
                metadata.insert(name.as_str().to_string(), value);
            }
        }
    }

    Message::with_uuid(uuid, payload, metadata)
}

#[async_trait]
impl Publisher for NatsBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.ensure_stream(topic).await?;
        let headers = headers_from_message(message.uuid, &message.metadata);
        self.jetstream
            .publish_with_headers(topic.to_string(), headers, message.payload.into())
            .await
            .map_err(transport_err)?
            .await
            .map_err(transport_err)?;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for NatsBus {
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError> {
        let stream = self.ensure_stream(topic).await?;
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &self.durable_name,
                PullConfig {
                    durable_name: Some(self.durable_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(transport_err)?;

        let messages = consumer.messages().await.map_err(transport_err)?;

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel::<Message>();
        let state = (Box::pin(messages), requeue_rx, requeue_tx, self.shutdown.clone());

        let out = stream::unfold(state, |(mut messages, mut requeue_rx, requeue_tx, shutdown)| async move {
            loop {
                tokio::select! {
                    biased;
                    Some(message) = requeue_rx.recv() => {
                        let context = MessageContext::new(shutdown.clone(), message.trace_context().map(String::from));
                        let delivery = Delivery::new(message, context, requeue_tx.clone());
                        return Some((delivery, (messages, requeue_rx, requeue_tx, shutdown)));
                    }
                    next = messages.next() => {
                        match next {
                            Some(Ok(jetstream_message)) => {
                                let message = message_from_jetstream(&jetstream_message);
                                if let Err(err) = jetstream_message.ack().await {
                                    tracing::warn!(error = %err, "failed to ack jetstream message");
                                }
                                let context = MessageContext::new(shutdown.clone(), message.trace_context().map(String::from));
                                let delivery = Delivery::new(message, context, requeue_tx.clone());
                                return Some((delivery, (messages, requeue_rx, requeue_tx, shutdown)));
                            }
                            Some(Err(err)) => {
                                tracing::warn!(error = %err, "jetstream consumer error; continuing");
                                continue;
                            }
                            None => return None,
                        }
                    }
                }
            }
        });

        Ok(Box::pin(out))
    }
}
