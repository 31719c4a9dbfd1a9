//! Kafka-backed [`Publisher`](sagamesh::bus::Publisher)/[`Subscriber`](sagamesh::bus::Subscriber)
//! event bus (spec §6): a real partitioned log with native consumer-group
//! semantics, via `rdkafka`.
//!
//! Metadata travels as Kafka record headers (plus a dedicated `uuid` header
//! for correlation); `payload` is the record value untouched. One consumer
//! group per [`KafkaBus`], matching the router's one-subscriber-per-topic
//! model. Offsets auto-commit on an interval rather than synchronously on
//! [`Delivery::ack`](sagamesh::bus::Delivery::ack) — `ack`/`nack` don't carry
//! a backend callback, so a `nack`'d message is instead requeued onto an
//! internal channel the subscription stream drains with priority, giving
//! immediate in-process redelivery layered on top of Kafka's own.
use async_trait::async_trait;
use futures::stream::{self};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use sagamesh::bus::{BusError, Delivery, DeliveryStream, Publisher, Subscriber};
use sagamesh::message::{Message, MessageContext, ShutdownSignal};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn transport_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> BusError {
    BusError::Transport(Box::new(err))
}

/// A [`Publisher`]/[`Subscriber`] pair backed by a real Kafka (or
/// Redpanda-compatible) cluster.
#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer,
    brokers: String,
    group_id: String,
    shutdown: ShutdownSignal,
}

impl KafkaBus {
    /// Connect a producer to `brokers` (e.g. `localhost:9092`); `group_id`
    /// names the consumer group every [`Subscriber::subscribe`] call joins.
    pub fn connect(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, BusError> {
        let brokers = brokers.into();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(transport_err)?;
        Ok(Self { producer, brokers, group_id: group_id.into(), shutdown })
    }
}

fn message_from_record(record: &rdkafka::message::BorrowedMessage<'_>) -> Message {
    let payload = record.payload().unwrap_or_default().to_vec();
    let mut metadata = HashMap::new();
    let mut uuid = Uuid::new_v4();

    if let Some(headers) = record.headers() {
        for header in headers.iter() {
            let Some(value) = header.value else { continue };
            let value = String::from_utf8_lossy(value).into_owned();
            if header.key == "uuid" {
                if let Ok(parsed) = Uuid::parse_str(&value) {
                    uuid = parsed;
                }
            } else {
                metadata.insert(header.key.to_string(), value);
            }
        }
    }

    Message::with_uuid(uuid, payload, metadata)
}

#[async_trait]
impl Publisher for KafkaBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        let uuid_string = message.uuid.to_string();
        let mut headers = OwnedHeaders::new()
            .insert(rdkafka::message::Header { key: "uuid", value: Some(uuid_string.as_str()) });
        for (key, value) in &message.metadata {
            headers = headers
                .insert(rdkafka::message::Header { key: key.as_str(), value: Some(value.as_str()) });
        }
        let key = message.user_id().unwrap_or_default().to_string();
        let record = FutureRecord::to(topic).payload(&message.payload).key(&key).headers(headers);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _owned)| transport_err(err))?;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for KafkaBus {
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(transport_err)?;
        consumer.subscribe(&[topic]).map_err(transport_err)?;

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel::<Message>();
        let state = (consumer, requeue_rx, requeue_tx, self.shutdown.clone());

        let stream = stream::unfold(state, |(consumer, mut requeue_rx, requeue_tx, shutdown)| async move {
            loop {
                tokio::select! {
                    biased;
                    Some(message) = requeue_rx.recv() => {
                        let context = MessageContext::new(shutdown.clone(), message.trace_context().map(String::from));
                        let delivery = Delivery::new(message, context, requeue_tx.clone());
                        return Some((delivery, (consumer, requeue_rx, requeue_tx, shutdown)));
                    }
                    received = consumer.recv() => {
                        match received {
                            Ok(record) => {
                                let message = message_from_record(&record);
                                let context = MessageContext::new(shutdown.clone(), message.trace_context().map(String::from));
                                let delivery = Delivery::new(message, context, requeue_tx.clone());
                                return Some((delivery, (consumer, requeue_rx, requeue_tx, shutdown)));
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "kafka consumer error; continuing");
                                continue;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
