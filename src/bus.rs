//! The event bus abstraction: a partitioned log with consumer groups.
//!
//! [`Publisher`] and [`Subscriber`] are the crate's own trait seam over that
//! contract; `sagamesh-kafka` and `sagamesh-nats` provide real backends, and
//! [`InMemoryBus`] backs this crate's own tests (and is exported behind
//! `test-util` for downstream integration tests).

use crate::message::{Message, MessageContext, ShutdownSignal};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Errors returned by [`Publisher`]/[`Subscriber`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A second subscriber tried to attach to a topic that already has one.
    ///
    /// The router registers at most one consumer per topic (`add_consumer_handler`
    /// rejects duplicate names); a second `subscribe` on the same topic is a
    /// caller bug, not a transient condition.
    #[error("topic {0:?} already has an active subscriber")]
    AlreadySubscribed(String),
    /// The underlying transport is gone (channel closed, connection dropped).
    #[error("bus transport closed")]
    Closed,
    /// A backend-specific failure (broker unreachable, serialization error).
    #[error("bus transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A single in-flight message handed to a consumer, along with the means to
/// acknowledge or request redelivery.
///
/// Ack discipline (spec): ack on a nil return from the outermost middleware;
/// nack on non-nil return, which the backend redelivers within its own
/// timeout.
pub struct Delivery {
    message: Message,
    context: MessageContext,
    requeue: mpsc::UnboundedSender<Message>,
}

impl Delivery {
    /// Construct a delivery. `requeue` is the channel a [`Subscriber`]
    /// implementation uses to redeliver `message` on [`Delivery::nack`].
    pub fn new(
        message: Message,
        context: MessageContext,
        requeue: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self { message, context, requeue }
    }

    /// The message envelope.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The message's cancellation/trace context.
    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// Acknowledge successful processing. The message will not be redelivered.
    pub fn ack(self) {}

    /// Request redelivery. Consumes the delivery and re-enqueues the
    /// original message on its source topic.
    pub fn nack(self) {
        let _ = self.requeue.send(self.message);
    }
}

/// A boxed stream of deliveries returned by [`Subscriber::subscribe`].
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Publishes messages to a topic.
///
/// Per spec §4.8, injecting trace context into `message.metadata` and
/// starting a producer span is the publisher *adapter*'s job
/// ([`crate::publisher::TracingPublisher`]), not this trait's — `Publisher`
/// implementations are the raw transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `message` to `topic`. At-least-once; ordering is preserved
    /// per partition by the backend.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;
}

/// Subscribes to a topic, yielding a stream of [`Delivery`] items.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `topic`. Returns [`BusError::AlreadySubscribed`] if this
    /// subscriber already has an active stream for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError>;
}

struct TopicChannel {
    tx: mpsc::UnboundedSender<Message>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
}

/// An in-process bus used by this crate's own tests and exported for
/// downstream integration tests.
///
/// Each topic is a single FIFO queue: at most one active subscriber per
/// topic, matching the router's one-consumer-per-topic model. A nacked
/// delivery is pushed back onto the same queue, simulating broker
/// redelivery without a real timeout.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<Mutex<HashMap<String, TopicChannel>>>,
    shutdown: ShutdownSignal,
}

impl InMemoryBus {
    /// Create a bus whose message contexts observe `shutdown`.
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { topics: Arc::new(Mutex::new(HashMap::new())), shutdown }
    }

    fn channel_for(&self, topic: &str) -> mpsc::UnboundedSender<Message> {
        let mut guard = self.topics.lock().unwrap();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                TopicChannel { tx, rx: Some(rx) }
            })
            .tx
            .clone()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.channel_for(topic).send(message).map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError> {
        let tx = self.channel_for(topic);
        let rx = {
            let mut guard = self.topics.lock().unwrap();
            guard
                .get_mut(topic)
                .and_then(|chan| chan.rx.take())
                .ok_or_else(|| BusError::AlreadySubscribed(topic.to_string()))?
        };
        let shutdown = self.shutdown.clone();

        let stream = stream::unfold((rx, tx, shutdown), |(mut rx, tx, shutdown)| async move {
            let message = rx.recv().await?;
            let ctx = MessageContext::new(shutdown.clone(), message.trace_context().map(String::from));
            let delivery = Delivery::new(message, ctx, tx.clone());
            Some((delivery, (rx, tx, shutdown)))
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ShutdownHandle, META_USER_ID};
    use futures::StreamExt;
    use std::collections::HashMap as Map;

    fn msg(user_id: &str) -> Message {
        let mut meta = Map::new();
        meta.insert(META_USER_ID.to_string(), user_id.to_string());
        Message::new(b"{}".to_vec(), meta)
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_message() {
        let bus = InMemoryBus::new(ShutdownHandle::new().1);
        bus.publish("user_created", msg("42")).await.unwrap();

        let mut stream = bus.subscribe("user_created").await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.message().user_id(), Some("42"));
        delivery.ack();
    }

    #[tokio::test]
    async fn subscribing_twice_to_the_same_topic_errors() {
        let bus = InMemoryBus::new(ShutdownHandle::new().1);
        let _first = bus.subscribe("user_created").await.unwrap();
        let second = bus.subscribe("user_created").await;
        assert!(matches!(second, Err(BusError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn nack_redelivers_the_message() {
        let bus = InMemoryBus::new(ShutdownHandle::new().1);
        bus.publish("user_created", msg("42")).await.unwrap();

        let mut stream = bus.subscribe("user_created").await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.message().user_id(), Some("42"));
        first.nack();

        let redelivered = stream.next().await.unwrap();
        assert_eq!(redelivered.message().user_id(), Some("42"));
    }
}
