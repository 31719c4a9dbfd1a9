//! Dead-letter forwarding: the last stop for errors that saga compensation
//! doesn't claim (unroutable permanent errors, most commonly).

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::Publisher;
use crate::message::{Message, MessageContext, META_ERROR_REASON, META_SOURCE_TOPIC};
use crate::telemetry::{emit_best_effort, NullSink, PoisonEvent, PolicyEvent};

use super::{HandlerResult, Middleware};

pub struct PoisonStep<Sink = NullSink> {
    source_topic: String,
    dead_letter_topic: String,
    publisher: Arc<dyn Publisher>,
    inner: Arc<dyn Middleware>,
    sink: Sink,
}

impl PoisonStep<NullSink> {
    pub fn new(
        source_topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        inner: Arc<dyn Middleware>,
    ) -> Self {
        Self {
            source_topic: source_topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
            publisher,
            inner,
            sink: NullSink,
        }
    }
}

impl<Sink> PoisonStep<Sink> {
    pub fn with_sink<NewSink>(self, sink: NewSink) -> PoisonStep<NewSink> {
        PoisonStep {
            source_topic: self.source_topic,
            dead_letter_topic: self.dead_letter_topic,
            publisher: self.publisher,
            inner: self.inner,
            sink,
        }
    }
}

#[async_trait]
impl<Sink> Middleware for PoisonStep<Sink>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult {
        let snapshot = message.clone();
        match self.inner.call(message, context).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let poisoned = snapshot
                    .with_metadata(META_ERROR_REASON, err.to_string())
                    .with_metadata(META_SOURCE_TOPIC, self.source_topic.clone());

                match self.publisher.publish(&self.dead_letter_topic, poisoned).await {
                    Ok(()) => {
                        tracing::warn!(
                            source_topic = %self.source_topic,
                            dead_letter_topic = %self.dead_letter_topic,
                            reason = %err,
                            "forwarded message to dead-letter queue"
                        );
                        emit_best_effort(
                            self.sink.clone(),
                            PolicyEvent::Poison(PoisonEvent::Forwarded {
                                source_topic: self.source_topic.clone(),
                                reason: err.to_string(),
                            }),
                        )
                        .await;
                        Ok(())
                    }
                    Err(publish_err) => {
                        tracing::error!(
                            source_topic = %self.source_topic,
                            dead_letter_topic = %self.dead_letter_topic,
                            error = %publish_err,
                            "failed to forward message to dead-letter queue"
                        );
                        emit_best_effort(
                            self.sink.clone(),
                            PolicyEvent::Poison(PoisonEvent::ForwardFailed {
                                source_topic: self.source_topic.clone(),
                            }),
                        )
                        .await;
                        Err(err)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, Subscriber};
    use crate::message::{ShutdownHandle, META_USER_ID};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::io;

    struct AlwaysFails;

    #[async_trait]
    impl Middleware for AlwaysFails {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            Err(Box::new(io::Error::new(io::ErrorKind::Other, "bad payload")))
        }
    }

    fn ctx() -> MessageContext {
        MessageContext::new(ShutdownHandle::new().1, None)
    }

    #[tokio::test]
    async fn failed_message_is_forwarded_to_dead_letters_and_acked() {
        let bus = InMemoryBus::default();
        let step = PoisonStep::new("user_created", "dead_letters", Arc::new(bus.clone()), Arc::new(AlwaysFails));

        let mut meta = HashMap::new();
        meta.insert(META_USER_ID.to_string(), "7".to_string());
        let msg = Message::new(b"{}".to_vec(), meta);

        assert!(step.call(msg, ctx()).await.is_ok());

        let mut stream = bus.subscribe("dead_letters").await.unwrap();
        let delivered = stream.next().await.unwrap();
        assert_eq!(delivered.message().user_id(), Some("7"));
        assert_eq!(delivered.message().metadata.get(META_SOURCE_TOPIC).map(String::as_str), Some("user_created"));
        assert!(delivered.message().metadata.contains_key(META_ERROR_REASON));
    }
}
