//! Converts a handler panic into an ordinary error so it can flow through
//! the rest of the chain (poison, saga, nack) instead of taking down the
//! consumer's worker task.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::message::{Message, MessageContext};
use crate::telemetry::{emit_best_effort, NullSink, PolicyEvent, RouterEvent};

use super::{HandlerError, HandlerResult, Middleware};

#[derive(Debug)]
struct HandlerPanicked(String);

impl fmt::Display for HandlerPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

impl std::error::Error for HandlerPanicked {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outermost middleware in the chain: catches a panic out of the inner chain
/// (most likely the handler itself) and turns it into a [`HandlerPanicked`].
pub struct Recoverer<Sink = NullSink> {
    topic: String,
    inner: Arc<dyn Middleware>,
    sink: Sink,
}

impl Recoverer<NullSink> {
    pub fn new(topic: impl Into<String>, inner: Arc<dyn Middleware>) -> Self {
        Self { topic: topic.into(), inner, sink: NullSink }
    }
}

impl<Sink> Recoverer<Sink> {
    pub fn with_sink<NewSink>(self, sink: NewSink) -> Recoverer<NewSink> {
        Recoverer { topic: self.topic, inner: self.inner, sink }
    }
}

#[async_trait]
impl<Sink> Middleware for Recoverer<Sink>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult {
        let inner = self.inner.clone();
        match AssertUnwindSafe(inner.call(message, context)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(topic = %self.topic, reason = %reason, "handler panicked");
                emit_best_effort(
                    self.sink.clone(),
                    PolicyEvent::Router(RouterEvent::HandlerPanicked { topic: self.topic.clone() }),
                )
                .await;
                Err(Box::new(HandlerPanicked(reason)) as HandlerError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ShutdownHandle;
    use std::collections::HashMap;

    struct PanicsHandler;

    #[async_trait]
    impl Middleware for PanicsHandler {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            panic!("boom");
        }
    }

    struct OkHandler;

    #[async_trait]
    impl Middleware for OkHandler {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            Ok(())
        }
    }

    fn ctx() -> MessageContext {
        MessageContext::new(ShutdownHandle::new().1, None)
    }

    #[tokio::test]
    async fn panic_becomes_an_error() {
        let recoverer = Recoverer::new("topic", Arc::new(PanicsHandler));
        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        let err = recoverer.call(msg, ctx()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn success_passes_through_untouched() {
        let recoverer = Recoverer::new("topic", Arc::new(OkHandler));
        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        assert!(recoverer.call(msg, ctx()).await.is_ok());
    }
}
