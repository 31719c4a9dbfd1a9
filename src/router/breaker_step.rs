//! Wires the sliding-window [`Breaker`] into the middleware chain as the
//! innermost step, so its trip counts reflect only actual handler
//! invocations (a probe admitted while half-open still counts).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::breaker::{Breaker, BreakerError};
use crate::message::{Message, MessageContext};
use crate::telemetry::NullSink;

use super::{HandlerError, HandlerResult, Middleware};

/// Surfaced when the breaker fails fast. Deliberately not a
/// [`crate::PermanentError`]: upstream retry may keep waiting for the
/// breaker to close instead of escalating straight to saga/poison.
#[derive(Debug)]
pub struct BreakerOpen;

impl fmt::Display for BreakerOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit breaker is open; handler was not invoked")
    }
}

impl std::error::Error for BreakerOpen {}

pub struct BreakerStep<Sink = NullSink> {
    breaker: Breaker<Sink>,
    inner: Arc<dyn Middleware>,
}

impl<Sink> BreakerStep<Sink> {
    pub fn new(breaker: Breaker<Sink>, inner: Arc<dyn Middleware>) -> Self {
        Self { breaker, inner }
    }
}

#[async_trait]
impl<Sink> Middleware for BreakerStep<Sink>
where
    Sink: tower::Service<crate::telemetry::PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult {
        let inner = self.inner.clone();
        let result = self.breaker.execute(|| async move { inner.call(message, context).await }).await;
        match result {
            Ok(()) => Ok(()),
            Err(BreakerError::Open) => Err(Box::new(BreakerOpen) as HandlerError),
            Err(BreakerError::Inner(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::message::ShutdownHandle;
    use std::collections::HashMap;
    use std::io;
    use std::time::Duration;

    struct AlwaysFails;

    #[async_trait]
    impl Middleware for AlwaysFails {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            Err(Box::new(io::Error::new(io::ErrorKind::Other, "boom")))
        }
    }

    fn ctx() -> MessageContext {
        MessageContext::new(ShutdownHandle::new().1, None)
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_invoking_handler() {
        let config = BreakerConfig { window: Duration::from_secs(60), min_requests: 3, failure_ratio: 0.6, timeout: Duration::from_secs(60), max_requests: 1 };
        let breaker = Breaker::new(config);
        let step = BreakerStep::new(breaker, Arc::new(AlwaysFails));

        for _ in 0..3 {
            let msg = Message::new(b"{}".to_vec(), HashMap::new());
            let _ = step.call(msg, ctx()).await;
        }

        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        let err = step.call(msg, ctx()).await.unwrap_err();
        assert!(err.downcast_ref::<BreakerOpen>().is_some());
    }
}
