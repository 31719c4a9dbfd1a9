//! Bounded exponential-backoff retry for the router's middleware chain.
//!
//! Deliberately distinct from [`crate::RetryPolicy`]: that policy's backoff
//! doubles every attempt and has no notion of message cancellation, whereas
//! this one honors [`is_permanent`] and aborts its sleep the moment the
//! message's [`MessageContext`] is canceled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Message, MessageContext};
use crate::permanent_error::is_permanent;

use super::{HandlerResult, Middleware};

/// Tunables for [`RetryStep`]. Defaults match the onboarding pipeline's
/// handler retry contract: five retries, starting at 50ms, backing off by
/// 1.5x up to a 2s ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial: Duration::from_millis(50),
            multiplier: 1.5,
            max: Duration::from_secs(2),
        }
    }
}

pub struct RetryStep {
    config: RetryConfig,
    inner: Arc<dyn Middleware>,
}

impl RetryStep {
    pub fn new(config: RetryConfig, inner: Arc<dyn Middleware>) -> Self {
        Self { config, inner }
    }
}

#[async_trait]
impl Middleware for RetryStep {
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult {
        let mut interval = self.config.initial;
        let mut retries_left = self.config.max_retries;
        let mut cancel_watch = context.clone();

        loop {
            match self.inner.call(message.clone(), context.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if is_permanent(err.as_ref()) {
                        return Err(err);
                    }
                    if retries_left == 0 {
                        return Err(err);
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel_watch.cancelled() => return Err(err),
                    }

                    let next_millis = interval.as_secs_f64() * self.config.multiplier;
                    interval = Duration::from_secs_f64(next_millis).min(self.config.max);
                    retries_left -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ShutdownHandle;
    use crate::permanent_error::PermanentError;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> MessageContext {
        MessageContext::new(ShutdownHandle::new().1, None)
    }

    struct FailsNTimes {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl Middleware for FailsNTimes {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(Box::new(io::Error::new(io::ErrorKind::Other, "transient")))
            } else {
                Ok(())
            }
        }
    }

    struct AlwaysPermanent;

    #[async_trait]
    impl Middleware for AlwaysPermanent {
        async fn call(&self, _message: Message, _context: MessageContext) -> HandlerResult {
            Err(Box::new(PermanentError::new(io::Error::new(io::ErrorKind::InvalidData, "bad"))))
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = RetryConfig { max_retries: 5, initial: Duration::from_millis(1), multiplier: 1.5, max: Duration::from_millis(5) };
        let inner = Arc::new(FailsNTimes { remaining: AtomicUsize::new(2) });
        let step = RetryStep::new(config, inner);
        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        assert!(step.call(msg, ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit_without_retry() {
        let config = RetryConfig { max_retries: 5, initial: Duration::from_secs(60), multiplier: 1.5, max: Duration::from_secs(60) };
        let step = RetryStep::new(config, Arc::new(AlwaysPermanent));
        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        let result = tokio::time::timeout(Duration::from_millis(200), step.call(msg, ctx())).await;
        assert!(result.expect("should not hang on a permanent error").is_err());
    }

    #[tokio::test]
    async fn exhausting_retries_returns_last_error() {
        let config = RetryConfig { max_retries: 1, initial: Duration::from_millis(1), multiplier: 1.5, max: Duration::from_millis(5) };
        let inner = Arc::new(FailsNTimes { remaining: AtomicUsize::new(10) });
        let step = RetryStep::new(config, inner);
        let msg = Message::new(b"{}".to_vec(), HashMap::new());
        assert!(step.call(msg, ctx()).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_aborts_the_sleep() {
        let config = RetryConfig { max_retries: 5, initial: Duration::from_secs(60), multiplier: 1.5, max: Duration::from_secs(60) };
        let inner = Arc::new(FailsNTimes { remaining: AtomicUsize::new(10) });
        let step = RetryStep::new(config, inner);
        let (handle, signal) = ShutdownHandle::new();
        let context = MessageContext::new(signal, None);
        let msg = Message::new(b"{}".to_vec(), HashMap::new());

        let call = tokio::spawn(async move { step.call(msg, context).await });
        tokio::task::yield_now().await;
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(200), call).await;
        assert!(result.expect("retry should observe cancellation").unwrap().is_err());
    }
}
