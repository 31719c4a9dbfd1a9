#![forbid(unsafe_code)]

//! # Saga Mesh 🐱
//!
//! Production-grade resilience patterns for Rust: retry policies, circuit breakers,
//! bulkheads, and timeouts.
//!
//! ## Features
//!
//! - **Retry policies** with backoff strategies (constant, linear, exponential)
//! - **Circuit breakers** with half-open state recovery
//! - **Bulkheads** for concurrency limiting and resource isolation
//! - **Timeout policies** integrated with tokio
//! - **Policy composition** via builder pattern
//! - **Lock-free implementations** using atomics
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sagamesh::{
//!     Backoff, Jitter, ResilienceError, ResilienceStack, ResilienceStackBuilder, RetryPolicy,
//! };
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     // Configure the retry policy; the rest are built directly on the stack below.
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("max_attempts > 0")
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!
//!     // Compose via the stack builder (Retry → CircuitBreaker → Bulkhead → Timeout).
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStackBuilder::new()
//!         .retry(retry)
//!         .circuit_breaker(5, Duration::from_secs(30)).expect("valid breaker config")
//!         .bulkhead(32).expect("valid bulkhead config")
//!         .timeout(Duration::from_secs(2)).expect("valid timeout config")
//!         .build()
//!         .expect("valid stack");
//!
//!     stack.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod error;
mod jitter;
mod retry;
mod sleeper;
mod stack;
mod timeout;

pub mod aggregator;
pub mod breaker;
pub mod bus;
pub mod gateway;
pub mod kv;
pub mod message;
pub mod permanent_error;
pub mod presence;
pub mod publisher;
pub mod router;
pub mod telemetry;

// Re-exports: generic resilience primitives.
pub use backoff::Backoff;
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{Clock, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, MonotonicClock};
pub use error::ResilienceError;
pub use jitter::Jitter;
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder, StackError};
pub use timeout::{TimeoutError, TimeoutLayer, TimeoutPolicy, TimeoutService, MAX_TIMEOUT};

// Re-exports: saga runtime primitives.
pub use aggregator::{AggregatorError, OnboardingAggregator};
pub use breaker::{Breaker, BreakerConfig, BreakerError, BreakerRegistry, BreakerState};
pub use bus::{BusError, Delivery, DeliveryStream, InMemoryBus, Publisher, Subscriber};
pub use gateway::{ClientRegistry, GatewayError, TargetedEvent};
pub use kv::{ByteStream, InMemoryKvStore, KvError, KvStore};
pub use message::{Message, MessageContext, ShutdownHandle, ShutdownSignal};
pub use permanent_error::{is_permanent, PermanentError};
pub use presence::{PresenceError, PresenceStatus, PresenceStore, UserPresence};
pub use publisher::TracingPublisher;
pub use router::{
    ConsumerConfig, HandlerError, HandlerResult, Middleware, MessageRouter, RouterError, SagaRoute,
};

pub mod prelude;
