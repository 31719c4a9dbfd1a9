//! The message router: subscribes to topics, dispatches each delivery
//! through a fixed middleware chain to a named handler, and manages
//! consumer lifecycle (spec §4.6-4.7).
//!
//! The chain is a fixed composition, outermost first:
//!
//! ```text
//! Recoverer -> Poison (optional) -> Saga (optional) -> Retry -> Breaker -> Handler
//! ```
//!
//! Each layer is a [`Middleware`] wrapping the next; the router builds the
//! chain once per registered consumer at [`MessageRouter::add_consumer_handler`]
//! time; `run` just drives deliveries through it. An explicit struct
//! composition is used rather than generic `tower::Layer` stacking (see
//! `DESIGN.md`): the chain's order and the presence of optional layers are
//! invariants this module owns, not something callers should be able to
//! reorder by accident.

pub mod breaker_step;
pub mod poison;
pub mod recoverer;
pub mod retry;
pub mod saga;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use crate::breaker::{Breaker, BreakerConfig, BreakerRegistry};
use crate::bus::{Publisher, Subscriber};
use crate::message::{Message, MessageContext, ShutdownHandle, ShutdownSignal};
use crate::telemetry::{NullSink, PolicyEvent};

pub use breaker_step::{BreakerOpen, BreakerStep};
pub use poison::PoisonStep;
pub use recoverer::Recoverer;
pub use retry::{RetryConfig, RetryStep};
pub use saga::{SagaRoute, SagaStep};

/// Type-erased error returned by a middleware layer or handler.
///
/// `Send + Sync` so it can cross the `async_trait` future boundary and be
/// inspected by [`crate::permanent_error::is_permanent`] from any layer
/// without knowing the handler's concrete error type.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The result every layer in the chain (and the handler itself) returns.
/// `Ok(())` acks the message; `Err` nacks it, unless an outer layer (poison,
/// saga) converts the error into a successful compensating action.
pub type HandlerResult = Result<(), HandlerError>;

/// A single link in the middleware chain, or the terminal handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Adapts a plain async closure into a [`Middleware`], so
/// [`MessageRouter::add_consumer_handler`] can take a handler function
/// directly instead of requiring callers to define a type for it.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Message, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Middleware for FnHandler<F>
where
    F: Fn(Message, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, message: Message, context: MessageContext) -> HandlerResult {
        (self.f)(message, context).await
    }
}

/// Errors from router-level operations (registration, lifecycle), as
/// distinct from the per-message [`HandlerError`]s the chain produces.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// `add_consumer_handler` was called twice with the same name.
    #[error("a consumer named {0:?} is already registered")]
    DuplicateConsumer(String),
    /// A subscriber failed to attach to its topic (not a per-message error;
    /// this ends the whole consumer's loop).
    #[error("consumer {name:?} failed to subscribe to topic {topic:?}: {source}")]
    SubscribeFailed {
        name: String,
        topic: String,
        #[source]
        source: crate::bus::BusError,
    },
}

/// Per-consumer tunables governing the optional middleware layers and the
/// worker pool that drains its subscription.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Dead-letter topic. When set, a [`PoisonStep`] wraps the chain.
    pub dead_letter_topic: Option<String>,
    /// Saga compensation route for this consumer's topic. When set, a
    /// [`SagaStep`] wraps the chain (inside poison, outside retry).
    pub saga_route: Option<SagaRoute>,
    /// This service's name, used in compensation payloads (spec §4.5).
    pub service_name: String,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Messages from this consumer's topic processed concurrently.
    /// Default 1: strict per-partition arrival order (spec §5).
    pub worker_pool_size: usize,
}

impl ConsumerConfig {
    /// Defaults matching the onboarding pipeline's handler retry contract:
    /// no poison route, no saga route, retry defaults, breaker defaults,
    /// single-worker (strict order).
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            dead_letter_topic: None,
            saga_route: None,
            service_name: service_name.into(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            worker_pool_size: 1,
        }
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_saga_route(mut self, route: SagaRoute) -> Self {
        self.saga_route = Some(route);
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }
}

/// Builds the fixed middleware chain around `handler` per spec §4.6,
/// wiring `sink` into every layer that emits telemetry.
fn build_chain<Sink>(
    topic: &str,
    config: &ConsumerConfig,
    publisher: Arc<dyn Publisher>,
    breaker: Breaker<Sink>,
    handler: Arc<dyn Middleware>,
    sink: Sink,
) -> Arc<dyn Middleware>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    let innermost: Arc<dyn Middleware> = Arc::new(BreakerStep::new(breaker, handler));
    let retried: Arc<dyn Middleware> = Arc::new(RetryStep::new(config.retry, innermost));

    let saga_wrapped: Arc<dyn Middleware> = match &config.saga_route {
        Some(route) => Arc::new(
            SagaStep::new(topic.to_string(), route.clone(), config.service_name.clone(), publisher.clone(), retried)
                .with_sink(sink.clone()),
        ),
        None => retried,
    };

    let poison_wrapped: Arc<dyn Middleware> = match &config.dead_letter_topic {
        Some(dlq_topic) => Arc::new(
            PoisonStep::new(topic.to_string(), dlq_topic.clone(), publisher, saga_wrapped).with_sink(sink.clone()),
        ),
        None => saga_wrapped,
    };

    Arc::new(Recoverer::new(topic.to_string(), poison_wrapped).with_sink(sink))
}

struct RegisteredConsumer {
    topic: String,
    subscriber: Arc<dyn Subscriber>,
    chain: Arc<dyn Middleware>,
    worker_pool_size: usize,
}

/// Subscribes to topics, dispatches each delivery through the chain built
/// for its consumer, and runs until the host context is canceled (spec
/// §4.7).
///
/// One router per service process; consumers are registered up front via
/// [`Self::add_consumer_handler`], then [`Self::run`] drives them all until
/// shutdown.
pub struct MessageRouter<Sink = NullSink> {
    publisher: Arc<dyn Publisher>,
    breakers: BreakerRegistry,
    consumers: Mutex<HashMap<String, RegisteredConsumer>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
    sink: Sink,
}

impl MessageRouter<NullSink> {
    /// Build a router publishing saga/poison compensations through
    /// `publisher`.
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        Self {
            publisher,
            breakers: BreakerRegistry::default(),
            consumers: Mutex::new(HashMap::new()),
            shutdown_handle,
            shutdown_signal,
            sink: NullSink,
        }
    }
}

impl<Sink> MessageRouter<Sink>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    /// Replace this router's telemetry sink, rebuilding with a fresh (empty)
    /// consumer/breaker registry. Intended to be called immediately after
    /// [`MessageRouter::new`], before any consumers are registered.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> MessageRouter<NewSink> {
        MessageRouter {
            publisher: self.publisher,
            breakers: self.breakers,
            consumers: self.consumers,
            shutdown_handle: self.shutdown_handle,
            shutdown_signal: self.shutdown_signal,
            sink,
        }
    }

    /// Register a named processing path for `topic`. Rejects a duplicate
    /// `name` (spec §4.7).
    pub fn add_consumer_handler<F, Fut>(
        &self,
        name: impl Into<String>,
        topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        config: ConsumerConfig,
        handler: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(Message, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        let topic = topic.into();
        let mut consumers = self.consumers.lock().unwrap();
        if consumers.contains_key(&name) {
            return Err(RouterError::DuplicateConsumer(name));
        }

        let breaker = self.breakers.get_or_insert_with(&name, config.breaker).with_sink(self.sink.clone());
        let handler: Arc<dyn Middleware> = Arc::new(FnHandler::new(handler));
        let chain = build_chain(&topic, &config, self.publisher.clone(), breaker, handler, self.sink.clone());

        consumers.insert(
            name,
            RegisteredConsumer { topic, subscriber, chain, worker_pool_size: config.worker_pool_size },
        );
        Ok(())
    }

    /// Run every registered consumer until shutdown is signaled.
    ///
    /// Each consumer owns an independent task that reads its subscription
    /// and dispatches deliveries through a bounded worker pool (default
    /// concurrency 1, for strict per-partition order). Topics run fully
    /// concurrently with each other; this call blocks until every consumer
    /// loop exits, which happens on shutdown or on a fatal subscribe
    /// failure.
    pub async fn run(&self) -> Result<(), RouterError> {
        let consumers: Vec<(String, RegisteredConsumer)> = {
            let mut guard = self.consumers.lock().unwrap();
            guard.drain().collect()
        };

        let mut tasks = Vec::with_capacity(consumers.len());
        for (name, consumer) in consumers {
            let shutdown = self.shutdown_signal.clone();
            tasks.push(run_consumer(name, consumer, shutdown));
        }

        let results = futures::future::join_all(tasks).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Signal every in-flight consumer loop to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown_handle.shutdown();
    }
}

async fn run_consumer(
    name: String,
    consumer: RegisteredConsumer,
    mut shutdown: ShutdownSignal,
) -> Result<(), RouterError> {
    let mut stream = consumer.subscriber.subscribe(&consumer.topic).await.map_err(|source| {
        RouterError::SubscribeFailed { name: name.clone(), topic: consumer.topic.clone(), source }
    })?;

    let semaphore = Arc::new(tokio::sync::Semaphore::new(consumer.worker_pool_size.max(1)));
    let mut in_flight = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => {
                let Some(delivery) = next else { break };
                let chain = consumer.chain.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let topic = consumer.topic.clone();
                in_flight.push(tokio::spawn(async move {
                    let _permit = permit;
                    let context = delivery.context().clone();
                    let message = delivery.message().clone();
                    // Attach the inbound trace carrier (if any) as the active
                    // OTel context for the duration of the chain, so a
                    // `TracingPublisher::publish` made from inside the
                    // handler nests its producer span under this message's
                    // trace instead of starting a disconnected root.
                    let _trace_guard = crate::publisher::attach_trace_context(context.trace_context());
                    match chain.call(message, context).await {
                        Ok(()) => delivery.ack(),
                        Err(err) => {
                            tracing::warn!(topic = %topic, error = %err, "message processing failed; nacking");
                            delivery.nack();
                        }
                    }
                }));
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }
    Ok(())
}
