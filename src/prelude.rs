//! Convenient re-exports for common Saga Mesh types.
pub use crate::{
    backoff::Backoff,
    bulkhead::BulkheadPolicy,
    circuit_breaker::{Clock, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, MonotonicClock},
    jitter::Jitter,
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    stack::{ResilienceStack, ResilienceStackBuilder, StackError},
    telemetry::{
        BulkheadEvent, CircuitBreakerEvent, FallbackSink, LogSink, MemorySink, MulticastSink,
        NullSink, PoisonEvent, PolicyEvent, PresenceEvent, RequestOutcome, RetryEvent,
        RouterEvent, SagaEvent, StreamingSink, TelemetrySink, TimeoutEvent,
    },
    timeout::{TimeoutError, TimeoutLayer, TimeoutPolicy, TimeoutService, MAX_TIMEOUT},
    ResilienceError,
};

pub use crate::{
    aggregator::{AggregatorError, OnboardingAggregator},
    breaker::{Breaker, BreakerConfig, BreakerError, BreakerRegistry, BreakerState},
    bus::{BusError, Delivery, DeliveryStream, InMemoryBus, Publisher, Subscriber},
    gateway::{ClientRegistry, GatewayError, TargetedEvent},
    kv::{ByteStream, InMemoryKvStore, KvError, KvStore},
    message::{topics, Message, MessageContext, ShutdownHandle, ShutdownSignal},
    permanent_error::{is_permanent, PermanentError},
    presence::{PresenceError, PresenceStatus, PresenceStore, UserPresence},
    publisher::TracingPublisher,
    router::{
        BreakerOpen, ConsumerConfig, HandlerError, HandlerResult, Middleware, MessageRouter,
        RetryConfig as RouterRetryConfig, RouterError, SagaRoute,
    },
};
