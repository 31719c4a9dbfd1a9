use std::time::Duration;
use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Policy events emitted during execution.
///
/// All Saga Mesh policies emit structured events that describe their behavior.
/// These events can be collected, aggregated, and used for observability,
/// monitoring, or autonomous control.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Bulkhead events
    Bulkhead(BulkheadEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Request outcome events (emitted by all policies)
    Request(RequestOutcome),
    /// Message router / middleware chain events
    Router(RouterEvent),
    /// Saga compensation events
    Saga(SagaEvent),
    /// Poison-message / dead-letter events
    Poison(PoisonEvent),
    /// Presence store events
    Presence(PresenceEvent),
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    ///
    /// Emitted when the maximum number of retries is reached
    /// and the request still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent requests will be rejected immediately without
    /// being forwarded to the inner service.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of test requests will be allowed through
    /// to determine if the inner service has recovered.
    HalfOpen,
    /// Circuit transitioned to closed state.
    ///
    /// Normal operation resumes - all requests are forwarded.
    Closed,
}

/// Events emitted by bulkhead policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A request successfully acquired a bulkhead permit.
    ///
    /// The request will proceed to the inner service.
    Acquired {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
    /// A request was rejected due to bulkhead saturation.
    ///
    /// All available permits are in use.
    Rejected {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A request exceeded the timeout duration.
    ///
    /// The request was cancelled and an error returned.
    Occurred {
        /// The timeout duration that was exceeded
        timeout: Duration,
    },
}

/// Events emitted by the message router and its middleware chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A handler panicked and was recovered by the recoverer middleware.
    HandlerPanicked { topic: String },
    /// A message was acked after a successful handler run.
    Acked { topic: String },
    /// A message was nacked and requeued.
    Nacked { topic: String },
}

/// Events emitted by saga compensation middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    /// A compensation event was published for a failed message.
    CompensationPublished { topic: String },
    /// No failure handler was registered for the topic; the error passed through.
    NoHandlerRegistered { topic: String },
}

/// Events emitted by poison/dead-letter middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoisonEvent {
    /// A message was forwarded to the dead-letter topic.
    Forwarded { source_topic: String, reason: String },
    /// Forwarding to the dead-letter topic itself failed.
    ForwardFailed { source_topic: String },
}

/// Events emitted by the presence store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A user was marked online on a gateway instance.
    MarkedOnline { instance_id: String },
    /// A user was marked offline.
    MarkedOffline,
}

/// Request outcome events emitted by all policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
            PolicyEvent::Router(event) => write!(f, "Router::{}", event),
            PolicyEvent::Saga(event) => write!(f, "Saga::{}", event),
            PolicyEvent::Poison(event) => write!(f, "Poison::{}", event),
            PolicyEvent::Presence(event) => write!(f, "Presence::{}", event),
        }
    }
}

impl fmt::Display for RouterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterEvent::HandlerPanicked { topic } => write!(f, "HandlerPanicked({})", topic),
            RouterEvent::Acked { topic } => write!(f, "Acked({})", topic),
            RouterEvent::Nacked { topic } => write!(f, "Nacked({})", topic),
        }
    }
}

impl fmt::Display for SagaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaEvent::CompensationPublished { topic } => {
                write!(f, "CompensationPublished({})", topic)
            }
            SagaEvent::NoHandlerRegistered { topic } => {
                write!(f, "NoHandlerRegistered({})", topic)
            }
        }
    }
}

impl fmt::Display for PoisonEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoisonEvent::Forwarded { source_topic, reason } => {
                write!(f, "Forwarded({}, reason={})", source_topic, reason)
            }
            PoisonEvent::ForwardFailed { source_topic } => {
                write!(f, "ForwardFailed({})", source_topic)
            }
        }
    }
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceEvent::MarkedOnline { instance_id } => {
                write!(f, "MarkedOnline({})", instance_id)
            }
            PresenceEvent::MarkedOffline => write!(f, "MarkedOffline"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({}/{})", active_count, max_concurrency)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        PolicyEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        PolicyEvent::Bulkhead(b) => match b {
            BulkheadEvent::Acquired { active_count, max_concurrency } => json!({
                "kind": "bulkhead_acquired",
                "active": *active_count,
                "max": *max_concurrency
            }),
            BulkheadEvent::Rejected { active_count, max_concurrency } => json!({
                "kind": "bulkhead_rejected",
                "active": *active_count,
                "max": *max_concurrency
            }),
        },
        PolicyEvent::Timeout(t) => match t {
            TimeoutEvent::Occurred { timeout } => json!({
                "kind": "timeout",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
        PolicyEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
        PolicyEvent::Router(r) => match r {
            RouterEvent::HandlerPanicked { topic } => {
                json!({ "kind": "router_handler_panicked", "topic": topic })
            }
            RouterEvent::Acked { topic } => json!({ "kind": "router_acked", "topic": topic }),
            RouterEvent::Nacked { topic } => json!({ "kind": "router_nacked", "topic": topic }),
        },
        PolicyEvent::Saga(s) => match s {
            SagaEvent::CompensationPublished { topic } => {
                json!({ "kind": "saga_compensation_published", "topic": topic })
            }
            SagaEvent::NoHandlerRegistered { topic } => {
                json!({ "kind": "saga_no_handler_registered", "topic": topic })
            }
        },
        PolicyEvent::Poison(p) => match p {
            PoisonEvent::Forwarded { source_topic, reason } => json!({
                "kind": "poison_forwarded",
                "source_topic": source_topic,
                "reason": reason
            }),
            PoisonEvent::ForwardFailed { source_topic } => json!({
                "kind": "poison_forward_failed",
                "source_topic": source_topic
            }),
        },
        PolicyEvent::Presence(p) => match p {
            PresenceEvent::MarkedOnline { instance_id } => json!({
                "kind": "presence_marked_online",
                "instance_id": instance_id
            }),
            PresenceEvent::MarkedOffline => json!({ "kind": "presence_marked_offline" }),
        },
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn retry_attempt_json() {
        let v = event_to_json(&PolicyEvent::Retry(RetryEvent::Attempt {
            attempt: 3,
            delay: Duration::from_millis(150),
        }));
        assert_eq!(v["kind"], "retry_attempt");
        assert_eq!(v["attempt"], 3);
        assert_eq!(v["delay_ms"], 150);
    }

    #[test]
    fn retry_exhausted_json() {
        let v = event_to_json(&PolicyEvent::Retry(RetryEvent::Exhausted {
            total_attempts: 5,
            total_duration: Duration::from_millis(1200),
        }));
        assert_eq!(v["kind"], "retry_exhausted");
        assert_eq!(v["attempts"], 5);
        assert_eq!(v["duration_ms"], 1200);
    }

    #[test]
    fn circuit_opened_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            failure_count: 4,
        }));
        assert_eq!(v["kind"], "circuit_opened");
        assert_eq!(v["failures"], 4);
    }

    #[test]
    fn circuit_half_open_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen));
        assert_eq!(v["kind"], "circuit_half_open");
    }

    #[test]
    fn circuit_closed_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed));
        assert_eq!(v["kind"], "circuit_closed");
    }

    #[test]
    fn bulkhead_acquired_json() {
        let v = event_to_json(&PolicyEvent::Bulkhead(BulkheadEvent::Acquired {
            active_count: 2,
            max_concurrency: 5,
        }));
        assert_eq!(v["kind"], "bulkhead_acquired");
        assert_eq!(v["active"], 2);
        assert_eq!(v["max"], 5);
    }

    #[test]
    fn bulkhead_rejected_json() {
        let v = event_to_json(&PolicyEvent::Bulkhead(BulkheadEvent::Rejected {
            active_count: 5,
            max_concurrency: 5,
        }));
        assert_eq!(v["kind"], "bulkhead_rejected");
        assert_eq!(v["active"], 5);
        assert_eq!(v["max"], 5);
    }

    #[test]
    fn timeout_json() {
        let v = event_to_json(&PolicyEvent::Timeout(TimeoutEvent::Occurred {
            timeout: Duration::from_millis(2500),
        }));
        assert_eq!(v["kind"], "timeout");
        assert_eq!(v["timeout_ms"], 2500);
    }

    #[test]
    fn request_success_json() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Success {
            duration: Duration::from_millis(42),
        }));
        assert_eq!(v["kind"], "request_success");
        assert_eq!(v["duration_ms"], 42);
    }

    #[test]
    fn request_failure_json() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Failure {
            duration: Duration::from_millis(99),
        }));
        assert_eq!(v["kind"], "request_failure");
        assert_eq!(v["duration_ms"], 99);
    }

    #[test]
    fn telemetry_json_contains_no_auth_fields() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Success {
            duration: Duration::from_millis(1),
        }));
        let s = serde_json::to_string(&v).unwrap();
        assert!(
            !s.contains("auth"),
            "telemetry JSON should not carry auth payloads; got {s}"
        );
    }
}
