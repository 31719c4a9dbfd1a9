//! Sliding-window circuit breaker for outbound dependencies and consumers.
//!
//! Unlike [`crate::CircuitBreakerPolicy`] (a consecutive-failure counter kept
//! for the generic resilience stack), this breaker trips on a sliding window
//! of recent outcomes: "≥3 requests AND failure ratio ≥ 0.6" within the
//! current `window`, not a running streak.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::telemetry::{emit_best_effort, CircuitBreakerEvent, NullSink, PolicyEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for [`Breaker`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Width of the sliding window outcomes are evaluated over.
    pub window: Duration,
    /// Minimum number of requests in the window before the trip predicate applies.
    pub min_requests: usize,
    /// Failure ratio (0.0–1.0) that trips the breaker once `min_requests` is met.
    pub failure_ratio: f64,
    /// How long the breaker stays open before admitting a half-open probe.
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub max_requests: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            min_requests: 3,
            failure_ratio: 0.6,
            timeout: Duration::from_secs(30),
            max_requests: 1,
        }
    }
}

/// Error returned by [`Breaker::execute`].
///
/// `Open` is deliberately not [`crate::PermanentError`]: upstream retry
/// middleware may keep waiting for the breaker to close rather than
/// escalating straight to saga/poison.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker is open (or half-open and saturated); the handler was not invoked.
    Open,
    /// The handler ran and returned this error.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit breaker is open"),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

struct Window {
    outcomes: VecDeque<(Instant, bool)>,
}

impl Window {
    fn new() -> Self {
        Self { outcomes: VecDeque::new() }
    }

    fn prune(&mut self, now: Instant, width: Duration) {
        while let Some(&(at, _)) = self.outcomes.front() {
            if now.duration_since(at) > width {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, now: Instant, ok: bool) {
        self.outcomes.push_back((now, ok));
    }

    fn failure_ratio(&self) -> (usize, f64) {
        let total = self.outcomes.len();
        if total == 0 {
            return (0, 0.0);
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        (total, failures as f64 / total as f64)
    }
}

struct Inner {
    state: BreakerState,
    window: Window,
    opened_at: Option<Instant>,
    half_open_inflight: usize,
    half_open_admitted: usize,
}

/// Per-dependency/consumer sliding-window circuit breaker.
#[derive(Clone)]
pub struct Breaker<Sink = NullSink> {
    config: BreakerConfig,
    state: Arc<Mutex<Inner>>,
    sink: Sink,
}

impl Breaker<NullSink> {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                window: Window::new(),
                opened_at: None,
                half_open_inflight: 0,
                half_open_admitted: 0,
            })),
            sink: NullSink,
        }
    }
}

impl<Sink> Breaker<Sink>
where
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    pub fn with_sink<NewSink>(self, sink: NewSink) -> Breaker<NewSink> {
        Breaker { config: self.config, state: self.state, sink }
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().unwrap().state
    }

    /// Current `(requests, failure_ratio)` in the window.
    pub fn counts(&self) -> (usize, f64) {
        self.state.lock().unwrap().window.failure_ratio()
    }

    /// Admit the call, or fail fast if the breaker is open/saturated.
    fn admit(&self) -> bool {
        let mut inner = self.state.lock().unwrap();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("opened_at set when open");
                if now.duration_since(opened_at) >= self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_inflight = 1;
                    inner.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.max_requests {
                    inner.half_open_admitted += 1;
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn emit(&self, event: CircuitBreakerEvent) {
        emit_best_effort(self.sink.clone(), PolicyEvent::CircuitBreaker(event)).await;
    }

    fn record(&self, ok: bool) -> Option<CircuitBreakerEvent> {
        let mut inner = self.state.lock().unwrap();
        let now = Instant::now();

        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                if !ok {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.window = Window::new();
                    return Some(CircuitBreakerEvent::Opened { failure_count: 1 });
                }
                if inner.half_open_inflight == 0 && inner.half_open_admitted >= self.config.max_requests {
                    inner.state = BreakerState::Closed;
                    inner.window = Window::new();
                    inner.half_open_admitted = 0;
                    return Some(CircuitBreakerEvent::Closed);
                }
                None
            }
            BreakerState::Closed => {
                inner.window.prune(now, self.config.window);
                inner.window.push(now, ok);
                let (total, ratio) = inner.window.failure_ratio();
                if total >= self.config.min_requests && ratio >= self.config.failure_ratio {
                    let failures = (ratio * total as f64).round() as usize;
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    Some(CircuitBreakerEvent::Opened { failure_count: failures })
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    /// Run `operation` through the breaker.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if !self.admit() {
            return Err(BreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                if let Some(event) = self.record(true) {
                    self.emit(event).await;
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(event) = self.record(false) {
                    self.emit(event).await;
                }
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// Keys breakers by dependency/consumer name so callers can ask for "the
/// breaker for consumer X" without threading one through every call site.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Breaker>>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self { breakers: Arc::new(Mutex::new(HashMap::new())), default_config }
    }

    /// Get or create the breaker registered under `name`, using the registry's
    /// default config for first-time creation.
    pub fn get(&self, name: &str) -> Breaker {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Breaker::new(self.default_config))
            .clone()
    }

    /// Get or create the breaker registered under `name` with an explicit config.
    pub fn get_or_insert_with(&self, name: &str, config: BreakerConfig) -> Breaker {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.entry(name.to_string()).or_insert_with(|| Breaker::new(config)).clone()
    }
}
