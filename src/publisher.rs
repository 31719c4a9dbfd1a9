//! Outbound publisher adapter: injects the active trace context into a
//! message's metadata and wraps the underlying publish call in a producer
//! span.
//!
//! Per spec §4.8, no retry happens at this layer — the router's retry
//! middleware (or the caller, for one-off publishes) owns that.
//!
//! Injection only does something once a global propagator is registered;
//! [`TracingPublisher::new`] does that the first time one is constructed,
//! via [`ensure_propagator`]. The other half of the contract lives on the
//! consumer side: [`attach_trace_context`] extracts an inbound message's
//! carrier into the active `Context` so a handler's own publish nests its
//! producer span under the right trace instead of starting a new root.

use crate::bus::{BusError, Publisher};
use crate::message::{Message, META_TRACE_CONTEXT};
use async_trait::async_trait;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Tracer, TracerProvider};
use opentelemetry::{global, Context as OtelContext, ContextGuard, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use std::sync::Once;

const TRACEPARENT_KEY: &str = "traceparent";

static PROPAGATOR_INIT: Once = Once::new();

/// Registers the process-wide W3C trace-context propagator. Idempotent and
/// cheap to call repeatedly; only the first call has any effect.
pub fn ensure_propagator() {
    PROPAGATOR_INIT.call_once(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

/// Adapts a `HashMap<String, String>` to the `opentelemetry` propagation
/// traits so trace context can be injected straight into [`Message::metadata`].
struct MetadataInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct MetadataExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Extracts `trace_context` (a [`Message::trace_context`] carrier) into the
/// active OTel context and attaches it, returning a guard that restores the
/// prior context when dropped.
///
/// The router calls this before running a consumer's middleware chain, so a
/// `TracingPublisher::publish` made from inside the handler parents its
/// producer span on the inbound message's trace rather than on whatever
/// context happened to be active on the worker task.
pub fn attach_trace_context(trace_context: Option<&str>) -> ContextGuard {
    let mut carrier = HashMap::new();
    if let Some(traceparent) = trace_context {
        carrier.insert(TRACEPARENT_KEY.to_string(), traceparent.to_string());
    }
    let cx = global::get_text_map_propagator(|propagator| propagator.extract(&MetadataExtractor(&carrier)));
    cx.attach()
}

/// Publishes through an inner [`Publisher`], attaching trace context to every
/// message and recording a producer span for the underlying transport call.
#[derive(Clone)]
pub struct TracingPublisher<P> {
    inner: P,
    service_name: &'static str,
}

impl<P> TracingPublisher<P>
where
    P: Publisher,
{
    /// Wrap `inner`; spans are recorded under `service_name`. Registers the
    /// global trace propagator on first construction (see [`ensure_propagator`]).
    pub fn new(inner: P, service_name: &'static str) -> Self {
        ensure_propagator();
        Self { inner, service_name }
    }

    fn inject_trace_context(&self, message: &mut Message) {
        // Prefer an explicit carrier already set in metadata (e.g. the
        // propagator-agnostic value used by tests); otherwise inject the
        // current ambient OTel context via the configured propagator.
        if message.metadata.contains_key(META_TRACE_CONTEXT) {
            return;
        }
        let mut carrier = HashMap::new();
        let cx = OtelContext::current();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut MetadataInjector(&mut carrier));
        });
        if let Some(traceparent) = carrier.remove(TRACEPARENT_KEY) {
            message.metadata.insert(META_TRACE_CONTEXT.to_string(), traceparent);
        }
    }
}

#[async_trait]
impl<P> Publisher for TracingPublisher<P>
where
    P: Publisher,
{
    async fn publish(&self, topic: &str, mut message: Message) -> Result<(), BusError> {
        self.inject_trace_context(&mut message);

        let tracer = global::tracer_provider().tracer(self.service_name);
        let mut span = tracer
            .span_builder(format!("publish {topic}"))
            .with_kind(SpanKind::Producer)
            .with_attributes(vec![KeyValue::new("messaging.destination", topic.to_string())])
            .start(&tracer);

        let result = self.inner.publish(topic, message).await;

        use opentelemetry::trace::Span;
        if let Err(err) = &result {
            span.record_error(err);
        }
        span.end();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::message::META_USER_ID;
    use std::collections::HashMap as Map;

    #[tokio::test]
    async fn publish_injects_a_trace_context_key() {
        let bus = InMemoryBus::default();
        let publisher = TracingPublisher::new(bus.clone(), "test-service");

        // Simulate the router having already extracted an inbound traceparent
        // and attached it as the active context before the handler runs.
        let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let _guard = attach_trace_context(Some(traceparent));

        let mut meta = Map::new();
        meta.insert(META_USER_ID.to_string(), "42".to_string());
        let message = Message::new(b"{}".to_vec(), meta);

        publisher.publish("user_created", message).await.unwrap();

        let mut stream = {
            use crate::bus::Subscriber;
            bus.subscribe("user_created").await.unwrap()
        };
        use futures::StreamExt;
        let delivered = stream.next().await.unwrap();
        assert_eq!(
            delivered.message().metadata.get(META_TRACE_CONTEXT).map(String::as_str),
            Some(traceparent)
        );
    }

    #[tokio::test]
    async fn attach_trace_context_with_no_carrier_injects_nothing() {
        let bus = InMemoryBus::default();
        let publisher = TracingPublisher::new(bus.clone(), "test-service");
        let _guard = attach_trace_context(None);

        let mut meta = Map::new();
        meta.insert(META_USER_ID.to_string(), "42".to_string());
        let message = Message::new(b"{}".to_vec(), meta);
        publisher.publish("user_created", message).await.unwrap();

        let mut stream = {
            use crate::bus::Subscriber;
            bus.subscribe("user_created").await.unwrap()
        };
        use futures::StreamExt;
        let delivered = stream.next().await.unwrap();
        assert!(!delivered.message().metadata.contains_key(META_TRACE_CONTEXT));
    }

    #[tokio::test]
    async fn existing_trace_context_is_not_overwritten() {
        let bus = InMemoryBus::default();
        let publisher = TracingPublisher::new(bus.clone(), "test-service");

        let mut meta = Map::new();
        meta.insert(META_TRACE_CONTEXT.to_string(), "caller-provided".to_string());
        let message = Message::new(b"{}".to_vec(), meta);
        publisher.publish("user_created", message).await.unwrap();

        let mut stream = {
            use crate::bus::Subscriber;
            bus.subscribe("user_created").await.unwrap()
        };
        use futures::StreamExt;
        let delivered = stream.next().await.unwrap();
        assert_eq!(
            delivered.message().metadata.get(META_TRACE_CONTEXT).map(String::as_str),
            Some("caller-provided")
        );
    }
}
