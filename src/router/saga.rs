//! Per-topic compensation: when a handler's retries are exhausted, publish a
//! compensating event instead of falling through to the generic dead-letter
//! path.

use std::collections::HashMap as StdMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::bus::Publisher;
use crate::message::{Message, MessageContext, META_USER_ID};
use crate::telemetry::{emit_best_effort, NullSink, PolicyEvent, SagaEvent};

use super::{HandlerResult, Middleware};

/// Where a given source topic's terminal failures should be compensated.
/// One per consumer (`ConsumerConfig::saga_route`) — there is no routing
/// table, since a consumer only ever handles one source topic.
#[derive(Debug, Clone)]
pub struct SagaRoute {
    pub compensation_topic: String,
}

/// Extracts a user id from metadata first, falling back to a best-effort
/// scrape of the JSON payload.
fn extract_user_id(message: &Message) -> Option<String> {
    if let Some(id) = message.user_id() {
        return Some(id.to_string());
    }
    let parsed: JsonValue = serde_json::from_slice(&message.payload).ok()?;
    parsed.get("user_id").and_then(|v| v.as_str()).map(str::to_string)
}

fn compensation_message(user_id: Option<&str>, reason: &str, service_name: &str) -> Message {
    let payload = serde_json::json!({
        "user_id": user_id,
        "reason": reason,
        "source": service_name,
    });
    let mut metadata = StdMap::new();
    if let Some(id) = user_id {
        metadata.insert(META_USER_ID.to_string(), id.to_string());
    }
    Message::new(payload.to_string().into_bytes(), metadata)
}

pub struct SagaStep<Sink = NullSink> {
    source_topic: String,
    route: SagaRoute,
    service_name: String,
    publisher: Arc<dyn Publisher>,
    inner: Arc<dyn Middleware>,
    sink: Sink,
}

impl SagaStep<NullSink> {
    pub fn new(
        source_topic: impl Into<String>,
        route: SagaRoute,
        service_name: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        inner: Arc<dyn Middleware>,
    ) -> Self {
        Self {
            source_topic: source_topic.into(),
            route,
            service_name: service_name.into(),
            publisher,
            inner,
            sink: NullSink,
        }
    }
}

impl<Sink> SagaStep<Sink> {
    pub fn with_sink<NewSink>(self, sink: NewSink) -> SagaStep<NewSink> {
        SagaStep {
            source_topic: self.source_topic,
            route: self.route,
            service_name: self.service_name,
            publisher: self.publisher,
            inner: self.inner,
            sink,
        }
    }
}

#[async_trait]
impl<Sink> Middleware for SagaStep<Sink>
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
                let user_id = extract_user_id(&snapshot);
                let compensation = compensation_message(user_id.as_deref(), &err.to_string(), &self.service_name);

                match self.publisher.publish(&self.route.compensation_topic, compensation).await {
                    Ok(()) => {
                        tracing::info!(
                            source_topic = %self.source_topic,
                            compensation_topic = %self.route.compensation_topic,
                            "published compensation event"
                        );
                        emit_best_effort(
                            self.sink.clone(),
                            PolicyEvent::Saga(SagaEvent::CompensationPublished {
                                topic: self.route.compensation_topic.clone(),
                            }),
                        )
                        .await;
                        Ok(())
                    }
                    Err(_publish_err) => Err(err),
                }
            }
        }
    }
}
