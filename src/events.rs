//! Per-service event stream with rolling operation metrics.
//!
//! Every manager owns one [`EventBus`] tagged with its source name. Observers
//! subscribe either to a single event type or to everything the bus emits,
//! through a callback or a channel. Handlers run outside the bus lock, so a
//! handler may emit or subscribe again without deadlocking; a subscriber
//! registered while an event is being delivered only sees later events.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::errors::{TaskError, TaskResult};

/// Samples kept for the rolling latency average.
const METRICS_WINDOW: usize = 100;
/// A service is unhealthy at or above this error rate.
const MAX_HEALTHY_ERROR_RATE: f64 = 0.10;
/// A service is unhealthy at or above this average latency.
const MAX_HEALTHY_AVERAGE_MS: f64 = 5000.0;

pub const OPERATION_START: &str = "operation:start";
pub const OPERATION_COMPLETE: &str = "operation:complete";
pub const OPERATION_FAILED: &str = "operation:failed";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Error record carried on the event channel. Built from the same
/// [`TaskError`] that is returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServiceError {
    pub fn from_error(error: &TaskError, source: &str) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            details: error.details(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub operation_count: u64,
    pub error_count: u64,
    pub average_response_ms: f64,
    pub last_operation_at: Option<DateTime<Utc>>,
}

impl ServiceMetrics {
    /// Failures over every finished operation, successful or not.
    pub fn error_rate(&self) -> f64 {
        let total = self.operation_count + self.error_count;
        if total == 0 {
            return 0.0;
        }
        self.error_count as f64 / total as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub source: String,
    pub healthy: bool,
    pub error_rate: f64,
    pub metrics: ServiceMetrics,
}

/// Encodes a record as an event payload; records that fail to encode are sent
/// as `null` rather than dropping the event.
pub fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub type EventHandler = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    All,
    Event(String),
}

impl Topic {
    fn matches(&self, event_type: &str) -> bool {
        match self {
            Topic::All => true,
            Topic::Event(t) => t == event_type,
        }
    }
}

struct Subscriber {
    id: u64,
    topic: Topic,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    disposed: bool,
}

#[derive(Debug, Default)]
struct MetricsState {
    samples: VecDeque<f64>,
    operation_count: u64,
    error_count: u64,
    last_operation_at: Option<DateTime<Utc>>,
}

impl MetricsState {
    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn record_success(&mut self, duration_ms: f64) {
        if self.samples.len() == METRICS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);
        self.operation_count += 1;
        self.last_operation_at = Some(Utc::now());
    }

    fn record_failure(&mut self) {
        self.error_count += 1;
        self.last_operation_at = Some(Utc::now());
    }
}

pub struct EventBus {
    source: String,
    state: Arc<Mutex<BusState>>,
    metrics: Mutex<MetricsState>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("subscribers", &state.subscribers.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl EventBus {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: Arc::new(Mutex::new(BusState::default())),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Delivers an event to every matching subscriber, in registration order.
    /// A no-op once the bus is disposed.
    pub fn emit(&self, event_type: &str, payload: Value) {
        let handlers: Vec<EventHandler> = {
            let state = self.state.lock();
            if state.disposed {
                return;
            }
            state
                .subscribers
                .iter()
                .filter(|s| s.topic.matches(event_type))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        tracing::trace!(source = %self.source, event_type, subscribers = handlers.len(), "emit");
        if handlers.is_empty() {
            return;
        }

        let event = ServiceEvent {
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            source: self.source.clone(),
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// Emits `error` as a [`ServiceError`] payload under `event_type`.
    pub fn report_error(&self, event_type: &str, error: &TaskError) {
        let record = ServiceError::from_error(error, &self.source);
        match serde_json::to_value(&record) {
            Ok(payload) => self.emit(event_type, payload),
            Err(e) => tracing::warn!(source = %self.source, "failed to encode error event: {}", e),
        }
    }

    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.register(Topic::Event(event_type.to_string()), Arc::new(handler))
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.register(Topic::All, Arc::new(handler))
    }

    /// Channel form of [`subscribe`](Self::subscribe). The receiver closes
    /// when the bus is disposed or the subscription is dropped from the bus.
    pub fn subscribe_channel(
        &self,
        event_type: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(event_type, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    pub fn subscribe_all_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    fn register(&self, topic: Topic, handler: EventHandler) -> Subscription {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.disposed {
            state.subscribers.push(Subscriber { id, topic, handler });
        }
        Subscription {
            id,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Runs `operation`, bracketing it with start/complete/failed events and
    /// recording its latency or failure in the service metrics. The error, if
    /// any, is returned unchanged.
    pub async fn track_operation<T, F>(&self, name: &str, operation: F) -> TaskResult<T>
    where
        F: Future<Output = TaskResult<T>>,
    {
        self.emit(OPERATION_START, serde_json::json!({ "operation": name }));
        let started = tokio::time::Instant::now();

        match operation.await {
            Ok(value) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.metrics.lock().record_success(duration_ms);
                self.emit(
                    OPERATION_COMPLETE,
                    serde_json::json!({ "operation": name, "durationMs": duration_ms }),
                );
                Ok(value)
            }
            Err(error) => {
                self.metrics.lock().record_failure();
                let record = ServiceError::from_error(&error, &self.source);
                tracing::debug!(
                    source = %self.source,
                    operation = name,
                    code = %record.code,
                    "operation failed: {}",
                    record.message
                );
                self.emit(
                    OPERATION_FAILED,
                    serde_json::json!({ "operation": name, "error": record }),
                );
                Err(error)
            }
        }
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let metrics = self.metrics.lock();
        ServiceMetrics {
            operation_count: metrics.operation_count,
            error_count: metrics.error_count,
            average_response_ms: metrics.average(),
            last_operation_at: metrics.last_operation_at,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let metrics = self.metrics();
        let error_rate = metrics.error_rate();
        ServiceStatus {
            source: self.source.clone(),
            healthy: error_rate < MAX_HEALTHY_ERROR_RATE
                && metrics.average_response_ms < MAX_HEALTHY_AVERAGE_MS,
            error_rate,
            metrics,
        }
    }

    /// Drops every subscriber and turns further emission into a no-op.
    pub fn dispose(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.subscribers)
        };
        tracing::debug!(source = %self.source, dropped = subscribers.len(), "event bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// Handle returned by every subscribe call.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusState>>,
}

impl Subscription {
    /// Removes the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(state) = self.bus.upgrade() {
            state.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}
