//! # Event Bus Implementation
//!
//! The EventBus is the central messaging hub for colloquy's event-driven
//! architecture. It maps event-name patterns (exact or single-segment
//! wildcard) to ordered lists of handlers and dispatches each emitted event
//! to every matching handler, collecting the per-handler results.
//!
//! ## Design Decisions
//!
//! The bus uses an explicit handler registry rather than a broadcast channel:
//!
//! 1. Dispatch order must be deterministic (priority, then registration order)
//! 2. The emitting caller receives the aggregate list of handler results and
//!    decides how to treat partial failure
//! 3. A handler-attached filter can skip delivery without recording an error
//!
//! The registry is write-at-startup and read-mostly afterwards; matching
//! registrations are snapshotted out of the lock before any handler runs, so
//! handlers may themselves emit events.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::filter::EventFilter;
use super::transformer::TransformerEngine;

/// Event payload value. JSON-compatible so the wire envelope round-trips
/// through `serde_json` unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Null,
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Correlation identifiers propagated across an entire causal chain.
///
/// * `correlation_id` is shared by all events of one logical operation
/// * `chain_id` is shared by an originating request and every injected
///   follow-up it spawns
/// * `depth` counts injected hops since the chain began
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub request_id: String,
    pub correlation_id: String,
    pub chain_id: String,
    pub conversation_id: String,
    pub originator_id: String,
    pub depth: u32,
}

impl EventContext {
    /// Context for the start of a brand-new chain.
    pub fn root(originator_id: &str, conversation_id: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            chain_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            originator_id: originator_id.to_string(),
            depth: 0,
        }
    }

}

/// A discrete message: namespaced name (`namespace:action`), payload map and
/// causal context. Immutable once dispatched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: HashMap<String, Value>,
    pub context: EventContext,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    /// Dotted-path lookup into the payload. `a.b.c` descends through nested
    /// maps; a missing segment resolves to `None`, never an error.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn namespace(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }
}

pub fn lookup_path<'a>(payload: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = payload.get(segments.next()?)?;
    for segment in segments {
        match current {
            Value::Map(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Wire/log format: `{"event": ..., "data": {...}, "context": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "event")]
    pub name: String,
    pub data: HashMap<String, Value>,
    pub context: EventContext,
}

impl From<Event> for EventEnvelope {
    fn from(event: Event) -> Self {
        Self {
            name: event.name,
            data: event.payload,
            context: event.context,
        }
    }
}

impl From<EventEnvelope> for Event {
    fn from(envelope: EventEnvelope) -> Self {
        Self {
            name: envelope.name,
            payload: envelope.data,
            context: envelope.context,
        }
    }
}

/// Dispatch order: First before Normal before Last; ties broken by
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HandlerPriority {
    First,
    #[default]
    Normal,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, EventResult<Value>> + Send + Sync>;

struct HandlerRegistration {
    id: HandlerId,
    pattern: String,
    priority: HandlerPriority,
    seq: u64,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

/// Outcome of one handler invocation. Handlers skipped by their filter do not
/// appear in the result list at all.
#[derive(Debug)]
pub struct HandlerResult {
    pub handler_id: HandlerId,
    pub outcome: EventResult<Value>,
}

/// Pattern match for namespaced event names. A `*` segment matches exactly
/// one segment: `completion:*` matches `completion:result` but not
/// `completion:sub:result`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let name_segments: Vec<&str> = name.split(':').collect();
    if pattern_segments.len() != name_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(name_segments.iter())
        .all(|(p, n)| *p == "*" || p == n)
}

/// # EventBus
///
/// Process-wide registry mapping event-name patterns to ordered handler
/// lists. `emit` dispatches to every matching handler and returns the
/// per-handler results; a handler error never prevents sibling handlers from
/// running.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<HandlerRegistration>>,
    next_id: AtomicU64,
    transformers: Option<Arc<TransformerEngine>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that routes every emission through `transformers` first, so
    /// registered rules see internally published events too.
    pub fn with_transformers(transformers: Arc<TransformerEngine>) -> Self {
        Self {
            transformers: Some(transformers),
            ..Self::default()
        }
    }

    /// Registers a handler for `pattern` with an optional delivery filter.
    pub fn register(
        &self,
        pattern: &str,
        priority: HandlerPriority,
        filter: Option<EventFilter>,
        handler: EventHandler,
    ) -> HandlerId {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = HandlerId(seq);
        let registration = HandlerRegistration {
            id,
            pattern: pattern.to_string(),
            priority,
            seq,
            filter,
            handler,
        };
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        handlers.push(registration);
        handlers.sort_by_key(|r| (r.priority, r.seq));
        debug!(pattern, %priority, "handler registered");
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .len()
    }

    /// Dispatches `event` to all matching handlers in priority order, then
    /// dispatches every event the transformer engine (if attached) derives
    /// from it. Derived events are not transformed again, so rules never
    /// recurse.
    ///
    /// A handler whose filter evaluates false is skipped without recording an
    /// error. A handler error is captured as a per-handler result; sibling
    /// handlers still run.
    pub async fn emit(&self, event: Event) -> Vec<HandlerResult> {
        let derived = self
            .transformers
            .as_ref()
            .map(|engine| engine.apply(&event))
            .unwrap_or_default();
        let results = self.dispatch(event).await;
        for target in derived {
            self.dispatch(target).await;
        }
        results
    }

    async fn dispatch(&self, event: Event) -> Vec<HandlerResult> {
        debug_event("Emitting", &event);
        // Snapshot matching registrations so handlers can re-enter the bus.
        let matching: Vec<(HandlerId, EventHandler)> = {
            let handlers = self.handlers.read().expect("handler registry poisoned");
            handlers
                .iter()
                .filter(|r| pattern_matches(&r.pattern, &event.name))
                .filter(|r| match &r.filter {
                    Some(filter) => {
                        let passed = filter.evaluate(&event);
                        if !passed {
                            trace!(event = %event.name, handler = ?r.id, "filter rejected, skipping handler");
                        }
                        passed
                    }
                    None => true,
                })
                .map(|r| (r.id, r.handler.clone()))
                .collect()
        };

        let mut results = Vec::with_capacity(matching.len());
        for (handler_id, handler) in matching {
            let outcome = handler(event.clone()).await;
            if let Err(e) = &outcome {
                warn!(event = %event.name, handler = ?handler_id, error = %e, "handler failed");
            }
            results.push(HandlerResult {
                handler_id,
                outcome,
            });
        }
        results
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    // Status queries are high-volume; keep them at trace.
    if event.name.ends_with(":queue_status") || event.name.ends_with(":lock_status") {
        trace!("{} Event: {:?}", prefix, event);
    } else {
        debug!("{} Event: {:?}", prefix, event);
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("Invalid event payload: {message}")]
    InvalidPayload { message: String },

    #[error("Invalid transformer rule: {message}")]
    InvalidRule { message: String },

    #[error("Invalid filter pattern: {0}")]
    InvalidFilterPattern(#[from] regex::Error),

    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request builder failed: {0}")]
    BuilderFailed(String),
}

pub type EventResult<T> = Result<T, EventError>;
