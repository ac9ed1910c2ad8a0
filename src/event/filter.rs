//! Handler-attached delivery predicates.
//!
//! Filters are evaluated against `(name, payload, context)` before a handler
//! runs; a failing filter skips the handler without recording an error. All
//! filters are pure with respect to the event except the sliding-window rate
//! limiter, which owns its counter behind a mutex so it stays safe under
//! concurrent invocation from multiple dispatch paths.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::trace;

use super::event_bus::{Event, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MatchOp {
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
}

#[derive(Debug)]
pub enum EventFilter {
    /// Field comparison with dotted-path nested access.
    ContentMatch {
        path: String,
        op: MatchOp,
        value: Value,
    },
    /// Regex match against a string field.
    ContentRegex { path: String, pattern: Regex },
    /// Pass only events whose originator is in the set.
    SourceAllow(HashSet<String>),
    /// Drop events whose originator is in the set.
    SourceDeny(HashSet<String>),
    /// At most `max_events` per sliding `window`; counter is per filter
    /// instance.
    RateLimit(RateLimiter),
    /// Required fields present, forbidden fields absent (dotted paths).
    Shape {
        required: Vec<String>,
        forbidden: Vec<String>,
    },
    /// All inner filters must pass.
    All(Vec<EventFilter>),
    /// Any inner filter may pass.
    Any(Vec<EventFilter>),
}

impl EventFilter {
    pub fn content_eq(path: &str, value: Value) -> Self {
        Self::ContentMatch {
            path: path.to_string(),
            op: MatchOp::Eq,
            value,
        }
    }

    pub fn content_match(path: &str, op: MatchOp, value: Value) -> Self {
        Self::ContentMatch {
            path: path.to_string(),
            op,
            value,
        }
    }

    pub fn content_regex(path: &str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::ContentRegex {
            path: path.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn allow_sources<I: IntoIterator<Item = S>, S: Into<String>>(sources: I) -> Self {
        Self::SourceAllow(sources.into_iter().map(Into::into).collect())
    }

    pub fn deny_sources<I: IntoIterator<Item = S>, S: Into<String>>(sources: I) -> Self {
        Self::SourceDeny(sources.into_iter().map(Into::into).collect())
    }

    pub fn rate_limit(max_events: usize, window: Duration) -> Self {
        Self::RateLimit(RateLimiter::new(max_events, window))
    }

    pub fn require_fields<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::Shape {
            required: fields.into_iter().map(Into::into).collect(),
            forbidden: Vec::new(),
        }
    }

    pub fn forbid_fields<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::Shape {
            required: Vec::new(),
            forbidden: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn all(filters: Vec<EventFilter>) -> Self {
        Self::All(filters)
    }

    pub fn any(filters: Vec<EventFilter>) -> Self {
        Self::Any(filters)
    }

    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            Self::ContentMatch { path, op, value } => match event.lookup(path) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
            Self::ContentRegex { path, pattern } => event
                .lookup(path)
                .and_then(Value::as_str)
                .map(|s| pattern.is_match(s))
                .unwrap_or(false),
            Self::SourceAllow(sources) => sources.contains(&event.context.originator_id),
            Self::SourceDeny(sources) => !sources.contains(&event.context.originator_id),
            Self::RateLimit(limiter) => limiter.allow(),
            Self::Shape {
                required,
                forbidden,
            } => {
                required.iter().all(|path| event.lookup(path).is_some())
                    && forbidden.iter().all(|path| event.lookup(path).is_none())
            }
            Self::All(filters) => filters.iter().all(|f| f.evaluate(event)),
            Self::Any(filters) => filters.iter().any(|f| f.evaluate(event)),
        }
    }
}

fn compare(actual: &Value, op: MatchOp, expected: &Value) -> bool {
    match op {
        MatchOp::Eq => actual == expected,
        MatchOp::Ne => actual != expected,
        MatchOp::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::List(items), needle) => items.contains(needle),
            (Value::Map(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        MatchOp::Gt => ordered(actual, expected).map(|o| o.is_gt()).unwrap_or(false),
        MatchOp::Lt => ordered(actual, expected).map(|o| o.is_lt()).unwrap_or(false),
    }
}

fn ordered(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        _ => None,
    }
}

/// Sliding-window counter. Timestamps older than the window are pruned on
/// each call; the window never blocks, it only answers pass/fail.
#[derive(Debug)]
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter poisoned");
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max_events {
            trace!(max = self.max_events, "rate limit exceeded");
            return false;
        }
        hits.push_back(now);
        true
    }
}
