//! Declarative event transformation.
//!
//! A transformer rule matches a source event by pattern, optionally gates on
//! a condition, and re-emits a target event whose fields are computed from
//! the source payload. Rules are data, not code: conditions and mappings are
//! a small tagged-expression form that also round-trips through the
//! `router:register_transformer` wire record.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::event_bus::{pattern_matches, Event, EventError, EventResult, Value};

/// Where a destination field gets its value from.
///
/// Wire form: a bare string is a dotted path into the source payload; a
/// literal is written `{"literal": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Literal { literal: Value },
    Path(String),
}

/// Either the `"*"` pass-through shortcut or a per-field mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMapping {
    /// Copy the entire source payload verbatim.
    PassThrough,
    Fields(HashMap<String, FieldSource>),
}

/// Boolean gate evaluated against the source payload and context.
///
/// Paths starting with `context.` resolve against the event context; all
/// other paths resolve against the payload. A missing path makes the
/// comparison false, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Exists { path: String },
    Eq { path: String, value: Value },
    Ne { path: String, value: Value },
    Gt { path: String, value: Value },
    Lt { path: String, value: Value },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            Self::Exists { path } => resolve(event, path).is_some(),
            Self::Eq { path, value } => resolve(event, path) == Some(value.clone()),
            Self::Ne { path, value } => {
                matches!(resolve(event, path), Some(actual) if actual != *value)
            }
            Self::Gt { path, value } => numeric_cmp(event, path, value)
                .map(|o| o.is_gt())
                .unwrap_or(false),
            Self::Lt { path, value } => numeric_cmp(event, path, value)
                .map(|o| o.is_lt())
                .unwrap_or(false),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(event)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(event)),
            Self::Not { condition } => !condition.evaluate(event),
        }
    }
}

fn resolve(event: &Event, path: &str) -> Option<Value> {
    if let Some(context_field) = path.strip_prefix("context.") {
        let ctx = &event.context;
        return match context_field {
            "request_id" => Some(Value::from(ctx.request_id.as_str())),
            "correlation_id" => Some(Value::from(ctx.correlation_id.as_str())),
            "chain_id" => Some(Value::from(ctx.chain_id.as_str())),
            "conversation_id" => Some(Value::from(ctx.conversation_id.as_str())),
            "originator_id" => Some(Value::from(ctx.originator_id.as_str())),
            "depth" => Some(Value::from(ctx.depth)),
            _ => None,
        };
    }
    event.lookup(path).cloned()
}

fn numeric_cmp(event: &Event, path: &str, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = resolve(event, path)?;
    match (&actual, expected) {
        (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformerRule {
    pub source_pattern: String,
    pub target_event: String,
    pub mapping: FieldMapping,
    pub condition: Option<Condition>,
}

impl TransformerRule {
    pub fn pass_through(source_pattern: &str, target_event: &str) -> Self {
        Self {
            source_pattern: source_pattern.to_string(),
            target_event: target_event.to_string(),
            mapping: FieldMapping::PassThrough,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Wire record for `router:register_transformer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerRecord {
    pub source: String,
    pub target: String,
    pub mapping: MappingRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingRecord {
    Shorthand(String),
    Fields(HashMap<String, FieldSource>),
}

impl TryFrom<TransformerRecord> for TransformerRule {
    type Error = EventError;

    fn try_from(record: TransformerRecord) -> EventResult<Self> {
        let mapping = match record.mapping {
            MappingRecord::Shorthand(s) if s == "*" => FieldMapping::PassThrough,
            MappingRecord::Shorthand(other) => {
                return Err(EventError::InvalidRule {
                    message: format!("unknown mapping shorthand: {:?}", other),
                })
            }
            MappingRecord::Fields(fields) => FieldMapping::Fields(fields),
        };
        Ok(Self {
            source_pattern: record.source,
            target_event: record.target,
            mapping,
            condition: record.condition,
        })
    }
}

impl TransformerRule {
    /// Parses a rule from an event payload (the `router:register_transformer`
    /// surface).
    pub fn from_payload(payload: &HashMap<String, Value>) -> EventResult<Self> {
        let json = serde_json::to_value(payload)?;
        let record: TransformerRecord = serde_json::from_value(json)?;
        record.try_into()
    }
}

/// Applies every registered rule to incoming events, producing fully
/// constructed target events for the bus.
#[derive(Default)]
pub struct TransformerEngine {
    rules: RwLock<Vec<TransformerRule>>,
}

impl TransformerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rule: TransformerRule) {
        debug!(source = %rule.source_pattern, target = %rule.target_event, "transformer registered");
        self.rules.write().expect("rule table poisoned").push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().expect("rule table poisoned").len()
    }

    /// For every rule whose pattern matches and whose condition (if present)
    /// holds, construct one target event. An unsatisfied condition produces
    /// no output and is not an error.
    pub fn apply(&self, event: &Event) -> Vec<Event> {
        let rules = self.rules.read().expect("rule table poisoned");
        let mut targets = Vec::new();
        for rule in rules.iter() {
            if !pattern_matches(&rule.source_pattern, &event.name) {
                continue;
            }
            if let Some(condition) = &rule.condition {
                if !condition.evaluate(event) {
                    trace!(rule = %rule.target_event, "condition unsatisfied, no output");
                    continue;
                }
            }
            let payload = match &rule.mapping {
                FieldMapping::PassThrough => event.payload.clone(),
                FieldMapping::Fields(fields) => {
                    let mut payload = HashMap::new();
                    for (dest, source) in fields {
                        match source {
                            FieldSource::Path(path) => {
                                // Missing source paths resolve to absent.
                                if let Some(value) = resolve(event, path) {
                                    payload.insert(dest.clone(), value);
                                }
                            }
                            FieldSource::Literal { literal } => {
                                payload.insert(dest.clone(), literal.clone());
                            }
                        }
                    }
                    payload
                }
            };
            targets.push(Event {
                name: rule.target_event.clone(),
                payload,
                context: event.context.clone(),
            });
        }
        targets
    }
}
