//! Completion request data model.
//!
//! A [`CompletionRequest`] is the unit of admission, ordering and delivery.
//! Lifecycle: created on submission → queued → dispatched (exactly once) →
//! terminal (result or error). A request is never re-ordered after dispatch
//! begins.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::event_bus::{Event, EventContext, EventError, EventResult, Value};
use crate::provider::TokenUsage;

/// Scheduling priority. A closed enum with a total order keeps dispatch
/// deterministic; `Critical` dispatches before `Background`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// What completion outcome triggers injection routing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    OnResult,
    OnError,
    Always,
}

/// Follow-up policy owned by the request that declares it; consumed once by
/// the injection router after that request's result arrives. Limits absent
/// here fall back to the configured breaker defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub trigger_type: TriggerType,

    /// Ordered, de-duplicated on construction.
    #[serde(default)]
    pub target_conversation_ids: Vec<String>,

    #[serde(default)]
    pub follow_up_guidance: String,

    #[serde(default)]
    pub max_depth: Option<u32>,

    #[serde(default)]
    pub token_budget: Option<u64>,

    #[serde(default, with = "opt_duration_ms")]
    pub time_window: Option<Duration>,
}

impl InjectionConfig {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(targets: I) -> Self {
        let mut seen = std::collections::HashSet::new();
        let target_conversation_ids = targets
            .into_iter()
            .map(Into::into)
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self {
            enabled: true,
            trigger_type: TriggerType::default(),
            target_conversation_ids,
            follow_up_guidance: String::new(),
            max_depth: None,
            token_budget: None,
            time_window: None,
        }
    }

    pub fn with_guidance(mut self, guidance: &str) -> Self {
        self.follow_up_guidance = guidance.to_string();
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_token_budget(mut self, token_budget: u64) -> Self {
        self.token_budget = Some(token_budget);
        self
    }

    pub fn with_time_window(mut self, time_window: Duration) -> Self {
        self.time_window = Some(time_window);
        self
    }

    pub fn triggers_on(&self, outcome: &CompletionOutcome) -> bool {
        match self.trigger_type {
            TriggerType::OnResult => matches!(outcome, CompletionOutcome::Result { .. }),
            TriggerType::OnError => matches!(outcome, CompletionOutcome::Error { .. }),
            TriggerType::Always => true,
        }
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub request_id: String,
    pub conversation_id: String,
    pub chain_id: String,
    /// Injected hops since the chain began; 0 for top-level requests.
    pub depth: u32,
    pub priority: Priority,
    pub prompt_ref: String,
    pub provider_hint: Option<String>,
    pub injection_config: Option<InjectionConfig>,
    pub submitted_at: DateTime<Utc>,
}

impl CompletionRequest {
    pub fn builder() -> CompletionRequestBuilder {
        CompletionRequestBuilder::default()
    }

    /// Injected requests are subject to the chain's circuit breaker;
    /// top-level requests never are.
    pub fn is_injected(&self) -> bool {
        self.depth > 0
    }

    pub fn event_context(&self, originator_id: &str, correlation_id: &str) -> EventContext {
        EventContext {
            request_id: self.request_id.clone(),
            correlation_id: correlation_id.to_string(),
            chain_id: self.chain_id.clone(),
            conversation_id: self.conversation_id.clone(),
            originator_id: originator_id.to_string(),
            depth: self.depth,
        }
    }

    /// Parses a request from the `completion:submit` payload:
    /// `{conversation_id, priority?, prompt_ref, injection_config?}`.
    pub fn from_submit_event(event: &Event) -> EventResult<Self> {
        let conversation_id = event
            .get_str("conversation_id")
            .ok_or_else(|| EventError::InvalidPayload {
                message: "conversation_id is required".to_string(),
            })?
            .to_string();
        let prompt_ref = event
            .get_str("prompt_ref")
            .ok_or_else(|| EventError::InvalidPayload {
                message: "prompt_ref is required".to_string(),
            })?
            .to_string();

        let priority = match event.get_str("priority") {
            Some(s) => s.parse().map_err(|_| EventError::InvalidPayload {
                message: format!("unknown priority: {:?}", s),
            })?,
            None => Priority::default(),
        };

        let injection_config = match event.payload.get("injection_config") {
            Some(value) => {
                let json = serde_json::to_value(value)?;
                Some(serde_json::from_value(json)?)
            }
            None => None,
        };

        let mut builder = Self::builder()
            .conversation_id(&conversation_id)
            .prompt_ref(&prompt_ref)
            .priority(priority);
        if let Some(config) = injection_config {
            builder = builder.injection_config(config);
        }
        if let Some(hint) = event.get_str("provider_hint") {
            builder = builder.provider_hint(hint);
        }
        if !event.context.chain_id.is_empty() {
            builder = builder.chain_id(&event.context.chain_id);
            builder = builder.depth(event.context.depth);
        }
        builder.build()
    }
}

#[derive(Default, Clone)]
pub struct CompletionRequestBuilder {
    conversation_id: Option<String>,
    prompt_ref: Option<String>,
    chain_id: Option<String>,
    depth: u32,
    priority: Priority,
    provider_hint: Option<String>,
    injection_config: Option<InjectionConfig>,
}

impl CompletionRequestBuilder {
    pub fn conversation_id(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn prompt_ref(mut self, prompt_ref: &str) -> Self {
        self.prompt_ref = Some(prompt_ref.to_string());
        self
    }

    pub fn chain_id(mut self, chain_id: &str) -> Self {
        self.chain_id = Some(chain_id.to_string());
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn provider_hint(mut self, provider_hint: &str) -> Self {
        self.provider_hint = Some(provider_hint.to_string());
        self
    }

    pub fn injection_config(mut self, config: InjectionConfig) -> Self {
        self.injection_config = Some(config);
        self
    }

    pub fn build(self) -> EventResult<CompletionRequest> {
        Ok(CompletionRequest {
            request_id: Uuid::new_v4().to_string(),
            conversation_id: self.conversation_id.ok_or(EventError::BuilderFailed(
                "conversation_id is required".to_string(),
            ))?,
            chain_id: self
                .chain_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            depth: self.depth,
            priority: self.priority,
            prompt_ref: self.prompt_ref.ok_or(EventError::BuilderFailed(
                "prompt_ref is required".to_string(),
            ))?,
            provider_hint: self.provider_hint,
            injection_config: self.injection_config,
            submitted_at: Utc::now(),
        })
    }
}

/// Terminal state of one completion request.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Result { output: String, usage: TokenUsage },
    Error { kind: String, retryable: bool },
}

impl CompletionOutcome {
    pub fn usage_payload(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        if let CompletionOutcome::Result { usage, .. } = self {
            map.insert(
                "prompt_tokens".to_string(),
                Value::from(usage.prompt_tokens),
            );
            map.insert(
                "completion_tokens".to_string(),
                Value::from(usage.completion_tokens),
            );
            map.insert("total_tokens".to_string(), Value::from(usage.total()));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_total_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Background);
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
    }

    #[test]
    fn test_builder_requires_conversation_and_prompt() {
        assert!(CompletionRequest::builder().build().is_err());
        assert!(CompletionRequest::builder()
            .conversation_id("c1")
            .build()
            .is_err());

        let request = CompletionRequest::builder()
            .conversation_id("c1")
            .prompt_ref("p1")
            .build()
            .unwrap();
        assert_eq!(request.depth, 0);
        assert!(!request.is_injected());
        assert_eq!(request.priority, Priority::Normal);
        assert!(!request.chain_id.is_empty());
    }

    #[test]
    fn test_from_submit_event() {
        let event = Event::new("completion:submit")
            .with("conversation_id", "c1")
            .with("prompt_ref", "prompt-1")
            .with("priority", "critical");

        let request = CompletionRequest::from_submit_event(&event).unwrap();
        assert_eq!(request.conversation_id, "c1");
        assert_eq!(request.prompt_ref, "prompt-1");
        assert_eq!(request.priority, Priority::Critical);
        assert!(request.injection_config.is_none());
    }

    #[test]
    fn test_from_submit_event_with_injection_config() {
        let config_json = serde_json::json!({
            "enabled": true,
            "target_conversation_ids": ["c2", "c3"],
            "follow_up_guidance": "summarize",
            "max_depth": 2
        });
        let config_value: Value = serde_json::from_value(config_json).unwrap();
        let event = Event::new("completion:submit")
            .with("conversation_id", "c1")
            .with("prompt_ref", "prompt-1")
            .with("injection_config", config_value);

        let request = CompletionRequest::from_submit_event(&event).unwrap();
        let config = request.injection_config.unwrap();
        assert!(config.enabled);
        assert_eq!(config.target_conversation_ids, vec!["c2", "c3"]);
        assert_eq!(config.max_depth, Some(2));
        assert_eq!(config.trigger_type, TriggerType::OnResult);
    }

    #[test]
    fn test_from_submit_event_missing_fields() {
        let event = Event::new("completion:submit").with("conversation_id", "c1");
        assert!(CompletionRequest::from_submit_event(&event).is_err());

        let event = Event::new("completion:submit")
            .with("conversation_id", "c1")
            .with("prompt_ref", "p")
            .with("priority", "extreme");
        assert!(CompletionRequest::from_submit_event(&event).is_err());
    }

    #[test]
    fn test_injection_targets_deduplicated() {
        let config = InjectionConfig::new(["c1", "c2", "c1", "c3", "c2"]);
        assert_eq!(config.target_conversation_ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_trigger_type_gating() {
        let result = CompletionOutcome::Result {
            output: "ok".to_string(),
            usage: TokenUsage::default(),
        };
        let error = CompletionOutcome::Error {
            kind: "fatal".to_string(),
            retryable: false,
        };

        let on_result = InjectionConfig::new(["c2"]);
        assert!(on_result.triggers_on(&result));
        assert!(!on_result.triggers_on(&error));

        let mut on_error = InjectionConfig::new(["c2"]);
        on_error.trigger_type = TriggerType::OnError;
        assert!(!on_error.triggers_on(&result));
        assert!(on_error.triggers_on(&error));

        let mut always = InjectionConfig::new(["c2"]);
        always.trigger_type = TriggerType::Always;
        assert!(always.triggers_on(&result));
        assert!(always.triggers_on(&error));
    }
}
