//! Injection routing.
//!
//! When a request carrying an injection config reaches a terminal state, the
//! router builds one follow-up completion per target conversation (inherited
//! chain, one hop deeper, prompt derived from the result plus the follow-up
//! guidance) and submits it back to the queue. Breaker rejection ends the
//! chain with a `completion:chain_exhausted` notification; any other
//! submission failure is logged per target and never fails the originating
//! request.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::event::event_bus::{Event, EventBus};
use crate::event::names;

use super::breaker::{ChainLimits, CircuitBreaker};
use super::queue::{CompletionQueue, QueueError};
use super::request::{CompletionOutcome, CompletionRequest};

pub struct InjectionRouter {
    queue: Arc<CompletionQueue>,
    breaker: Arc<CircuitBreaker>,
    event_bus: Arc<EventBus>,
    default_limits: ChainLimits,
}

impl InjectionRouter {
    pub fn new(
        queue: Arc<CompletionQueue>,
        breaker: Arc<CircuitBreaker>,
        event_bus: Arc<EventBus>,
        default_limits: ChainLimits,
    ) -> Self {
        Self {
            queue,
            breaker,
            event_bus,
            default_limits,
        }
    }

    /// Consumes the request's injection config against its terminal outcome.
    /// Returns the request ids of the follow-ups that were admitted.
    pub async fn on_result(
        &self,
        request: &CompletionRequest,
        outcome: &CompletionOutcome,
    ) -> Vec<String> {
        let Some(config) = &request.injection_config else {
            return Vec::new();
        };
        if !config.enabled || !config.triggers_on(outcome) {
            debug!(
                request_id = %request.request_id,
                trigger = %config.trigger_type,
                "injection not triggered"
            );
            return Vec::new();
        }

        // The chain budget is pinned to the originating config; re-registering
        // deeper hops keeps the original limits.
        self.breaker.register_chain(
            &request.chain_id,
            ChainLimits::from_config(config, self.default_limits),
        );

        let derived = match outcome {
            CompletionOutcome::Result { output, .. } => output.clone(),
            CompletionOutcome::Error { kind, .. } => {
                format!("previous completion failed: {}", kind)
            }
        };
        let prompt = if config.follow_up_guidance.is_empty() {
            derived
        } else {
            format!("{}\n\n{}", config.follow_up_guidance, derived)
        };

        let mut submitted = Vec::new();
        for target in &config.target_conversation_ids {
            let mut builder = CompletionRequest::builder()
                .conversation_id(target)
                .prompt_ref(&prompt)
                .chain_id(&request.chain_id)
                .depth(request.depth + 1)
                .priority(request.priority)
                .injection_config(config.clone());
            if let Some(hint) = &request.provider_hint {
                builder = builder.provider_hint(hint);
            }
            let follow_up = match builder.build() {
                Ok(follow_up) => follow_up,
                Err(e) => {
                    warn!(conversation_id = %target, error = %e, "failed to build follow-up request");
                    continue;
                }
            };
            let follow_up_id = follow_up.request_id.clone();

            match self.queue.submit(follow_up) {
                Ok(_) => {
                    info!(
                        chain_id = %request.chain_id,
                        conversation_id = %target,
                        depth = request.depth + 1,
                        "follow-up injected"
                    );
                    self.event_bus
                        .emit(
                            Event::new(names::COMPLETION_QUEUED)
                                .with("request_id", follow_up_id.as_str())
                                .with("injected", true)
                                .with("parent_request_id", request.request_id.as_str()),
                        )
                        .await;
                    submitted.push(follow_up_id);
                }
                Err(QueueError::CircuitBreakerTripped(e)) => {
                    // Terminal for the chain, never retried.
                    info!(chain_id = %request.chain_id, error = %e, "chain exhausted");
                    self.event_bus
                        .emit(
                            Event::new(names::COMPLETION_CHAIN_EXHAUSTED)
                                .with("chain_id", request.chain_id.as_str())
                                .with("request_id", request.request_id.as_str())
                                .with("reason", e.to_string()),
                        )
                        .await;
                    break;
                }
                Err(e) => {
                    warn!(conversation_id = %target, error = %e, "injection target unreachable");
                    self.event_bus
                        .emit(
                            Event::new(names::COMPLETION_INJECTION_UNREACHABLE)
                                .with("chain_id", request.chain_id.as_str())
                                .with("target_conversation_id", target.as_str())
                                .with("reason", e.reason()),
                        )
                        .await;
                }
            }
        }
        submitted
    }
}
