//! Per-chain circuit breaker.
//!
//! Each causal chain of automatically-triggered completions accumulates
//! depth, token usage and elapsed time. Once any bound is exceeded the chain
//! trips permanently: further injected submissions for that `chain_id` are
//! rejected, while other chains and top-level requests are unaffected.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::request::InjectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TripReason {
    DepthExceeded,
    TokenBudgetExhausted,
    TimeWindowElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainLimits {
    pub max_depth: u32,
    pub token_budget: u64,
    pub time_window: Duration,
}

impl ChainLimits {
    /// Limits for a chain, from its originating injection config with the
    /// configured defaults filling the gaps.
    pub fn from_config(config: &InjectionConfig, defaults: ChainLimits) -> Self {
        Self {
            max_depth: config.max_depth.unwrap_or(defaults.max_depth),
            token_budget: config.token_budget.unwrap_or(defaults.token_budget),
            time_window: config.time_window.unwrap_or(defaults.time_window),
        }
    }
}

/// Budget consumed so far by one chain. `depth_used` and `tokens_used` only
/// grow (cancellation of an undispatched hop is the single exception, see
/// [`CircuitBreaker::release_admission`]); `tripped` never resets.
#[derive(Debug, Clone)]
pub struct ChainBudget {
    pub chain_id: String,
    pub depth_used: u32,
    pub tokens_used: u64,
    pub started_at: DateTime<Utc>,
    pub tripped: Option<TripReason>,
    limits: ChainLimits,
}

impl ChainBudget {
    fn new(chain_id: &str, limits: ChainLimits) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            depth_used: 0,
            tokens_used: 0,
            started_at: Utc::now(),
            tripped: None,
            limits,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_some()
    }

    fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Error, Debug)]
pub enum BreakerError {
    #[error("circuit breaker tripped for chain {chain_id}: {reason}")]
    Tripped {
        chain_id: String,
        reason: TripReason,
    },
}

/// Owns the per-chain budget table. Each DashMap entry is the single
/// authority for its chain's counters.
pub struct CircuitBreaker {
    chains: DashMap<String, ChainBudget>,
    defaults: ChainLimits,
}

impl CircuitBreaker {
    pub fn new(defaults: ChainLimits) -> Self {
        Self {
            chains: DashMap::new(),
            defaults,
        }
    }

    /// Starts tracking a chain with explicit limits. Idempotent: an existing
    /// budget (and anything it has already consumed) is kept.
    pub fn register_chain(&self, chain_id: &str, limits: ChainLimits) {
        self.chains
            .entry(chain_id.to_string())
            .or_insert_with(|| {
                debug!(chain_id, ?limits, "chain registered with breaker");
                ChainBudget::new(chain_id, limits)
            });
    }

    /// Admission check for one injected hop: counts the hop and trips the
    /// chain if depth or elapsed time exceed its limits. Top-level requests
    /// must not be passed here; they are never budget-checked.
    pub fn admit_injection(&self, chain_id: &str) -> Result<(), BreakerError> {
        let mut entry = self
            .chains
            .entry(chain_id.to_string())
            .or_insert_with(|| ChainBudget::new(chain_id, self.defaults));

        if let Some(reason) = entry.tripped {
            return Err(BreakerError::Tripped {
                chain_id: chain_id.to_string(),
                reason,
            });
        }
        if entry.elapsed() > entry.limits.time_window {
            entry.tripped = Some(TripReason::TimeWindowElapsed);
            warn!(chain_id, "chain tripped: time window elapsed");
            return Err(BreakerError::Tripped {
                chain_id: chain_id.to_string(),
                reason: TripReason::TimeWindowElapsed,
            });
        }
        entry.depth_used += 1;
        if entry.depth_used > entry.limits.max_depth {
            entry.tripped = Some(TripReason::DepthExceeded);
            warn!(
                chain_id,
                depth = entry.depth_used,
                max = entry.limits.max_depth,
                "chain tripped: depth exceeded"
            );
            return Err(BreakerError::Tripped {
                chain_id: chain_id.to_string(),
                reason: TripReason::DepthExceeded,
            });
        }
        Ok(())
    }

    /// Returns an admission counted by [`admit_injection`] when the hop was
    /// cancelled before dispatch; cancelled requests do not count against
    /// the chain.
    pub fn release_admission(&self, chain_id: &str) {
        if let Some(mut entry) = self.chains.get_mut(chain_id) {
            if entry.tripped.is_none() && entry.depth_used > 0 {
                entry.depth_used -= 1;
            }
        }
    }

    /// Accumulates provider-reported usage for a completed hop. Chains that
    /// were never registered (plain requests without injection) are not
    /// tracked.
    pub fn record_usage(&self, chain_id: &str, tokens: u64) {
        if let Some(mut entry) = self.chains.get_mut(chain_id) {
            entry.tokens_used += tokens;
            if entry.tripped.is_none() && entry.tokens_used > entry.limits.token_budget {
                entry.tripped = Some(TripReason::TokenBudgetExhausted);
                warn!(
                    chain_id,
                    used = entry.tokens_used,
                    budget = entry.limits.token_budget,
                    "chain tripped: token budget exhausted"
                );
            }
        }
    }

    pub fn is_tripped(&self, chain_id: &str) -> bool {
        self.chains
            .get(chain_id)
            .map(|entry| entry.is_tripped())
            .unwrap_or(false)
    }

    pub fn budget(&self, chain_id: &str) -> Option<ChainBudget> {
        self.chains.get(chain_id).map(|entry| entry.clone())
    }
}
