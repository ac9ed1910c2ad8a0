//! Completion pipeline: admission, ordering, serialization and chaining.
//!
//! Submodules:
//! - `request`: the request data model and injection config
//! - `queue`: priority queue with per-conversation serialization
//! - `lock`: conversation lock manager and fork detection
//! - `breaker`: per-chain circuit breaker
//! - `injection`: follow-up routing for chained completions

pub mod breaker;
pub mod injection;
pub mod lock;
pub mod queue;
pub mod request;

pub use breaker::{BreakerError, ChainBudget, ChainLimits, CircuitBreaker, TripReason};
pub use injection::InjectionRouter;
pub use lock::{ConversationLock, ConversationLockManager, ForkRecord, LockOutcome, LockStatus};
pub use queue::{CompletionQueue, QueueError, QueueResult, QueueStatus};
pub use request::{
    CompletionOutcome, CompletionRequest, CompletionRequestBuilder, InjectionConfig, Priority,
    TriggerType,
};
