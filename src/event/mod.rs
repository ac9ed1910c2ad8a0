//! # Event-Driven Substrate
//!
//! Pattern-matched event dispatch with declarative transformation and
//! filtering. Everything above this layer (queueing, locking, injection)
//! communicates through it, so producers never couple to consumers.
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐     ┌──────────────┐     ┌──────────┐
//! │ Emitter  │────▶│   EventBus   │────▶│ Handlers │
//! └──────────┘     └──────┬───────┘     └──────────┘
//!                         │ per-handler filter
//!                  ┌──────▼───────────┐
//!                  │ TransformerEngine│──▶ re-emitted target events
//!                  └──────────────────┘
//! ```
//!
//! 1. An emitter hands a fully constructed [`event_bus::Event`] to the bus
//! 2. The bus dispatches to every pattern-matched handler in priority order,
//!    consulting each handler's [`filter::EventFilter`] first
//! 3. The [`transformer::TransformerEngine`] optionally derives new events
//!    from the original, which are dispatched as independent emissions

pub mod event_bus;
pub mod filter;
pub mod transformer;

/// Well-known event names on the coordination surface.
pub mod names {
    pub const COMPLETION_SUBMIT: &str = "completion:submit";
    pub const COMPLETION_CANCEL: &str = "completion:cancel";
    pub const COMPLETION_QUEUED: &str = "completion:queued";
    pub const COMPLETION_REJECTED: &str = "completion:rejected";
    pub const COMPLETION_DISPATCHED: &str = "completion:dispatched";
    pub const COMPLETION_RESULT: &str = "completion:result";
    pub const COMPLETION_ERROR: &str = "completion:error";
    pub const COMPLETION_CANCELLED: &str = "completion:cancelled";
    pub const COMPLETION_CHAIN_EXHAUSTED: &str = "completion:chain_exhausted";
    pub const COMPLETION_LOCK_TIMEOUT: &str = "completion:lock_timeout";
    pub const COMPLETION_INJECTION_UNREACHABLE: &str = "completion:injection_unreachable";
    pub const COMPLETION_QUEUE_STATUS: &str = "completion:queue_status";
    pub const CONVERSATION_LOCK_STATUS: &str = "conversation:lock_status";
    pub const CONVERSATION_FORK_DETECTED: &str = "conversation:fork_detected";
    pub const ROUTER_REGISTER_TRANSFORMER: &str = "router:register_transformer";
}
