//! colloquy: event-driven concurrency control for LLM completion requests.
//!
//! Pattern-matched event bus, declarative event transformation, a priority
//! queue that serializes per conversation, per-conversation locking with fork
//! detection, per-chain circuit breaking, and result-driven injection of
//! follow-up completions.

pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod provider;
pub mod system;

// Re-exports
pub use config::SystemConfig;
pub use error::{Error, InternalResult};
pub use system::System;

/// Installs the global tracing subscriber, honoring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
