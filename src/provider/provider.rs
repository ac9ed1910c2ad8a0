//! Provider collaborator seam.
//!
//! The coordinator never talks to a concrete text-generation backend
//! directly; it hands a dispatched request to a [`CompletionProvider`] and
//! routes whatever comes back through the bus. Adapters for real backends
//! live outside this crate. [`EchoProvider`] is the deterministic in-process
//! implementation used in tests and examples.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::completion::request::CompletionRequest;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProviderResponse {
    pub output: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Transient failure; the queue retries with backoff up to the
    /// configured attempt bound.
    #[error("retryable provider error: {message}")]
    Retryable { message: String },

    /// Surfaces immediately as `completion:error`.
    #[error("fatal provider error: {message}")]
    Fatal { message: String },

    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable { .. })
    }

    /// Stable kind string for `completion:error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Retryable { .. } => "retryable",
            ProviderError::Fatal { .. } => "fatal",
            ProviderError::Cancelled => "cancelled",
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// The only operation that suspends for non-trivial duration in the whole
/// system. `cancel` flips to `true` when the caller cancels mid-call;
/// implementations should return [`ProviderError::Cancelled`] promptly.
#[async_trait]
#[mockall::automock]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: watch::Receiver<bool>,
    ) -> ProviderResult<ProviderResponse>;

    fn name(&self) -> String;
}

/// Echoes the prompt reference back after an optional artificial delay.
pub struct EchoProvider {
    name: String,
    latency: Duration,
}

impl EchoProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl CompletionProvider for EchoProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> ProviderResult<ProviderResponse> {
        if self.latency > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                changed = cancel.changed() => {
                    if changed.is_ok() && *cancel.borrow() {
                        return Err(ProviderError::Cancelled);
                    }
                }
            }
        }
        if *cancel.borrow() {
            return Err(ProviderError::Cancelled);
        }
        let prompt_tokens = request.prompt_ref.len() as u64;
        Ok(ProviderResponse {
            output: format!("echo: {}", request.prompt_ref),
            model: self.name.clone(),
            usage: TokenUsage::new(prompt_tokens, prompt_tokens),
        })
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
