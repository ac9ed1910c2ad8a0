#[allow(clippy::module_inception)]
pub mod provider;

pub use provider::{
    CompletionProvider, EchoProvider, ProviderError, ProviderResponse, ProviderResult, TokenUsage,
};
