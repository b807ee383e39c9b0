//! LLM integration.
//!
//! The classifier talks to the model through the `LlmProvider` trait; the
//! only shipped backend is the Anthropic Messages API.

pub mod anthropic;
pub mod provider;
pub(crate) mod retry;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use retry::RetryPolicy;

use std::sync::Arc;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Override for the API root (proxies, tests).
    pub base_url: Option<String>,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let mut provider = AnthropicProvider::new(config.api_key.clone(), &config.model);
    if let Some(ref url) = config.base_url {
        provider = provider.with_base_url(url);
    }
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(provider))
}
