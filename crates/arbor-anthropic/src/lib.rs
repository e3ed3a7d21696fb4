//! Anthropic Messages API provider for the arbor runtime.
//!
//! Implements the provider session contract over the raw wire format:
//! extended thinking with interleaved tool use, verbatim replay of
//! thinking blocks (signatures included), and per-request ephemeral cache
//! markers on the latest message.

mod session;
mod wire;

use arbor_contract::provider::{ProviderError, ProviderSession, SessionFactory, SessionRequest};
use session::AnthropicSession;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the Anthropic provider.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    /// Override the model for every session; defaults to the runtime's
    /// per-provider model when unset.
    pub model: Option<String>,
    pub max_tokens: u32,
    /// Extended-thinking budget. Deployments should confirm the
    /// relationship between this and `max_tokens` against current provider
    /// documentation before changing either.
    pub thinking_budget: u32,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            model: None,
            max_tokens: 64_000,
            thinking_budget: 32_768,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Read the API key from `ANTHROPIC_API_KEY`, with optional overrides
    /// from `ANTHROPIC_BASE_URL` and `ANTHROPIC_MODEL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::fatal("ANTHROPIC_API_KEY is not set"))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
            config.model = Some(model);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Opens Anthropic sessions. Register on the runtime for
/// [`arbor_contract::Provider::Anthropic`].
#[derive(Debug)]
pub struct AnthropicFactory {
    config: Arc<AnthropicConfig>,
    http: reqwest::Client,
}

impl AnthropicFactory {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::fatal("anthropic api key is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::fatal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(AnthropicConfig::from_env()?)
    }
}

impl SessionFactory for AnthropicFactory {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn ProviderSession>, ProviderError> {
        Ok(Box::new(AnthropicSession::new(
            self.http.clone(),
            self.config.clone(),
            request,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_empty_key() {
        let err = AnthropicFactory::new(AnthropicConfig::new("")).unwrap_err();
        assert!(!err.transient);
    }

    #[test]
    fn config_defaults() {
        let config = AnthropicConfig::new("k");
        assert_eq!(config.base_url, "https://api.anthropic.com");
        assert_eq!(config.max_tokens, 64_000);
        assert_eq!(config.thinking_budget, 32_768);
        assert!(config.model.is_none());
    }
}
