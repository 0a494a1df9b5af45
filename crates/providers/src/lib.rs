//! Model client implementations for loomi.
//!
//! All clients implement [`loomi_core::ModelClient`]. [`build_from_config`]
//! picks and configures one from the `[model]` config section.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

use loomi_config::ModelConfig;
use loomi_core::error::ProviderError;
use loomi_core::provider::ModelClient;
use std::sync::Arc;

/// Build the configured model client. Fails when no API key is available.
pub fn build_from_config(config: &ModelConfig) -> Result<Arc<dyn ModelClient>, ProviderError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| ProviderError::NotConfigured("no API key (set LOOMI_API_KEY)".into()))?;

    let client = OpenAiCompatClient::new(
        "openai_compat",
        &config.api_url,
        api_key,
        &config.model,
        config.request_timeout(),
    )?
    .with_thinking(config.supports_thinking);
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_configured() {
        let config = ModelConfig::default();
        assert!(matches!(
            build_from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn configured_key_builds_client() {
        let mut config = ModelConfig::default();
        config.api_key = Some("sk-test".into());
        let client = build_from_config(&config).unwrap();
        assert_eq!(client.name(), "openai_compat");
        assert!(!client.supports_thinking());
    }

    #[test]
    fn thinking_follows_config() {
        let mut config = ModelConfig::default();
        config.api_key = Some("sk-test".into());
        config.supports_thinking = true;
        assert!(build_from_config(&config).unwrap().supports_thinking());
    }
}
