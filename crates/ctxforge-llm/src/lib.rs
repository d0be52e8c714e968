pub mod mock;
pub mod pricing;
pub mod providers;
pub mod router;

use std::sync::Arc;

use ctxforge_core::config::ProviderConfig;
use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::traits::ChatProvider;

pub use mock::MockChatProvider;
pub use pricing::{Rate, RateTable};
pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use router::ProviderRouter;

/// Create a chat client based on the provider name.
pub fn create_client(name: &str, config: &ProviderConfig) -> Result<Arc<dyn ChatProvider>> {
    match name {
        "anthropic" | "claude" => Ok(Arc::new(AnthropicClient::from_config(config))),
        "openai" => Ok(Arc::new(OpenAiClient::from_config(None, config))),
        other => {
            let preset = providers::presets::get_preset(other);
            if preset.is_none() && config.base_url.is_none() {
                return Err(CtxError::UnsupportedProvider(other.to_string()));
            }
            // Everything else uses the OpenAI-compatible client
            Ok(Arc::new(OpenAiClient::from_config(preset.as_ref(), config)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_providers() {
        let cfg = ProviderConfig::default();
        assert!(create_client("openai", &cfg).is_ok());
        assert!(create_client("anthropic", &cfg).is_ok());
        assert!(create_client("groq", &cfg).is_ok());
    }

    #[test]
    fn test_unknown_provider_needs_base_url() {
        let cfg = ProviderConfig::default();
        assert!(matches!(
            create_client("acme-llm", &cfg),
            Err(CtxError::UnsupportedProvider(_))
        ));

        let cfg = ProviderConfig {
            base_url: Some("http://localhost:9000/v1/chat/completions".into()),
            ..Default::default()
        };
        assert!(create_client("acme-llm", &cfg).is_ok());
    }
}
