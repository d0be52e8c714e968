use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ctxforge_core::config::ProviderConfig;
use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::traits::ChatProvider;
use ctxforge_core::types::*;

use super::presets::{build_extra_headers, ProviderPreset};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key,
            extra_headers: vec![],
        }
    }

    /// Build from provider config, falling back to the preset's endpoint.
    pub fn from_config(preset: Option<&ProviderPreset>, config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| preset.map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            extra_headers: build_extra_headers(preset, &config.extra_headers),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// Request types
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

// Response types
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn parse_response(body: &str) -> Result<ChatCompletion> {
    let parsed: CompletionResponse = serde_json::from_str(body)?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(ChatCompletion {
        content,
        usage: parsed.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

impl ChatProvider for OpenAiClient {
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        Box::pin(async move {
            let body = CompletionRequest {
                model: &request.model,
                messages: request
                    .messages
                    .iter()
                    .map(|m| OaiMessage {
                        role: m.role.as_str(),
                        content: &m.content,
                    })
                    .collect(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            };

            let mut req = self.http.post(&self.base_url).json(&body);

            if let Some(api_key) = &self.api_key {
                req = req.bearer_auth(api_key);
            }

            // Apply extra headers from config (set by presets or user)
            for (k, v) in &self.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(provider = %request.provider, model = %request.model, "Sending chat completion");

            let response = req.send().await.map_err(|e| CtxError::Provider {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            })?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());

            if !status.is_success() {
                return Err(CtxError::Provider {
                    status: status.as_u16(),
                    message: text,
                });
            }

            parse_response(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::presets::get_preset;

    #[test]
    fn test_parse_response_with_usage() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Hello!"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.content, "Hello!");
        assert_eq!(
            completion.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn test_parse_response_without_usage() {
        let body = r#"{"choices": [{"message": {"content": "ok"}}]}"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.content, "ok");
        assert!(completion.usage.is_none());
    }

    #[test]
    fn test_parse_response_malformed() {
        assert!(matches!(parse_response("not json"), Err(CtxError::Json(_))));
    }

    #[test]
    fn test_from_config_uses_preset_url() {
        let preset = get_preset("groq");
        let client = OpenAiClient::from_config(preset.as_ref(), &ProviderConfig::default());
        assert!(client.base_url().contains("groq.com"));

        let cfg = ProviderConfig {
            base_url: Some("http://localhost:1/v1/chat/completions".into()),
            ..Default::default()
        };
        let client = OpenAiClient::from_config(preset.as_ref(), &cfg);
        assert_eq!(client.base_url(), "http://localhost:1/v1/chat/completions");
    }
}
