use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ctxforge_core::config::ProviderConfig;
use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::traits::ChatProvider;
use ctxforge_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            api_key: config.api_key.clone(),
        }
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// System messages go in the top-level `system` field; the rest stay in order.
fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts = Vec::new();
    let mut api_messages = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content),
            Role::User => api_messages.push(ApiMessage {
                role: "user",
                content: msg.content,
            }),
            Role::Assistant => api_messages.push(ApiMessage {
                role: "assistant",
                content: msg.content,
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, api_messages)
}

fn parse_response(body: &str) -> Result<ChatCompletion> {
    let parsed: MessagesResponse = serde_json::from_str(body)?;
    let content = parsed
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    Ok(ChatCompletion {
        content,
        usage: parsed.usage.map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        }),
    })
}

impl ChatProvider for AnthropicClient {
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        Box::pin(async move {
            let api_key = self
                .api_key
                .as_deref()
                .ok_or_else(|| CtxError::Config("Anthropic API key not set".into()))?;

            let (system, messages) = convert_messages(request.messages);
            let body = MessagesRequest {
                model: request.model.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                messages,
                system,
            };

            debug!(model = %request.model, "Sending Anthropic messages request");

            let response = self
                .http
                .post(&self.base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| CtxError::Provider {
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
