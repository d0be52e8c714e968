use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::node_config::{self, ModelSettings, PromptTemplateConfig};
use ctxforge_core::types::{ChatMessage, ChatRequest, Usage};

use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.-]*)\}").ok())
        .as_ref()
}

/// Replace `{name}` with `lookup(name)`; unresolved placeholders stay as written.
pub fn render(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    match placeholder() {
        Some(re) => re
            .replace_all(template, |caps: &Captures| {
                lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        None => template.to_string(),
    }
}

/// Render `template`, send it through the chat capability, and price the call.
pub async fn complete_prompt(
    ctx: &RuntimeContext,
    settings: &ModelSettings,
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<NodeOutput> {
    let rendered = render(template, lookup);

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = settings.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(rendered));

    let request = ChatRequest {
        provider: settings
            .provider
            .clone()
            .unwrap_or_else(|| ctx.defaults.provider.clone()),
        model: settings
            .model
            .clone()
            .unwrap_or_else(|| ctx.defaults.model.clone()),
        messages,
        temperature: settings.temperature.unwrap_or(ctx.defaults.temperature),
        max_tokens: settings.max_tokens.unwrap_or(ctx.defaults.max_tokens),
    };

    let prompt_text: String = request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let provider = request.provider.clone();
    let model = request.model.clone();

    let completion = ctx.chat.complete(request).await?;

    let usage = completion.usage.unwrap_or_else(|| Usage {
        prompt_tokens: ctx.estimate_tokens(&prompt_text),
        completion_tokens: ctx.estimate_tokens(&completion.content),
    });
    let cost_usd = ctx.rates.cost(&provider, &model, &usage);

    debug!(
        provider = %provider,
        model = %model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        cost_usd,
        "Prompt completed"
    );

    Ok(NodeOutput {
        output: Value::String(completion.content),
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
        cost_usd,
        state: None,
        memory: None,
    })
}

pub struct PromptTemplateExecutor;

impl NodeExecutor for PromptTemplateExecutor {
    fn variant(&self) -> NodeVariant {
        NodeVariant::PromptTemplate
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let config: PromptTemplateConfig = node_config::parse(node)?;
            complete_prompt(ctx, &config.model, &config.template, |name| input.var(name)).await
        })
    }
}
