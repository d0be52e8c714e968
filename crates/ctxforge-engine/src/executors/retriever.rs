use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::node_config::{self, RetrieverConfig};
use ctxforge_core::types::Passage;

use super::prompt::complete_prompt;
use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Join passages that clear the threshold, best first.
pub fn assemble_context(passages: &[Passage], score_threshold: f32) -> String {
    passages
        .iter()
        .filter(|p| p.score >= score_threshold)
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join(PASSAGE_SEPARATOR)
}

pub struct RagRetrieverExecutor;

impl NodeExecutor for RagRetrieverExecutor {
    fn variant(&self) -> NodeVariant {
        NodeVariant::RagRetriever
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let config: RetrieverConfig = node_config::parse(node)?;
            let query = input.query();

            let mut passages = ctx
                .search
                .search(&query, config.top_k, config.score_threshold)
                .await?;
            // Order and bound locally as well
            passages.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            passages.truncate(config.top_k);
            let context = assemble_context(&passages, config.score_threshold);

            debug!(
                node_id = %node.id,
                hits = passages.len(),
                threshold = config.score_threshold,
                "Retrieved context"
            );

            match config.prompt_template.as_deref() {
                Some(template) => {
                    complete_prompt(ctx, &config.model, template, |name| match name {
                        "context" => Some(context.clone()),
                        "query" => Some(query.clone()),
                        other => input.var(other),
                    })
                    .await
                }
                None => Ok(NodeOutput::identity(Value::String(context))),
            }
        })
    }
}
