use futures::future::BoxFuture;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::node_config::{self, MemoryConfig};
use ctxforge_core::types::MemoryIntent;

use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

/// Passes its input through and records an intent; the session applies it.
pub struct MemoryStoreExecutor;

impl NodeExecutor for MemoryStoreExecutor {
    fn variant(&self) -> NodeVariant {
        NodeVariant::MemoryStore
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        _ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let config: MemoryConfig = node_config::parse(node)?;
            let mut out = NodeOutput::identity(input.primary.clone());
            out.memory = Some(MemoryIntent {
                operation: config.operation,
                key: config.key.unwrap_or_else(|| node.id.clone()),
                value: input.primary.clone(),
                ttl_secs: config.ttl_secs,
                max_tokens: config.max_tokens,
            });
            Ok(out)
        })
    }
}
