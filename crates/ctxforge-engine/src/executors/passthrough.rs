use futures::future::BoxFuture;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};

use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

/// Identity executor for Input, Output, and Passthrough nodes.
pub struct PassthroughExecutor {
    variant: NodeVariant,
}

impl PassthroughExecutor {
    pub fn new(variant: NodeVariant) -> Self {
        Self { variant }
    }
}

impl NodeExecutor for PassthroughExecutor {
    fn variant(&self) -> NodeVariant {
        self.variant
    }

    fn execute<'a>(
        &'a self,
        _node: &'a GraphNode,
        input: &'a ResolvedInput,
        _ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move { Ok(NodeOutput::identity(input.primary.clone())) })
    }
}
