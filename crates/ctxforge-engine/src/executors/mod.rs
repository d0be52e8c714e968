//! One executor per node variant, resolved through a dispatch table built
//! once. Variants without a registered executor run as passthrough.

pub mod memory;
pub mod parser;
pub mod passthrough;
pub mod prompt;
pub mod retriever;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::types::{MemoryIntent, TokenCounts};

use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

pub use memory::MemoryStoreExecutor;
pub use parser::OutputParserExecutor;
pub use passthrough::PassthroughExecutor;
pub use prompt::PromptTemplateExecutor;
pub use retriever::RagRetrieverExecutor;
pub use state::StateTrackerExecutor;

/// What an executor hands back to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub output: Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    /// Observability annotation (StateTracker).
    pub state: Option<Value>,
    /// Side effect for the runtime to apply (MemoryStore).
    pub memory: Option<MemoryIntent>,
}

impl NodeOutput {
    /// Zero-cost output.
    pub fn identity(output: Value) -> Self {
        Self {
            output,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            state: None,
            memory: None,
        }
    }

    pub fn tokens(&self) -> TokenCounts {
        TokenCounts::new(self.tokens_in, self.tokens_out)
    }
}

/// Executes one node variant.
pub trait NodeExecutor: Send + Sync + 'static {
    fn variant(&self) -> NodeVariant;

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>>;
}

/// Dispatch table from variant to executor.
pub struct ExecutorRegistry {
    executors: HashMap<NodeVariant, Arc<dyn NodeExecutor>>,
    fallback: Arc<dyn NodeExecutor>,
}

impl ExecutorRegistry {
    /// Empty table; every variant falls back to passthrough.
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            fallback: Arc::new(PassthroughExecutor::new(NodeVariant::Passthrough)),
        }
    }

    /// Register an executor under its variant, replacing any previous one.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        self.executors.insert(executor.variant(), Arc::new(executor));
    }

    pub fn get(&self, variant: NodeVariant) -> Arc<dyn NodeExecutor> {
        match self.executors.get(&variant) {
            Some(executor) => executor.clone(),
            None => {
                warn!(variant = %variant, "No executor registered, running as passthrough");
                self.fallback.clone()
            }
        }
    }

    pub fn variants(&self) -> Vec<NodeVariant> {
        NodeVariant::ALL
            .into_iter()
            .filter(|v| self.executors.contains_key(v))
            .collect()
    }

    pub async fn execute(
        &self,
        node: &GraphNode,
        input: &ResolvedInput,
        ctx: &RuntimeContext,
    ) -> Result<NodeOutput> {
        self.get(node.variant).execute(node, input, ctx).await
    }

    /// Table with every built-in executor registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PassthroughExecutor::new(NodeVariant::Input));
        registry.register(PassthroughExecutor::new(NodeVariant::Output));
        registry.register(PassthroughExecutor::new(NodeVariant::Passthrough));
        registry.register(PromptTemplateExecutor);
        registry.register(RagRetrieverExecutor);
        registry.register(MemoryStoreExecutor);
        registry.register(StateTrackerExecutor);
        registry.register(OutputParserExecutor);
        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_cover_every_variant() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.variants(), NodeVariant::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_missing_executor_falls_back_to_passthrough() {
        let registry = ExecutorRegistry::new();
        let ctx = RuntimeContext::mock(Some(0));
        let node = GraphNode::new("p", NodeVariant::PromptTemplate);
        let input = ResolvedInput::original(&json!("unchanged"));

        let out = registry.execute(&node, &input, &ctx).await.unwrap();
        assert_eq!(out, NodeOutput::identity(json!("unchanged")));
    }
}
