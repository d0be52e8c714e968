use futures::future::BoxFuture;

use crate::error::Result;
use crate::event::ProgressEvent;
use crate::graph::Graph;
use crate::types::*;

/// Chat-completion capability. Implementations hold no per-call mutable state
/// and are shared across concurrent sessions.
pub trait ChatProvider: Send + Sync + 'static {
    /// Run one completion; non-2xx responses surface as `CtxError::Provider`.
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>>;
}

/// Semantic-search capability.
pub trait SemanticSearch: Send + Sync + 'static {
    /// Passages with `score >= score_threshold`, best first, at most `top_k`.
    fn search(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> BoxFuture<'_, Result<Vec<Passage>>>;
}

/// Read-only access to saved graphs.
pub trait GraphLookup: Send + Sync + 'static {
    fn resolve_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>>;
}

/// Terminal-state persistence, used by observers to reconcile missed events.
pub trait RunStore: Send + Sync + 'static {
    fn save_session(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>>;

    fn load_session(&self, session_id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>>;

    fn save_comparison(&self, run: &ComparisonRun) -> BoxFuture<'_, Result<()>>;

    fn load_comparison(&self, comparison_id: &str)
        -> BoxFuture<'_, Result<Option<ComparisonRun>>>;
}

/// Durable side of MemoryStore nodes.
pub trait MemoryBackend: Send + Sync + 'static {
    /// Apply an intent. `Retrieve` returns the stored value, other operations
    /// return the value now held under the key.
    fn apply(&self, intent: MemoryIntent) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;
}

/// Where progress events go. The channel key is `event.channel`.
///
/// Best-effort: implementations may drop events but must not reorder the
/// events of a single channel.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: ProgressEvent);
}
