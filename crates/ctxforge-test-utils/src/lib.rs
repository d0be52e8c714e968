//! Deterministic fakes and graph fixtures shared by ctxforge tests.
//! Nothing here touches the network.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::event::{ProgressEvent, ProgressKind};
use ctxforge_core::graph::{Graph, GraphEdge, GraphNode, NodeVariant};
use ctxforge_core::traits::{ChatProvider, EventSink, SemanticSearch};
use ctxforge_core::types::{ChatCompletion, ChatRequest, Passage, StepStatus, Usage};

// ── Graph fixtures ──────────────────────────────────────────────

/// Nodes wired one after another in the order given.
pub fn chain(id: &str, nodes: Vec<GraphNode>) -> Graph {
    let edges = nodes
        .windows(2)
        .map(|pair| GraphEdge::new(&pair[0].id, &pair[1].id))
        .collect();
    Graph::new(nodes, edges).with_id(id).with_name(id)
}

/// `Input → PromptTemplate → Output`.
pub fn linear_chain(id: &str) -> Graph {
    chain(
        id,
        vec![
            GraphNode::new("input", NodeVariant::Input),
            GraphNode::new("prompt", NodeVariant::PromptTemplate)
                .with_config("template", json!("Answer: {prompt}")),
            GraphNode::new("output", NodeVariant::Output),
        ],
    )
}

/// Like [`linear_chain`] but the prompt asks for `model`.
pub fn chain_with_model(id: &str, model: &str) -> Graph {
    chain(
        id,
        vec![
            GraphNode::new("input", NodeVariant::Input),
            GraphNode::new("prompt", NodeVariant::PromptTemplate)
                .with_config("template", json!("Answer: {prompt}"))
                .with_config("model", json!(model)),
            GraphNode::new("output", NodeVariant::Output),
        ],
    )
}

/// `a → b → c → a`.
pub fn cyclic(id: &str) -> Graph {
    Graph::new(
        vec![
            GraphNode::new("a", NodeVariant::Passthrough),
            GraphNode::new("b", NodeVariant::Passthrough),
            GraphNode::new("c", NodeVariant::Passthrough),
        ],
        vec![
            GraphEdge::new("a", "b"),
            GraphEdge::new("b", "c"),
            GraphEdge::new("c", "a"),
        ],
    )
    .with_id(id)
}

// ── Chat fakes ──────────────────────────────────────────────────

/// Replies with a fixed text and usage; fails for one model name.
pub struct ScriptedChat {
    reply: String,
    usage: Option<Usage>,
    failing_model: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            failing_model: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    /// Answer requests for `model` with a 500.
    pub fn failing_for(mut self, model: impl Into<String>) -> Self {
        self.failing_model = Some(model.into());
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ChatProvider for ScriptedChat {
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        let fail = self.failing_model.as_deref() == Some(request.model.as_str());
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(CtxError::Provider {
                    status: 500,
                    message: "scripted failure".into(),
                });
            }
            Ok(ChatCompletion {
                content: self.reply.clone(),
                usage: self.usage,
            })
        })
    }
}

/// Every call fails with the given status.
pub struct FailingChat {
    pub status: u16,
}

impl ChatProvider for FailingChat {
    fn complete(&self, _request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        let status = self.status;
        Box::pin(async move {
            Err(CtxError::Provider {
                status,
                message: "provider unavailable".into(),
            })
        })
    }
}

// ── Search fakes ────────────────────────────────────────────────

/// Returns its passages as given, ignoring `top_k` and the threshold.
pub struct StaticSearch(pub Vec<Passage>);

impl StaticSearch {
    pub fn scored(passages: &[(&str, f32)]) -> Self {
        Self(
            passages
                .iter()
                .map(|(content, score)| Passage::new(*content, *score))
                .collect(),
        )
    }
}

impl SemanticSearch for StaticSearch {
    fn search(
        &self,
        _query: &str,
        _top_k: usize,
        _score_threshold: f32,
    ) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let passages = self.0.clone();
        Box::pin(async move { Ok(passages) })
    }
}

// ── Events ──────────────────────────────────────────────────────

/// Keeps every published event, in publish order.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<ProgressEvent>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn for_channel(&self, channel: &str) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.channel == channel)
            .collect()
    }

    pub fn kinds(&self, channel: &str) -> Vec<ProgressKind> {
        self.for_channel(channel).iter().map(|e| e.kind).collect()
    }

    /// `(node_id, status)` of each step_update on `channel`.
    pub fn step_updates(&self, channel: &str) -> Vec<(String, StepStatus)> {
        self.for_channel(channel)
            .iter()
            .filter(|e| e.kind == ProgressKind::StepUpdate)
            .filter_map(|e| {
                let step = &e.data["step"];
                let node_id = step["nodeId"].as_str()?.to_string();
                let status = serde_json::from_value(step["status"].clone()).ok()?;
                Some((node_id, status))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().map(|e| e.is_empty()).unwrap_or(true)
    }
}

impl EventSink for EventCollector {
    fn publish(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

// ── Files ───────────────────────────────────────────────────────

/// Write `content` to `name` inside a fresh temp dir.
pub fn temp_file(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    (dir, path)
}

/// Serialize `graph` as JSON into `dir/<id>.json`.
pub fn write_graph(dir: &std::path::Path, id: &str, graph: &Graph) -> PathBuf {
    let path = dir.join(format!("{id}.json"));
    let body = serde_json::to_string_pretty(graph).unwrap_or_else(|e| panic!("serialize: {e}"));
    std::fs::write(&path, body).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    path
}

/// Input value most fixtures run with.
pub fn sample_input() -> Value {
    json!("What is a context pipeline?")
}
