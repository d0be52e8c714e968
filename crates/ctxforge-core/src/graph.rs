use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CtxError, Result};

/// The typed role of a node in a context pipeline.
///
/// Unknown tags deserialize as `Passthrough` so graphs saved by newer editors
/// still run.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeVariant {
    #[serde(alias = "Input")]
    Input,
    #[serde(alias = "Output")]
    Output,
    #[serde(alias = "PromptTemplate", alias = "prompt_template", alias = "prompt")]
    PromptTemplate,
    #[serde(
        alias = "RAGRetriever",
        alias = "RagRetriever",
        alias = "rag_retriever",
        alias = "retriever"
    )]
    RagRetriever,
    #[serde(alias = "MemoryStore", alias = "memory_store", alias = "memory")]
    MemoryStore,
    #[serde(alias = "StateTracker", alias = "state_tracker", alias = "state")]
    StateTracker,
    #[serde(alias = "OutputParser", alias = "output_parser", alias = "parser")]
    OutputParser,
    #[serde(other)]
    Passthrough,
}

impl NodeVariant {
    pub const ALL: [NodeVariant; 8] = [
        Self::Input,
        Self::Output,
        Self::PromptTemplate,
        Self::RagRetriever,
        Self::MemoryStore,
        Self::StateTracker,
        Self::OutputParser,
        Self::Passthrough,
    ];

    /// Wire tag, as used by the editor.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::PromptTemplate => "promptTemplate",
            Self::RagRetriever => "ragRetriever",
            Self::MemoryStore => "memoryStore",
            Self::StateTracker => "stateTracker",
            Self::OutputParser => "outputParser",
            Self::Passthrough => "passthrough",
        }
    }

    /// Human label used for step names when a node has none.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Output => "Output",
            Self::PromptTemplate => "Prompt Template",
            Self::RagRetriever => "RAG Retriever",
            Self::MemoryStore => "Memory Store",
            Self::StateTracker => "State Tracker",
            Self::OutputParser => "Output Parser",
            Self::Passthrough => "Passthrough",
        }
    }
}

impl std::fmt::Display for NodeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A node placed on the canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type", alias = "variant")]
    pub variant: NodeVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Variant-specific settings; see `node_config` for the typed views.
    #[serde(default, alias = "data")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, variant: NodeVariant) -> Self {
        Self {
            id: id.into(),
            variant,
            label: None,
            config: serde_json::Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set a single config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn step_name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.variant.display_name().to_string())
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }
}

/// A complete pipeline as built in the editor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    /// None for ad-hoc graphs that were never saved.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            id: None,
            name: String::new(),
            nodes,
            edges,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges ending at `node_id`, in declaration order.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Check the structural invariants: unique node ids, edges between known nodes.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(CtxError::InvalidGraph("node with empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(CtxError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(CtxError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        Ok(())
    }
}
