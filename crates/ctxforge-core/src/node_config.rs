//! Typed views over a node's free-form `config` map.
//!
//! The editor stores settings as camelCase JSON; snake_case keys are accepted
//! as aliases. Missing keys take the defaults below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CtxError, Result};
use crate::graph::GraphNode;

/// Deserialize a node's config into one of the typed views.
pub fn parse<T: DeserializeOwned>(node: &GraphNode) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(node.config.clone())).map_err(|e| {
        CtxError::InvalidGraph(format!("node '{}' has invalid config: {}", node.id, e))
    })
}

/// Model selection shared by every node that ends in a chat completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "system_prompt")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplateConfig {
    #[serde(default = "default_template")]
    pub template: String,
    /// Declared variable names; informational, substitution uses whatever resolves.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(flatten)]
    pub model: ModelSettings,
}

fn default_template() -> String {
    "{prompt}".to_string()
}

impl Default for PromptTemplateConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            variables: vec![],
            model: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieverConfig {
    /// Vector-store descriptor (e.g. "pinecone:docs"); informational for local indexes.
    #[serde(default, alias = "vector_store")]
    pub vector_store: Option<String>,
    #[serde(default = "default_top_k", alias = "top_k")]
    pub top_k: usize,
    #[serde(default = "default_score_threshold", alias = "score_threshold")]
    pub score_threshold: f32,
    /// When set, retrieved context is forwarded into this prompt.
    #[serde(default, alias = "prompt_template", alias = "prompt")]
    pub prompt_template: Option<String>,
    #[serde(flatten)]
    pub model: ModelSettings,
}

fn default_top_k() -> usize { 5 }
fn default_score_threshold() -> f32 { 0.7 }

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            vector_store: None,
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
            prompt_template: None,
            model: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOperation {
    #[default]
    Store,
    Append,
    Retrieve,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default)]
    pub operation: MemoryOperation,
    /// Storage key; defaults to the node id.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_memory_max_tokens", alias = "max_tokens")]
    pub max_tokens: usize,
    #[serde(default, alias = "ttl", alias = "ttl_secs")]
    pub ttl_secs: Option<u64>,
}

fn default_memory_max_tokens() -> usize { 2000 }

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            operation: MemoryOperation::default(),
            key: None,
            max_tokens: default_memory_max_tokens(),
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTrackerConfig {
    #[serde(default = "default_tracking_type", alias = "tracking_type")]
    pub tracking_type: String,
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
    #[serde(default)]
    pub transitions: Vec<serde_json::Value>,
}

fn default_tracking_type() -> String {
    "conversation".to_string()
}

impl Default for StateTrackerConfig {
    fn default() -> Self {
        Self {
            tracking_type: default_tracking_type(),
            conditions: vec![],
            transitions: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserType {
    Json,
    List,
    Structured,
    #[default]
    #[serde(other)]
    Text,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParserConfig {
    #[serde(default, alias = "parser_type", alias = "format")]
    pub parser_type: ParserType,
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl OutputParserConfig {
    /// Field names for structured parsing: explicit `fields`, else the
    /// schema's `properties` keys, else a flat list of strings in `schema`.
    pub fn field_names(&self) -> Vec<String> {
        if !self.fields.is_empty() {
            return self.fields.clone();
        }
        match &self.schema {
            Some(serde_json::Value::Object(obj)) => match obj.get("properties") {
                Some(serde_json::Value::Object(props)) => props.keys().cloned().collect(),
                _ => obj.keys().cloned().collect(),
            },
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }
}
