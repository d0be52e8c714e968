use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtxError {
    // Graph errors
    #[error("Graph contains a cycle (unscheduled node: {node_id})")]
    CycleDetected { node_id: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    // Execution errors
    #[error("Node {node_id} failed: {cause}")]
    NodeExecution { node_id: String, cause: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Too many graphs to compare: {requested} (limit {limit})")]
    TooManyComparisons { requested: usize, limit: usize },

    // Provider errors
    #[error("Provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Semantic search failed: {0}")]
    Search(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CtxError {
    /// Wrap any error raised while a node ran.
    pub fn node(node_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            cause: cause.to_string(),
        }
    }

    /// Node id carried by the error, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeExecution { node_id, .. } | Self::CycleDetected { node_id } => {
                Some(node_id.as_str())
            }
            _ => None,
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::UnsupportedProvider(_))
    }
}

pub type Result<T> = std::result::Result<T, CtxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_keeps_id_and_cause() {
        let provider = CtxError::Provider {
            status: 429,
            message: "rate limited".into(),
        };
        assert!(provider.is_provider());

        let err = CtxError::node("prompt-1", &provider);
        assert_eq!(err.node_id(), Some("prompt-1"));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("rate limited"));
        assert!(!err.is_provider());
    }

    #[test]
    fn cycle_error_names_hint() {
        let err = CtxError::CycleDetected {
            node_id: "b".into(),
        };
        assert_eq!(err.node_id(), Some("b"));
        assert!(err.to_string().contains("b"));
    }
}
