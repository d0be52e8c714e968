pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod node_config;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CtxError, Result};
pub use event::{EventBus, ProgressEvent, ProgressKind};
pub use graph::{Graph, GraphEdge, GraphNode, NodeVariant};
pub use types::*;
