use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::graph::Graph;
use ctxforge_core::traits::{GraphLookup, RunStore};
use ctxforge_core::types::{ComparisonRun, ExecutionSession};

/// Graphs stored as `<dir>/<graph_id>.json`.
pub struct GraphDirectory {
    dir: PathBuf,
}

impl GraphDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, graph_id: &str) -> Result<PathBuf> {
        let valid = !graph_id.is_empty()
            && graph_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !graph_id.starts_with('.');
        if !valid {
            return Err(CtxError::GraphNotFound(graph_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", graph_id)))
    }

    /// Ids of every `.json` file in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl GraphLookup for GraphDirectory {
    fn resolve_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let path = self.path_for(&graph_id)?;
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CtxError::GraphNotFound(graph_id));
                }
                Err(e) => return Err(e.into()),
            };
            let mut graph: Graph = serde_json::from_str(&text)
                .map_err(|e| CtxError::InvalidGraph(format!("{}: {}", path.display(), e)))?;
            if graph.id.is_none() {
                graph.id = Some(graph_id);
            }
            debug!(path = %path.display(), "Loaded graph file");
            Ok(graph)
        })
    }
}

/// Fixed in-process graph set.
#[derive(Default)]
pub struct StaticGraphs {
    graphs: RwLock<HashMap<String, Graph>>,
}

impl StaticGraphs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `graph.id`, assigning `graph_id` when the graph has none.
    pub fn insert(&self, graph_id: impl Into<String>, mut graph: Graph) {
        let graph_id = graph_id.into();
        if graph.id.is_none() {
            graph.id = Some(graph_id.clone());
        }
        if let Ok(mut graphs) = self.graphs.write() {
            graphs.insert(graph_id, graph);
        }
    }

    pub fn with(self, graph_id: impl Into<String>, graph: Graph) -> Self {
        self.insert(graph_id, graph);
        self
    }
}

impl GraphLookup for StaticGraphs {
    fn resolve_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let found = self
            .graphs
            .read()
            .ok()
            .and_then(|g| g.get(graph_id).cloned())
            .ok_or_else(|| CtxError::GraphNotFound(graph_id.to_string()));
        Box::pin(async move { found })
    }
}

/// Tries each lookup in turn; only `GraphNotFound` moves on to the next.
#[derive(Default)]
pub struct ChainedLookup {
    lookups: Vec<Arc<dyn GraphLookup>>,
}

impl ChainedLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, lookup: Arc<dyn GraphLookup>) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }
}

impl GraphLookup for ChainedLookup {
    fn resolve_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            for lookup in &self.lookups {
                match lookup.resolve_graph(&graph_id).await {
                    Err(CtxError::GraphNotFound(_)) => continue,
                    other => return other,
                }
            }
            Err(CtxError::GraphNotFound(graph_id))
        })
    }
}

/// Process-local terminal-state store.
#[derive(Default)]
pub struct MemoryRunStore {
    sessions: RwLock<HashMap<String, ExecutionSession>>,
    comparisons: RwLock<HashMap<String, ComparisonRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn comparison_count(&self) -> usize {
        self.comparisons.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn lock_err(e: impl std::fmt::Display) -> CtxError {
    CtxError::Database(e.to_string())
}

impl RunStore for MemoryRunStore {
    fn save_session(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();
        Box::pin(async move {
            self.sessions
                .write()
                .map_err(lock_err)?
                .insert(session.session_id.0.clone(), session);
            Ok(())
        })
    }

    fn load_session(&self, session_id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>> {
        let found = self
            .sessions
            .read()
            .map(|s| s.get(session_id).cloned())
            .map_err(lock_err);
        Box::pin(async move { found })
    }

    fn save_comparison(&self, run: &ComparisonRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.comparisons
                .write()
                .map_err(lock_err)?
                .insert(run.comparison_id.0.clone(), run);
            Ok(())
        })
    }

    fn load_comparison(
        &self,
        comparison_id: &str,
    ) -> BoxFuture<'_, Result<Option<ComparisonRun>>> {
        let found = self
            .comparisons
            .read()
            .map(|c| c.get(comparison_id).cloned())
            .map_err(lock_err);
        Box::pin(async move { found })
    }
}
