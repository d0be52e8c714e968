use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::graph::Graph;
use ctxforge_core::traits::{GraphLookup, RunStore};
use ctxforge_core::types::{ComparisonRun, ExecutionSession, Passage};

use crate::embeddings::{cosine_similarity, decode_vector, encode_vector};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS graphs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    graph_id TEXT,
    status TEXT NOT NULL,
    body TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_graph ON sessions(graph_id);

CREATE TABLE IF NOT EXISTS comparisons (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunk_embeddings (
    chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id),
    embedding BLOB NOT NULL
);";

fn db_err(e: impl std::fmt::Display) -> CtxError {
    CtxError::Database(e.to_string())
}

/// A saved graph as listed by [`SqliteStore::list_graphs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub id: String,
    pub name: String,
    pub updated_at: String,
}

/// An indexed document chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: i64,
    pub source: Option<String>,
    pub content: String,
}

/// SQLite-backed store for graphs, terminal run states, and retrieval chunks.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CtxError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

// ── Graphs ──────────────────────────────────────────────────────

impl SqliteStore {
    /// Insert or replace a graph. Graphs without an id get a fresh one.
    pub fn save_graph(&self, graph: &Graph) -> Result<String> {
        let id = graph
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut stored = graph.clone();
        stored.id = Some(id.clone());
        let body = serde_json::to_string(&stored)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO graphs (id, name, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, body = ?3, updated_at = ?4",
            params![id, stored.name, body, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(id)
    }

    pub fn load_graph(&self, graph_id: &str) -> Result<Option<Graph>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM graphs WHERE id = ?1",
                params![graph_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub fn list_graphs(&self) -> Result<Vec<GraphSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, updated_at FROM graphs ORDER BY name, id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GraphSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .map_err(db_err)?;

        let mut graphs = Vec::new();
        for row in rows {
            graphs.push(row.map_err(db_err)?);
        }
        Ok(graphs)
    }

    pub fn delete_graph(&self, graph_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute("DELETE FROM graphs WHERE id = ?1", params![graph_id])
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

// ── Retrieval chunks ────────────────────────────────────────────

impl SqliteStore {
    pub fn insert_chunk(&self, source: Option<&str>, content: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chunks (source, content) VALUES (?1, ?2)",
            params![source, content],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Store an embedding vector for a chunk.
    pub fn store_embedding(&self, chunk_id: i64, embedding: &[f32]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
            params![chunk_id, encode_vector(embedding)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, source, content FROM chunks ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    content: row.get(2)?,
                })
            })
            .map_err(db_err)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(db_err)?);
        }
        Ok(chunks)
    }

    pub fn clear_chunks(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM chunk_embeddings; DELETE FROM chunks;")
            .map_err(db_err)?;
        Ok(())
    }

    /// Chunks similar to a query vector, scored by cosine similarity,
    /// best first, at most `limit`.
    pub fn search_similar(&self, query_vec: &[f32], limit: usize) -> Result<Vec<Passage>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT e.embedding, c.source, c.content
                 FROM chunk_embeddings e
                 JOIN chunks c ON c.id = e.chunk_id",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(0)?;
                let source: Option<String> = row.get(1)?;
                let content: String = row.get(2)?;
                Ok((blob, source, content))
            })
            .map_err(db_err)?;

        let mut scored: Vec<Passage> = Vec::new();
        for row in rows {
            let (blob, source, content) = row.map_err(db_err)?;
            let score = cosine_similarity(query_vec, &decode_vector(&blob));
            scored.push(Passage {
                content,
                score,
                source,
            });
        }

        // Sort by similarity descending
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

impl GraphLookup for SqliteStore {
    fn resolve_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            self.load_graph(&graph_id)?
                .ok_or(CtxError::GraphNotFound(graph_id))
        })
    }
}

impl RunStore for SqliteStore {
    fn save_session(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(session).map(|body| {
            (
                session.session_id.0.clone(),
                session.graph_id.clone(),
                serde_json::to_value(session.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                body,
                session.completed_at.map(|t| t.to_rfc3339()),
            )
        });

        Box::pin(async move {
            let (id, graph_id, status, body, completed_at) = row?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO sessions (id, graph_id, status, body, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, graph_id, status, body, completed_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_session(&self, session_id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn save_comparison(&self, run: &ComparisonRun) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(run).map(|body| {
            (
                run.comparison_id.0.clone(),
                body,
                run.completed_at.map(|t| t.to_rfc3339()),
            )
        });

        Box::pin(async move {
            let (id, body, completed_at) = row?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO comparisons (id, body, completed_at) VALUES (?1, ?2, ?3)",
                params![id, body, completed_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_comparison(
        &self,
        comparison_id: &str,
    ) -> BoxFuture<'_, Result<Option<ComparisonRun>>> {
        let comparison_id = comparison_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM comparisons WHERE id = ?1",
                    params![comparison_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::graph::{GraphEdge, GraphNode, NodeVariant};
    use ctxforge_core::types::{ComparisonId, SessionId};
    use serde_json::json;

    fn chain() -> Graph {
        Graph::new(
            vec![
                GraphNode::new("in", NodeVariant::Input),
                GraphNode::new("out", NodeVariant::Output),
            ],
            vec![GraphEdge::new("in", "out")],
        )
        .with_name("Chain")
    }

    #[tokio::test]
    async fn test_graph_round_trip_through_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.save_graph(&chain()).unwrap();

        let graph = store.resolve_graph(&id).await.unwrap();
        assert_eq!(graph.id.as_deref(), Some(id.as_str()));
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(store.list_graphs().unwrap()[0].name, "Chain");
    }

    #[tokio::test]
    async fn test_missing_graph() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.resolve_graph("nope").await.unwrap_err();
        assert!(matches!(err, CtxError::GraphNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_save_graph_upserts() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.save_graph(&chain().with_id("g1")).unwrap();
        assert_eq!(id, "g1");
        store.save_graph(&chain().with_id("g1").with_name("Renamed")).unwrap();

        let graphs = store.list_graphs().unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].name, "Renamed");
        assert!(store.delete_graph("g1").unwrap());
        assert!(store.load_graph("g1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_and_comparison_persist() {
        let store = SqliteStore::in_memory().unwrap();

        let mut session = ExecutionSession::start(SessionId::new(), Some("g".into()), json!("q"));
        session.complete();
        store.save_session(&session).await.unwrap();
        let loaded = store.load_session(&session.session_id.0).await.unwrap().unwrap();
        assert_eq!(loaded.status, session.status);
        assert!(store.load_session("other").await.unwrap().is_none());

        let mut run = ComparisonRun::start(ComparisonId::new(), json!("q"));
        run.finish(vec![]);
        store.save_comparison(&run).await.unwrap();
        let loaded = store
            .load_comparison(&run.comparison_id.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.summary.graph_count, 0);
    }

    #[test]
    fn test_similarity_search_orders_by_score() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.insert_chunk(Some("a.md"), "alpha").unwrap();
        let b = store.insert_chunk(Some("b.md"), "beta").unwrap();
        store.store_embedding(a, &[1.0, 0.0]).unwrap();
        store.store_embedding(b, &[0.6, 0.8]).unwrap();

        let hits = store.search_similar(&[0.0, 1.0], 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "beta");
        assert!(hits[0].score > hits[1].score);

        store.clear_chunks().unwrap();
        assert!(store.chunks().unwrap().is_empty());
    }

    #[test]
    fn test_open_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ctxforge.db");
        let store = SqliteStore::open(&path).unwrap();
        store.save_graph(&chain().with_id("x")).unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.load_graph("x").unwrap().is_some());
    }
}
