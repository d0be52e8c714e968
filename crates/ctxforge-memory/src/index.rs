//! Document index behind the semantic-search capability.
//!
//! Chunks live in [`SqliteStore`]. With an embedding provider, queries are
//! scored by cosine similarity; without one, by query-term coverage.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use ctxforge_core::error::Result;
use ctxforge_core::traits::SemanticSearch;
use ctxforge_core::types::Passage;

use crate::embeddings::EmbeddingProvider;
use crate::store::SqliteStore;

pub struct DocumentIndex {
    store: Arc<SqliteStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl DocumentIndex {
    pub fn new(store: Arc<SqliteStore>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { store, embedder }
    }

    /// Split `text` into chunks and index them.
    pub async fn index_text(&self, source: Option<&str>, text: &str, chunk_chars: usize) -> Result<usize> {
        let chunks = chunk_text(text, chunk_chars);
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            ids.push(self.store.insert_chunk(source, chunk)?);
        }

        if let Some(embedder) = &self.embedder {
            let vectors = embedder.embed(&chunks).await?;
            for (id, vector) in ids.iter().zip(vectors.iter()) {
                self.store.store_embedding(*id, vector)?;
            }
        }

        debug!(source = source.unwrap_or("-"), chunks = chunks.len(), "Indexed text");
        Ok(chunks.len())
    }

    /// Index every `.txt` and `.md` file directly under `dir`.
    pub async fn index_dir(&self, dir: &Path, chunk_chars: usize) -> Result<usize> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("md")
            ) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut total = 0;
        for path in paths {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable document");
                    continue;
                }
            };
            let source = path.file_name().and_then(|n| n.to_str()).map(String::from);
            total += self.index_text(source.as_deref(), &text, chunk_chars).await?;
        }

        info!(dir = %dir.display(), chunks = total, "Document index built");
        Ok(total)
    }

    async fn ranked(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        if let Some(embedder) = &self.embedder {
            let vectors = embedder.embed(&[query.to_string()]).await?;
            let Some(query_vec) = vectors.into_iter().next() else {
                return Ok(vec![]);
            };
            return self.store.search_similar(&query_vec, top_k);
        }

        let terms = terms(query);
        let mut scored: Vec<Passage> = self
            .store
            .chunks()?
            .into_iter()
            .map(|c| Passage {
                score: term_coverage(&terms, &c.content),
                content: c.content,
                source: c.source,
            })
            .filter(|p| p.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

impl SemanticSearch for DocumentIndex {
    fn search(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let query = query.to_string();
        Box::pin(async move {
            let mut passages = self.ranked(&query, top_k).await?;
            passages.retain(|p| p.score >= score_threshold);
            Ok(passages)
        })
    }
}

/// Split on blank lines, packing paragraphs into chunks of at most
/// `max_chars`. A single oversized paragraph is split on char boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();
        let current_len = current.chars().count();

        if !current.is_empty() && current_len + 2 + para_len > max_chars {
            chunks.push(std::mem::take(&mut current));
        }

        if para_len > max_chars {
            let chars: Vec<char> = para.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Fraction of query terms present in `content`.
fn term_coverage(query_terms: &HashSet<String>, content: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = terms(content);
    let hits = query_terms.iter().filter(|t| content_terms.contains(*t)).count();
    hits as f32 / query_terms.len() as f32
}
