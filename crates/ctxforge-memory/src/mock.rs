use futures::future::BoxFuture;

use ctxforge_core::error::Result;
use ctxforge_core::traits::SemanticSearch;
use ctxforge_core::types::Passage;

const EXCERPT_CHARS: usize = 60;

/// Synthetic search used in mock mode: `top_k` passages with scores falling
/// from 0.95 in steps of 0.1, filtered by the threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSearch;

impl MockSearch {
    fn passages(query: &str, top_k: usize, score_threshold: f32) -> Vec<Passage> {
        let excerpt: String = query.chars().take(EXCERPT_CHARS).collect();
        (0..top_k)
            .map(|i| Passage {
                content: format!("[mock passage {}] Background relevant to: {}", i + 1, excerpt),
                score: 0.95 - 0.1 * i as f32,
                source: Some("mock".to_string()),
            })
            .take_while(|p| p.score > 0.0)
            .filter(|p| p.score >= score_threshold)
            .collect()
    }
}

impl SemanticSearch for MockSearch {
    fn search(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let passages = Self::passages(query, top_k, score_threshold);
        Box::pin(async move { Ok(passages) })
    }
}
