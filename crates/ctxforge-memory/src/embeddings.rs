use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ctxforge_core::config::EmbeddingConfig;
use ctxforge_core::error::{CtxError, Result};

/// Turns retrieval text into vectors for `DocumentIndex`.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// One vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;
    fn dimensions(&self) -> usize;
}

/// Default `/embeddings` endpoint for a `retrieval.embedding.provider` name.
fn embedding_base_url(provider: &str) -> &'static str {
    match provider {
        "ollama" => "http://localhost:11434/v1",
        "together" => "https://api.together.xyz/v1",
        "mistral" => "https://api.mistral.ai/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Embeds chunks and queries for the `[retrieval.embedding]` section.
///
/// Speaks the OpenAI `/embeddings` wire format, which ollama, together and
/// mistral also serve. Vectors of the wrong width are rejected so the index
/// never mixes models.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
            dims,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or_else(|| embedding_base_url(&config.provider));
        Self::new(
            base_url,
            config.api_key.as_deref(),
            &config.model,
            config.dimensions,
        )
    }
}

#[derive(Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedReply {
    data: Vec<EmbedRow>,
}

#[derive(Deserialize)]
struct EmbedRow {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Order rows by their reported index and check count and width.
fn collect_vectors(mut rows: Vec<EmbedRow>, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if rows.len() != expected {
        return Err(CtxError::Search(format!(
            "embedding reply has {} vectors for {} texts",
            rows.len(),
            expected
        )));
    }
    rows.sort_by_key(|r| r.index.unwrap_or(usize::MAX));
    rows.into_iter()
        .map(|r| {
            if r.embedding.len() == dims {
                Ok(r.embedding)
            } else {
                Err(CtxError::Search(format!(
                    "embedding width {} does not match configured dimensions {}",
                    r.embedding.len(),
                    dims
                )))
            }
        })
        .collect()
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let texts = texts.to_vec();
        Box::pin(async move {
            if texts.is_empty() {
                return Ok(vec![]);
            }
            let mut req = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .json(&EmbedBody {
                    model: &self.model,
                    input: &texts,
                });
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req.send().await.map_err(|e| CtxError::Provider {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("embedding request failed: {}", e),
            })?;
            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(CtxError::Provider {
                    status: status.as_u16(),
                    message,
                });
            }

            let reply: EmbedReply = resp
                .json()
                .await
                .map_err(|e| CtxError::Search(format!("bad embedding reply: {}", e)))?;
            debug!(model = %self.model, texts = texts.len(), "Embedded batch");
            collect_vectors(reply.data, texts.len(), self.dims)
        })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Little-endian f32 blob, as stored in SQLite.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_vector_blob() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[test]
    fn test_from_config_default_urls() {
        let cfg = EmbeddingConfig {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            base_url: None,
            api_key: None,
            dimensions: 768,
        };
        let p = HttpEmbeddingProvider::from_config(&cfg);
        assert_eq!(p.base_url, "http://localhost:11434/v1");
        assert_eq!(p.dimensions(), 768);

        let p = HttpEmbeddingProvider::from_config(&EmbeddingConfig {
            provider: "custom".into(),
            base_url: Some("http://embed.local/v1/".into()),
            ..cfg
        });
        assert_eq!(p.base_url, "http://embed.local/v1");
    }

    fn row(index: usize, embedding: Vec<f32>) -> EmbedRow {
        EmbedRow {
            index: Some(index),
            embedding,
        }
    }

    #[test]
    fn test_collect_vectors_restores_input_order() {
        let rows = vec![row(1, vec![0.0, 1.0]), row(0, vec![1.0, 0.0])];
        let vectors = collect_vectors(rows, 2, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_collect_vectors_rejects_wrong_shape() {
        assert!(matches!(
            collect_vectors(vec![row(0, vec![1.0])], 2, 1),
            Err(CtxError::Search(_))
        ));
        assert!(matches!(
            collect_vectors(vec![row(0, vec![1.0, 2.0, 3.0])], 1, 2),
            Err(CtxError::Search(_))
        ));
    }
}
