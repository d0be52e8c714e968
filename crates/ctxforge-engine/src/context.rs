use std::sync::Arc;

use tracing::{info, warn};

use ctxforge_core::config::AppConfig;
use ctxforge_core::error::Result;
use ctxforge_core::traits::{ChatProvider, MemoryBackend, SemanticSearch};
use ctxforge_llm::{ProviderRouter, RateTable};
use ctxforge_memory::{DocumentIndex, EmbeddingProvider, HttpEmbeddingProvider, KvMemory, MockSearch, SqliteStore};

/// Model settings used when a node leaves them unset.
#[derive(Debug, Clone)]
pub struct ModelDefaults {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        let engine = ctxforge_core::config::EngineConfig::default();
        Self {
            provider: engine.default_provider,
            model: engine.default_model,
            temperature: engine.default_temperature,
            max_tokens: engine.default_max_tokens,
        }
    }
}

/// Everything an executor may reach. Shared read-only by concurrent sessions.
#[derive(Clone)]
pub struct RuntimeContext {
    pub chat: Arc<dyn ChatProvider>,
    pub search: Arc<dyn SemanticSearch>,
    pub rates: Arc<RateTable>,
    /// Where MemoryStore intents are applied; None drops them.
    pub memory: Option<Arc<dyn MemoryBackend>>,
    pub defaults: ModelDefaults,
    pub chars_per_token: usize,
}

impl RuntimeContext {
    pub fn new(chat: Arc<dyn ChatProvider>, search: Arc<dyn SemanticSearch>) -> Self {
        Self {
            chat,
            search,
            rates: Arc::new(RateTable::default()),
            memory: None,
            defaults: ModelDefaults::default(),
            chars_per_token: 4,
        }
    }

    /// Mock chat and search, in-process memory.
    pub fn mock(seed: Option<u64>) -> Self {
        Self::new(Arc::new(ProviderRouter::mock(seed)), Arc::new(MockSearch))
            .with_memory(Arc::new(KvMemory::new()))
    }

    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = Arc::new(rates);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build from config. In mock mode no network client is created; otherwise
    /// the document index is filled from `retrieval.documents_dir`.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = &config.engine;
        let defaults = ModelDefaults {
            provider: engine.default_provider.clone(),
            model: engine.default_model.clone(),
            temperature: engine.default_temperature,
            max_tokens: engine.default_max_tokens,
        };

        let base = if engine.mock_mode {
            info!("Mock mode: provider calls return synthetic responses");
            Self::mock(engine.mock_seed)
        } else {
            let chat = Arc::new(ProviderRouter::from_config(config)?);
            let search = Arc::new(build_index(config).await?);
            Self::new(chat, search).with_memory(Arc::new(KvMemory::new()))
        };

        let mut ctx = base
            .with_rates(RateTable::from_config(config))
            .with_defaults(defaults);
        ctx.chars_per_token = engine.chars_per_token.max(1);
        Ok(ctx)
    }

    /// Character-count token estimate for providers that report no usage.
    pub fn estimate_tokens(&self, text: &str) -> u64 {
        text.chars().count().div_ceil(self.chars_per_token.max(1)) as u64
    }
}

async fn build_index(config: &AppConfig) -> Result<DocumentIndex> {
    let embedder: Option<Arc<dyn EmbeddingProvider>> = config
        .retrieval
        .embedding
        .as_ref()
        .map(|e| Arc::new(HttpEmbeddingProvider::from_config(e)) as Arc<dyn EmbeddingProvider>);

    let index = DocumentIndex::new(Arc::new(SqliteStore::in_memory()?), embedder);

    if let Some(dir) = config.documents_dir() {
        if dir.is_dir() {
            index.index_dir(&dir, config.retrieval.chunk_chars).await?;
        } else {
            warn!(dir = %dir.display(), "Documents directory not found, retrieval index is empty");
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        let ctx = RuntimeContext::mock(Some(1));
        assert_eq!(ctx.estimate_tokens(""), 0);
        assert_eq!(ctx.estimate_tokens("abcd"), 1);
        assert_eq!(ctx.estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_from_config_mock() {
        let config = AppConfig::parse(
            "[engine]\nmock_mode = true\ndefault_model = \"gpt-4o\"\nchars_per_token = 3\n",
        )
        .unwrap();
        let ctx = RuntimeContext::from_config(&config).await.unwrap();
        assert_eq!(ctx.defaults.model, "gpt-4o");
        assert_eq!(ctx.chars_per_token, 3);
        assert!(ctx.memory.is_some());
    }

    #[tokio::test]
    async fn test_from_config_indexes_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "Kahn scheduling algorithm").unwrap();
        let config = AppConfig::parse(&format!(
            "[retrieval]\ndocuments_dir = \"{}\"\n",
            dir.path().display()
        ))
        .unwrap();

        let ctx = RuntimeContext::from_config(&config).await.unwrap();
        let hits = ctx.search.search("kahn algorithm", 3, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
