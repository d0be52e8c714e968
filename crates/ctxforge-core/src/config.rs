use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CtxError, Result};

/// Top-level ctxforge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub pricing: Vec<PriceEntry>,
    #[serde(default)]
    pub pricing_default: PriceDefault,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Replace every provider call with deterministic synthetic responses.
    #[serde(default)]
    pub mock_mode: bool,
    #[serde(default = "default_max_comparison_graphs")]
    pub max_comparison_graphs: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    /// Used to estimate tokens when a provider reports no usage.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Seed for mock token counts; unset means a fresh seed per process.
    #[serde(default)]
    pub mock_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mock_mode: false,
            max_comparison_graphs: default_max_comparison_graphs(),
            event_capacity: default_event_capacity(),
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
            mock_seed: None,
        }
    }
}

fn default_max_comparison_graphs() -> usize { 10 }
fn default_event_capacity() -> usize { 256 }
fn default_provider() -> String { "openai".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 1024 }
fn default_chars_per_token() -> usize { 4 }

/// Credentials and endpoint for one chat provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            extra_headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 { 60 }

/// Per-model token pricing in USD per 1,000 tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEntry {
    pub provider: String,
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Rate pair applied to models missing from the table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceDefault {
    #[serde(default = "default_input_rate")]
    pub input_per_1k: f64,
    #[serde(default = "default_output_rate")]
    pub output_per_1k: f64,
}

impl Default for PriceDefault {
    fn default() -> Self {
        Self {
            input_per_1k: default_input_rate(),
            output_per_1k: default_output_rate(),
        }
    }
}

fn default_input_rate() -> f64 { 0.001 }
fn default_output_rate() -> f64 { 0.002 }

/// Retrieval index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    /// Directory of `.txt`/`.md` files indexed at startup.
    #[serde(default)]
    pub documents_dir: Option<String>,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embedding: None,
            documents_dir: None,
            chunk_chars: default_chunk_chars(),
        }
    }
}

fn default_chunk_chars() -> usize { 800 }

/// Embedding model configuration for semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "openai", "ollama", or any OpenAI-compatible API.
    pub provider: String,
    /// Model name (e.g., "text-embedding-3-small", "nomic-embed-text").
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
}

fn default_embedding_dims() -> usize { 1536 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database for graphs and terminal run states.
    #[serde(default)]
    pub path: Option<String>,
    /// Directory of `<graph_id>.json` files.
    #[serde(default)]
    pub graphs_dir: Option<String>,
}

/// JSONL progress log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = lifecycle only, 2 = + step outcomes, 3 = every step transition.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CtxError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| CtxError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_comparison_graphs == 0 {
            return Err(CtxError::Config(
                "engine.max_comparison_graphs must be at least 1".into(),
            ));
        }
        if self.engine.chars_per_token == 0 {
            return Err(CtxError::Config("engine.chars_per_token must be at least 1".into()));
        }
        if self.engine.event_capacity == 0 {
            return Err(CtxError::Config("engine.event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolved SQLite path, if configured.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.path.as_deref().map(expand_home)
    }

    pub fn graphs_dir(&self) -> Option<PathBuf> {
        self.store.graphs_dir.as_deref().map(expand_home)
    }

    pub fn documents_dir(&self) -> Option<PathBuf> {
        self.retrieval.documents_dir.as_deref().map(expand_home)
    }

    /// Log directory; defaults to `~/.ctxforge/logs`.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.ctxforge/logs"),
        })
    }
}

/// Expand a leading `~/`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CTXFORGE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CTXFORGE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CTXFORGE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CTXFORGE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CTXFORGE_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(!config.engine.mock_mode);
        assert_eq!(config.engine.max_comparison_graphs, 10);
        assert_eq!(config.engine.chars_per_token, 4);
        assert_eq!(config.engine.default_model, "gpt-4o-mini");
        assert!(config.providers.is_empty());
        assert!(config.log.is_none());
        assert!(config.log_dir().is_none());
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
    }

    #[test]
    fn test_providers_and_pricing() {
        let toml_str = r#"
[engine]
mock_mode = true
default_provider = "anthropic"
default_model = "claude-3-5-haiku-latest"

[providers.anthropic]
api_key = "sk-ant"

[providers.groq]
api_key = "gsk"
base_url = "https://example.test/v1/chat/completions"
timeout_secs = 5

[[pricing]]
provider = "groq"
model = "llama-3.1-8b-instant"
input_per_1k = 0.00005
output_per_1k = 0.00008

[pricing_default]
input_per_1k = 0.01
output_per_1k = 0.03
"#;
        let config = AppConfig::parse(toml_str).unwrap();
        assert!(config.engine.mock_mode);
        assert_eq!(config.providers["anthropic"].api_key.as_deref(), Some("sk-ant"));
        assert_eq!(config.providers["anthropic"].timeout_secs, 60);
        assert_eq!(config.providers["groq"].timeout_secs, 5);
        assert_eq!(config.pricing.len(), 1);
        assert_eq!(config.pricing_default.output_per_1k, 0.03);
    }

    #[test]
    fn test_zero_comparison_limit_rejected() {
        let err = AppConfig::parse("[engine]\nmax_comparison_graphs = 0\n").unwrap_err();
        assert!(matches!(err, CtxError::Config(_)));
    }

    #[test]
    fn test_log_dir_default() {
        let config = AppConfig::parse("[log]\nlevel = 3\n").unwrap();
        let dir = config.log_dir().unwrap();
        assert!(dir.ends_with(".ctxforge/logs") || dir.ends_with("logs"));
        assert_eq!(config.log.unwrap().level, 3);
    }
}
