use std::io::Write;

use ctxforge_core::config::AppConfig;
use ctxforge_core::error::CtxError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
mock_mode = true
max_comparison_graphs = 4
default_provider = "anthropic"
default_model = "claude-3-5-haiku-latest"
default_temperature = 0.2
mock_seed = 7

[providers.openai]
api_key = "sk-test-key"
timeout_secs = 30

[providers.groq]
base_url = "https://api.groq.com/openai/v1"

[[pricing]]
provider = "openai"
model = "gpt-4o-mini"
input_per_1k = 0.5
output_per_1k = 1.5

[pricing_default]
input_per_1k = 0.01
output_per_1k = 0.02

[retrieval]
documents_dir = "/tmp/ctxforge-docs"
chunk_chars = 400

[retrieval.embedding]
provider = "ollama"
model = "nomic-embed-text"
dimensions = 768

[store]
path = "/tmp/ctxforge-test/ctxforge.db"
graphs_dir = "/tmp/ctxforge-test/graphs"

[log]
level = 3
log_dir = "/tmp/ctxforge-test/logs"

[gateway]
bind = "0.0.0.0:9999"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert!(config.engine.mock_mode);
    assert_eq!(config.engine.max_comparison_graphs, 4);
    assert_eq!(config.engine.default_provider, "anthropic");
    assert_eq!(config.engine.mock_seed, Some(7));
    // Unset engine keys keep their defaults
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.engine.chars_per_token, 4);

    let openai = &config.providers["openai"];
    assert_eq!(openai.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(openai.timeout_secs, 30);
    assert_eq!(config.providers["groq"].timeout_secs, 60);

    assert_eq!(config.pricing.len(), 1);
    assert_eq!(config.pricing[0].model, "gpt-4o-mini");
    assert!((config.pricing_default.output_per_1k - 0.02).abs() < 1e-12);

    let embedding = config.retrieval.embedding.as_ref().expect("embedding present");
    assert_eq!(embedding.provider, "ollama");
    assert_eq!(embedding.dimensions, 768);
    assert_eq!(config.retrieval.chunk_chars, 400);

    assert_eq!(
        config.store_path().unwrap().to_str(),
        Some("/tmp/ctxforge-test/ctxforge.db")
    );
    assert_eq!(
        config.log_dir().unwrap().to_str(),
        Some("/tmp/ctxforge-test/logs")
    );
    assert_eq!(config.log.as_ref().unwrap().level, 3);
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CTXFORGE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[providers.openai]
api_key = "${CTXFORGE_TEST_API_KEY}"

[providers.anthropic]
api_key = "${CTXFORGE_TEST_UNSET_VAR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.providers["openai"].api_key.as_deref(),
        Some("expanded-key-value")
    );
    // Unset variables are kept literally
    assert_eq!(
        config.providers["anthropic"].api_key.as_deref(),
        Some("${CTXFORGE_TEST_UNSET_VAR}")
    );

    std::env::remove_var("CTXFORGE_TEST_API_KEY");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert!(!config.engine.mock_mode);
    assert_eq!(config.engine.max_comparison_graphs, 10);
    assert_eq!(config.engine.default_model, "gpt-4o-mini");
    assert_eq!(config.engine.default_max_tokens, 1024);
    assert!(config.providers.is_empty());
    assert!(config.pricing.is_empty());
    assert!((config.pricing_default.input_per_1k - 0.001).abs() < 1e-12);
    assert_eq!(config.retrieval.chunk_chars, 800);
    assert!(config.store_path().is_none());
    assert!(config.log_dir().is_none());
    assert_eq!(config.gateway.bind, "127.0.0.1:18790");
}

#[test]
fn test_disabled_log_has_no_dir() {
    let config = AppConfig::parse("[log]\nenabled = false\nlog_dir = \"/tmp/x\"\n").unwrap();
    assert!(config.log_dir().is_none());
}

#[test]
fn test_rejects_zero_comparison_limit() {
    let err = AppConfig::parse("[engine]\nmax_comparison_graphs = 0\n").unwrap_err();
    assert!(matches!(err, CtxError::Config(_)));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, CtxError::ConfigNotFound(_)));
}

