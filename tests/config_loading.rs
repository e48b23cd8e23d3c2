use std::io::Write;

use revloop_core::config::{AppConfig, StoreKind};
use revloop_core::RevloopError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
workspace = "/tmp/revloop-test"

[model]
provider = "openai"
model_id = "gpt-4o"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.2

[model.extra_headers]
X-Team = "reviews"

[review]
max_attempts = 5
session_ttl_secs = 3600
store = "sqlite"
database = "/tmp/revloop-test/custom.db"

[sql]
database = "/data/warehouse.db"
table_hint = "orders"

[gateway]
bind = "0.0.0.0:9999"
"#;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(toml_content.as_bytes()).unwrap();

    let config = AppConfig::load(f.path()).unwrap();
    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_id, "gpt-4o");
    assert_eq!(config.model.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(config.model.max_tokens, 2048);
    assert_eq!(config.model.extra_headers["X-Team"], "reviews");
    assert_eq!(config.review.max_attempts, 5);
    assert_eq!(config.review.session_ttl_secs, Some(3600));
    assert_eq!(config.review.store, StoreKind::Sqlite);
    assert_eq!(
        config.review_db_path(),
        std::path::PathBuf::from("/tmp/revloop-test/custom.db")
    );
    assert_eq!(config.sql.table_hint, "orders");
    assert_eq!(
        config.sql_db_path(),
        std::path::PathBuf::from("/data/warehouse.db")
    );
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("REVLOOP_TEST_GROQ_KEY", "gsk-from-env");
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"[model]\napi_key = \"${REVLOOP_TEST_GROQ_KEY}\"\n")
        .unwrap();

    let config = AppConfig::load(f.path()).unwrap();
    assert_eq!(config.model.api_key.as_deref(), Some("gsk-from-env"));
    assert_eq!(config.model.provider, "groq");
    std::env::remove_var("REVLOOP_TEST_GROQ_KEY");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/revloop.toml")).unwrap_err();
    assert!(matches!(err, RevloopError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"[review\nmax_attempts = ").unwrap();
    assert!(matches!(
        AppConfig::load(f.path()),
        Err(RevloopError::Config(_))
    ));
}

#[test]
fn test_zero_attempt_cap_rejected_on_load() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"[review]\nmax_attempts = 0\n").unwrap();
    assert!(matches!(
        AppConfig::load(f.path()),
        Err(RevloopError::Config(msg)) if msg.contains("max_attempts")
    ));
}
