use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RevloopError};

/// Top-level revloop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_workspace() -> String { "~/.revloop".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Extra HTTP headers sent with every request (merged over preset headers).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "groq".to_string() }
fn default_model_id() -> String { "openai/gpt-oss-120b".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: HashMap::new(),
        }
    }
}

/// Where review sessions are persisted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Human-in-the-loop review policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Attempt count at which a rejection becomes final (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sessions untouched for this long are treated as unknown. None = never expire.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
    /// Session store used by `serve` (default: memory). CLI review commands
    /// always use the SQLite store so sessions survive between invocations.
    #[serde(default)]
    pub store: StoreKind,
    /// SQLite file for the durable store. Default: <workspace>/reviews.db
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            session_ttl_secs: None,
            store: StoreKind::default(),
            database: None,
        }
    }
}

fn default_max_attempts() -> u32 { 3 }

/// SQL agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    /// SQLite database queried by the SQL agent.
    #[serde(default = "default_sql_database")]
    pub database: String,
    /// Table the agent is told to use when translating questions.
    #[serde(default = "default_table_hint")]
    pub table_hint: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            database: default_sql_database(),
            table_hint: default_table_hint(),
        }
    }
}

fn default_sql_database() -> String { "sqlite-db/sales.db".to_string() }
fn default_table_hint() -> String { "sales".to_string() }

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
            .map_err(|_| RevloopError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| RevloopError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from environment variables alone.
    ///
    /// `GROQ_API_KEY` selects Groq, `OPENAI_API_KEY` selects OpenAI, and with
    /// neither set a local Ollama endpoint is assumed.
    pub fn from_env() -> Self {
        let groq_key = std::env::var("GROQ_API_KEY").ok();
        let openai_key = std::env::var("OPENAI_API_KEY").ok();

        let model = if let Some(key) = groq_key {
            ModelConfig {
                api_key: Some(key),
                ..ModelConfig::default()
            }
        } else if let Some(key) = openai_key {
            ModelConfig {
                provider: "openai".to_string(),
                model_id: "gpt-4o".to_string(),
                api_key: Some(key),
                ..ModelConfig::default()
            }
        } else {
            ModelConfig {
                provider: "ollama".to_string(),
                model_id: "llama3.2".to_string(),
                ..ModelConfig::default()
            }
        };

        Self {
            model,
            review: ReviewConfig::default(),
            sql: SqlConfig::default(),
            gateway: GatewayConfig::default(),
            workspace: default_workspace(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.review.max_attempts == 0 {
            return Err(RevloopError::Config(
                "review.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.model.model_id.trim().is_empty() {
            return Err(RevloopError::Config("model.model_id is empty".to_string()));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Resolve the review database path.
    pub fn review_db_path(&self) -> PathBuf {
        match &self.review.database {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("reviews.db"),
        }
    }

    /// Resolve the SQL agent's database path.
    pub fn sql_db_path(&self) -> PathBuf {
        expand_home(&self.sql.database)
    }
}

fn expand_home(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(p)
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

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
