use thiserror::Error;

use crate::review::SessionSnapshot;

#[derive(Debug, Error)]
pub enum RevloopError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Review workflow errors
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Invalid decision '{0}' (expected approve or reject)")]
    InvalidDecision(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {session_id} is already {}", .snapshot.status)]
    TerminalSession {
        session_id: String,
        snapshot: Box<SessionSnapshot>,
    },

    #[error("Session {0} was modified concurrently")]
    SessionConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RevloopError>;
