use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::review::ReviewSession;
use crate::types::*;

/// LLM client: OpenAI-compatible streaming.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Produces candidate text for a review session.
pub trait Generator: Send + Sync + 'static {
    /// Generate a candidate for `input`, revised by `feedback` when non-empty.
    fn generate<'a>(&'a self, input: &'a str, feedback: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// A callable tool offered to the model.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Review session persistence keyed by session id.
///
/// `save` must create or replace the session atomically. Replacing is only
/// allowed when the stored `version` is exactly one behind the incoming
/// session; otherwise `save` fails with `SessionConflict` and changes nothing.
pub trait ReviewStore: Send + Sync + 'static {
    fn save<'a>(&'a self, session: &'a ReviewSession) -> BoxFuture<'a, Result<()>>;

    fn load<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<Option<ReviewSession>>>;

    /// Returns true if a session was removed.
    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<bool>>;

    /// All stored sessions, most recently updated first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<ReviewSession>>>;
}
