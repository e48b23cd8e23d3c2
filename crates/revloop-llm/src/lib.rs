pub mod providers;
pub mod streaming;

use futures::StreamExt;

use revloop_core::config::ModelConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::LlmClient;
use revloop_core::types::{ChatMessage, StreamDelta};

pub use providers::openai::OpenAiClient;

/// Create an LLM client for the configured provider.
///
/// Every supported provider speaks the OpenAI chat-completions protocol;
/// presets only change the endpoint and headers.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    if providers::presets::get_preset(&config.provider).is_none() && config.provider != "openai" {
        tracing::warn!(
            provider = %config.provider,
            "Unknown provider, treating it as OpenAI-compatible"
        );
    }
    Box::new(OpenAiClient::new())
}

/// Run a single chat request and collect the streamed text.
pub async fn complete_text(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let mut stream = llm.chat_stream(config, messages, &[]).await?;
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        if let StreamDelta::TextDelta(chunk) = delta? {
            text.push_str(&chunk);
        }
    }
    if text.trim().is_empty() {
        return Err(RevloopError::LlmParse("model returned an empty response".into()));
    }
    Ok(text)
}
