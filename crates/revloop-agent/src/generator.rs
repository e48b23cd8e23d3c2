use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use revloop_core::config::ModelConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::{Generator, LlmClient};
use revloop_core::types::ChatMessage;

/// Build the prompt for one generation.
pub fn build_prompt(input: &str, feedback: &str) -> String {
    if feedback.trim().is_empty() {
        return input.to_string();
    }
    format!(
        "{}\n\nHuman feedback: {}\nPlease revise accordingly.",
        input, feedback
    )
}

/// Generator backed by a chat-completions model.
pub struct LlmGenerator {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    system_prompt: Option<String>,
}

impl LlmGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            llm,
            config,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

impl Generator for LlmGenerator {
    fn generate<'a>(&'a self, input: &'a str, feedback: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let prompt = build_prompt(input, feedback);
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = &self.system_prompt {
                messages.push(ChatMessage::system(system.clone()));
            }
            messages.push(ChatMessage::user(prompt));

            debug!(
                model = %self.config.model_id,
                revised = !feedback.trim().is_empty(),
                "Generating candidate"
            );

            revloop_llm::complete_text(self.llm.as_ref(), &self.config, messages)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Generation failed");
                    RevloopError::GenerationFailure(e.to_string())
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_test_utils::{test_model_config, MockLlmClient, MockTurn};

    #[test]
    fn prompt_without_feedback_is_input() {
        assert_eq!(build_prompt("hello", ""), "hello");
        assert_eq!(build_prompt("hello", "  "), "hello");
    }

    #[test]
    fn prompt_with_feedback_asks_for_revision() {
        assert_eq!(
            build_prompt("hello", "shorten it\nadd an example"),
            "hello\n\nHuman feedback: shorten it\nadd an example\nPlease revise accordingly."
        );
    }

    #[tokio::test]
    async fn collects_streamed_text() {
        let llm = Arc::new(MockLlmClient::with_texts(&["A short poem."]));
        let gen = LlmGenerator::new(llm.clone(), test_model_config());
        let out = gen.generate("write a poem", "").await.unwrap();
        assert_eq!(out, "A short poem.");
        let reqs = llm.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0][0].text(), "write a poem");
    }

    #[tokio::test]
    async fn system_prompt_goes_first() {
        let llm = Arc::new(MockLlmClient::with_texts(&["ok"]));
        let gen = LlmGenerator::new(llm.clone(), test_model_config()).with_system_prompt("be terse");
        gen.generate("hi", "").await.unwrap();
        let reqs = llm.requests();
        assert_eq!(reqs[0].len(), 2);
        assert_eq!(reqs[0][0].text(), "be terse");
    }

    #[tokio::test]
    async fn transport_failure_is_generation_failure() {
        let llm = Arc::new(MockLlmClient::new(vec![MockTurn::Fail("HTTP 503".into())]));
        let gen = LlmGenerator::new(llm, test_model_config());
        let err = gen.generate("x", "").await.unwrap_err();
        assert!(matches!(err, RevloopError::GenerationFailure(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn empty_completion_is_generation_failure() {
        let llm = Arc::new(MockLlmClient::with_texts(&["   "]));
        let gen = LlmGenerator::new(llm, test_model_config());
        assert!(matches!(
            gen.generate("x", "").await,
            Err(RevloopError::GenerationFailure(_))
        ));
    }
}
