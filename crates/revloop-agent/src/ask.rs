use std::sync::Arc;

use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::Generator;

/// One prompt in, one completion out. No review, no state.
pub struct AskAgent {
    generator: Arc<dyn Generator>,
}

impl AskAgent {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    pub async fn ask(&self, prompt: &str) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(RevloopError::InvalidInput("prompt is empty".into()));
        }
        self.generator.generate(prompt, "").await
    }
}

/// Words that end an interactive ask session.
pub fn is_exit_command(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "exit" | "quit" | "q"
    )
}
