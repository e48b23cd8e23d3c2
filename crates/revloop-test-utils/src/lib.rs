//! Mocks and fixtures shared by the revloop test suites.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use revloop_core::config::ModelConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::{Generator, LlmClient};
use revloop_core::types::{ChatMessage, StopReason, StreamDelta, ToolDefinition};

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum MockTurn {
    Text(String),
    /// (id, name, arguments JSON)
    ToolCalls(Vec<(String, String, String)>),
    Fail(String),
}

/// An `LlmClient` that replays scripted turns and records what it was sent.
#[derive(Default)]
pub struct MockLlmClient {
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolDefinition>)>>,
}

impl MockLlmClient {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| MockTurn::Text(t.to_string())).collect())
    }

    /// Messages of every request so far, in call order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Tool names offered on the most recent request.
    pub fn last_tool_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|(_, tools)| tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests
            .lock()
            .unwrap()
            .push((messages, tools.to_vec()));
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockTurn::Fail("mock exhausted".into()));

        Box::pin(async move {
            let deltas: Vec<Result<StreamDelta>> = match turn {
                MockTurn::Fail(msg) => return Err(RevloopError::LlmRequest(msg)),
                MockTurn::Text(text) => {
                    // split in two to exercise accumulation
                    let mid = text.char_indices().nth(text.chars().count() / 2).map(|(i, _)| i).unwrap_or(0);
                    let (a, b) = text.split_at(mid);
                    vec![
                        Ok(StreamDelta::TextDelta(a.to_string())),
                        Ok(StreamDelta::TextDelta(b.to_string())),
                        Ok(StreamDelta::Stop(StopReason::EndTurn)),
                    ]
                }
                MockTurn::ToolCalls(calls) => {
                    let mut out = Vec::new();
                    for (index, (id, name, args)) in calls.into_iter().enumerate() {
                        out.push(Ok(StreamDelta::ToolUseStart { index, id, name }));
                        out.push(Ok(StreamDelta::ToolInputDelta { index, delta: args }));
                    }
                    out.push(Ok(StreamDelta::Stop(StopReason::ToolUse)));
                    out
                }
            };
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// A `Generator` that returns queued results and records `(input, feedback)` pairs.
#[derive(Default)]
pub struct ScriptedGenerator {
    outputs: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new(outputs: &[&str]) -> Self {
        Self {
            outputs: Mutex::new(outputs.iter().map(|o| Ok(o.to_string())).collect()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long inside every generation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful output.
    pub fn push_ok(&self, output: &str) {
        self.outputs.lock().unwrap().push_back(Ok(output.to_string()));
    }

    /// Queue a failure.
    pub fn push_err(&self, message: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate<'a>(&'a self, input: &'a str, feedback: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((input.to_string(), feedback.to_string()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.outputs.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(RevloopError::GenerationFailure(msg)),
                None => Err(RevloopError::GenerationFailure("no scripted output".into())),
            }
        })
    }
}

pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "mock".into(),
        model_id: "mock-model".into(),
        ..ModelConfig::default()
    }
}

/// Create a SQLite file with a small `sales` table.
pub fn sales_db(dir: &Path) -> PathBuf {
    let path = dir.join("sales.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE sales (
             order_id INTEGER,
             customer TEXT,
             region TEXT,
             product TEXT,
             quantity INTEGER,
             price REAL
         );
         INSERT INTO sales VALUES (1, 'Alice', 'North', 'Widget', 3, 2.5);
         INSERT INTO sales VALUES (2, 'Bob', 'South', 'Gadget', 1, 10.0);
         INSERT INTO sales VALUES (3, 'Carol', 'North', 'Gadget', 2, 10.0);",
    )
    .unwrap();
    path
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}
