//! Natural-language questions over a SQLite database.
//!
//! Two strategies share one database handle:
//!
//! - **pipeline**: translate → execute → format, one model call.
//! - **tools**: offer `get_table_schema` and `run_sql_query` for a single
//!   model turn and run whatever it calls.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use revloop_core::config::ModelConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::LlmClient;
use revloop_core::types::{ChatMessage, SessionId, StreamDelta, ToolContext};
use revloop_tools::{SqlDatabase, ToolRegistry};

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// Answers questions by generating and running SQL.
pub struct SqlAgent {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    db: Arc<SqlDatabase>,
    tools: ToolRegistry,
    table_hint: String,
}

impl SqlAgent {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, db: Arc<SqlDatabase>) -> Self {
        Self {
            llm,
            config,
            tools: ToolRegistry::with_sql_tools(db.clone()),
            db,
            table_hint: "sales".into(),
        }
    }

    /// Name of the table the model should favour when a question is ambiguous.
    pub fn with_table_hint(mut self, table: impl Into<String>) -> Self {
        self.table_hint = table.into();
        self
    }

    /// Translate, execute, and format in one pass.
    pub async fn answer_pipeline(&self, question: &str) -> Result<String> {
        let question = non_empty(question)?;
        let sql = self.translate(question).await?;
        let result = self.execute_sql(&sql).await?;
        Ok(format_answer(&sql, &result))
    }

    /// Let the model pick tools for a single turn.
    pub async fn answer_with_tools(&self, question: &str) -> Result<String> {
        let question = non_empty(question)?;
        let schema = self.db.schema()?;
        let prompt = format!(
            "User asked: {question}\n\
             Use the 'run_sql_query' tool to answer this using the '{table}' table.\n\
             Here is the exact schema you must use to write the query. Do not invent columns.\n\
             Schema:\n{schema}",
            table = self.table_hint,
        );

        let defs = self.tools.definitions();
        let mut stream = self
            .llm
            .chat_stream(&self.config, vec![ChatMessage::user(prompt)], &defs)
            .await?;

        let mut text = String::new();
        let mut calls: Vec<ToolCallAccumulator> = Vec::new();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(t) => text.push_str(&t),
                StreamDelta::ToolUseStart { index, id, name } => {
                    while calls.len() <= index {
                        calls.push(ToolCallAccumulator::default());
                    }
                    calls[index].id = id;
                    calls[index].name = name;
                }
                StreamDelta::ToolInputDelta { index, delta } => {
                    if let Some(tc) = calls.get_mut(index) {
                        tc.input_json.push_str(&delta);
                    }
                }
                StreamDelta::Stop(_) | StreamDelta::Usage { .. } => {}
            }
        }
        drop(stream);

        let calls: Vec<_> = calls.into_iter().filter(|c| !c.name.is_empty()).collect();
        if calls.is_empty() {
            debug!("Model answered without calling a tool");
            return Ok(text.trim().to_string());
        }

        let ctx = ToolContext::new(SessionId::new());
        let mut last = String::new();
        for call in calls {
            info!(tool = %call.name, id = %call.id, "Model requested tool");
            last = self.run_tool_call(question, &call, ctx.clone()).await?;
        }
        Ok(last)
    }

    async fn run_tool_call(
        &self,
        question: &str,
        call: &ToolCallAccumulator,
        ctx: ToolContext,
    ) -> Result<String> {
        let mut input: serde_json::Value = if call.input_json.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&call.input_json).unwrap_or_else(|e| {
                warn!(tool = %call.name, error = %e, "Unparseable tool arguments");
                serde_json::json!({})
            })
        };

        if call.name == "run_sql_query" {
            let missing = input
                .get("sql")
                .and_then(|v| v.as_str())
                .map_or(true, |s| s.trim().is_empty());
            if missing {
                debug!("run_sql_query called without sql, translating directly");
                let sql = self.translate(question).await?;
                input = serde_json::json!({ "sql": sql });
            }
        }

        match self.tools.execute(&call.name, input, ctx).await {
            Ok(result) => Ok(result.content),
            Err(RevloopError::ToolNotFound(name)) => Ok(format!("Unknown tool: {}", name)),
            Err(e) => Err(e),
        }
    }

    /// Ask the model for a single SQLite statement answering `question`.
    async fn translate(&self, question: &str) -> Result<String> {
        let schema = self.db.schema()?;
        let prompt = format!(
            "You are an expert data analyst. Translate the following natural language question \
             into a valid SQLite query. Prefer the '{table}' table.\n\
             Schema:\n{schema}\n\
             Only return the SQL query without explanation.\n\n\
             Question: {question}",
            table = self.table_hint,
        );
        let raw =
            revloop_llm::complete_text(self.llm.as_ref(), &self.config, vec![ChatMessage::user(prompt)])
                .await?;
        let sql = strip_code_fences(&raw);
        if sql.is_empty() {
            return Err(RevloopError::LlmParse("model returned no SQL".into()));
        }
        info!(sql = %sql, "Generated SQL");
        Ok(sql)
    }

    async fn execute_sql(&self, sql: &str) -> Result<String> {
        let result = self
            .tools
            .execute(
                "run_sql_query",
                serde_json::json!({ "sql": sql }),
                ToolContext::new(SessionId::new()),
            )
            .await?;
        Ok(result.content)
    }
}

pub fn format_answer(sql: &str, result: &str) -> String {
    format!("SQL: {}\n\nResult:\n{}", sql, result)
}

/// Remove a surrounding markdown code fence (```sql … ```) if present.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the info string (e.g. "sql") on the opening line
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

fn non_empty(question: &str) -> Result<&str> {
    let q = question.trim();
    if q.is_empty() {
        return Err(RevloopError::InvalidInput("question is empty".into()));
    }
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_test_utils::{sales_db, temp_dir, test_model_config, MockLlmClient, MockTurn};

    fn agent(dir: &tempfile::TempDir, turns: Vec<MockTurn>) -> (SqlAgent, Arc<MockLlmClient>) {
        let llm = Arc::new(MockLlmClient::new(turns));
        let db = Arc::new(SqlDatabase::open(&sales_db(dir.path())).unwrap());
        (SqlAgent::new(llm.clone(), test_model_config(), db), llm)
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("SELECT 1"), "SELECT 1");
        assert_eq!(strip_code_fences("```sql\nSELECT 1;\n```"), "SELECT 1;");
        assert_eq!(strip_code_fences("  ```\nSELECT 2\n```  "), "SELECT 2");
        assert_eq!(strip_code_fences("```sql\nSELECT 3"), "SELECT 3");
    }

    #[tokio::test]
    async fn pipeline_formats_sql_and_result() {
        let dir = temp_dir();
        let (agent, llm) = agent(
            &dir,
            vec![MockTurn::Text(
                "```sql\nSELECT customer FROM sales WHERE region = 'South'\n```".into(),
            )],
        );
        let answer = agent.answer_pipeline("Who buys in the south?").await.unwrap();
        assert!(answer.starts_with("SQL: SELECT customer FROM sales WHERE region = 'South'\n\nResult:\n"));
        assert!(answer.contains("Bob"));

        let reqs = llm.requests();
        let prompt = reqs[0][0].text();
        assert!(prompt.contains("Table: sales"));
        assert!(prompt.contains("Question: Who buys in the south?"));
    }

    #[tokio::test]
    async fn pipeline_reports_bad_sql_in_result() {
        let dir = temp_dir();
        let (agent, _) = agent(&dir, vec![MockTurn::Text("SELECT nope FROM sales".into())]);
        let answer = agent.answer_pipeline("anything").await.unwrap();
        assert!(answer.contains("Result:\nError executing SQL:"));
    }

    #[tokio::test]
    async fn tool_mode_runs_requested_query() {
        let dir = temp_dir();
        let (agent, llm) = agent(
            &dir,
            vec![MockTurn::ToolCalls(vec![(
                "call_1".into(),
                "run_sql_query".into(),
                r#"{"sql":"SELECT COUNT(*) AS orders FROM sales WHERE region = 'North'"}"#.into(),
            )])],
        );
        let answer = agent.answer_with_tools("How many northern orders?").await.unwrap();
        assert!(answer.starts_with("orders"));
        assert!(answer.contains('2'));
        assert_eq!(llm.last_tool_names(), vec!["get_table_schema", "run_sql_query"]);
    }

    #[tokio::test]
    async fn tool_mode_translates_when_sql_missing() {
        let dir = temp_dir();
        let (agent, llm) = agent(
            &dir,
            vec![
                MockTurn::ToolCalls(vec![("c1".into(), "run_sql_query".into(), "{}".into())]),
                MockTurn::Text("SELECT product FROM sales WHERE order_id = 1".into()),
            ],
        );
        let answer = agent.answer_with_tools("First product?").await.unwrap();
        assert!(answer.contains("Widget"));
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn tool_mode_returns_text_without_calls() {
        let dir = temp_dir();
        let (agent, _) = agent(&dir, vec![MockTurn::Text("I cannot answer that.".into())]);
        assert_eq!(
            agent.answer_with_tools("What is love?").await.unwrap(),
            "I cannot answer that."
        );
    }

    #[tokio::test]
    async fn tool_mode_last_result_wins() {
        let dir = temp_dir();
        let (agent, _) = agent(
            &dir,
            vec![MockTurn::ToolCalls(vec![
                ("a".into(), "get_table_schema".into(), "{}".into()),
                ("b".into(), "lookup_weather".into(), "{}".into()),
            ])],
        );
        assert_eq!(
            agent.answer_with_tools("x").await.unwrap(),
            "Unknown tool: lookup_weather"
        );
    }

    #[tokio::test]
    async fn empty_question_rejected() {
        let dir = temp_dir();
        let (agent, llm) = agent(&dir, vec![]);
        assert!(matches!(
            agent.answer_pipeline(" ").await,
            Err(RevloopError::InvalidInput(_))
        ));
        assert!(llm.requests().is_empty());
    }
}
