use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::Tool;
use revloop_core::types::{ToolContext, ToolResult};

use crate::database::SqlDatabase;

/// Interrupts the connection when dropped while still armed. A registry
/// timeout drops the tool future, which aborts the statement instead of
/// leaving it running on the blocking pool.
struct InterruptOnDrop {
    db: Option<Arc<SqlDatabase>>,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.db = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(db) = self.db.take() {
            warn!(path = %db.path().display(), "Interrupting abandoned SQL statement");
            db.interrupt();
        }
    }
}

/// Run a blocking database call off the async runtime.
async fn run_blocking<T, F>(tool: &str, db: &Arc<SqlDatabase>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SqlDatabase) -> Result<T> + Send + 'static,
{
    let guard = InterruptOnDrop {
        db: Some(db.clone()),
    };
    let worker = db.clone();
    let joined = tokio::task::spawn_blocking(move || f(&worker)).await;
    guard.disarm();
    joined.map_err(|e| RevloopError::ToolExecution {
        tool: tool.to_string(),
        message: e.to_string(),
    })?
}

// ── RunSqlQueryTool ─────────────────────────────────────────────

pub struct RunSqlQueryTool {
    db: Arc<SqlDatabase>,
    timeout_secs: u64,
}

impl RunSqlQueryTool {
    pub fn new(db: Arc<SqlDatabase>) -> Self {
        Self {
            db,
            timeout_secs: 30,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Deserialize)]
struct RunSqlQueryInput {
    sql: String,
}

impl Tool for RunSqlQueryTool {
    fn name(&self) -> &str {
        "run_sql_query"
    }
    fn description(&self) -> &str {
        "Executes a SQL query on the SQLite database and returns the result."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "A single SQLite statement" }
            },
            "required": ["sql"]
        })
    }
    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: RunSqlQueryInput = serde_json::from_value(input)
                .map_err(|e| RevloopError::ToolValidation(e.to_string()))?;
            if p.sql.trim().is_empty() {
                return Err(RevloopError::ToolValidation("sql is empty".into()));
            }

            info!(session_id = %ctx.session_id, sql = %p.sql, "Executing SQL");
            let sql = p.sql;
            match run_blocking(self.name(), &self.db, move |db| db.query(&sql)).await {
                Ok(out) => Ok(ToolResult::success(out.render())),
                Err(e) => {
                    warn!(error = %e, "SQL execution failed");
                    Ok(ToolResult::error(format!("Error executing SQL: {}", e)))
                }
            }
        })
    }
}

// ── TableSchemaTool ─────────────────────────────────────────────

pub struct TableSchemaTool {
    db: Arc<SqlDatabase>,
}

impl TableSchemaTool {
    pub fn new(db: Arc<SqlDatabase>) -> Self {
        Self { db }
    }
}

impl Tool for TableSchemaTool {
    fn name(&self) -> &str {
        "get_table_schema"
    }
    fn description(&self) -> &str {
        "Returns the tables and columns of the SQLite database for SQL generation help."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn timeout_secs(&self) -> u64 {
        10
    }
    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            match run_blocking(self.name(), &self.db, |db| db.schema()).await {
                Ok(schema) => Ok(ToolResult::success(schema)),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            }
        })
    }
}
