use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tracing::debug;

use revloop_core::error::{Result, RevloopError};

const MAX_ROWS: usize = 200;

/// Tabular result of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Rows dropped past the display limit.
    pub truncated: usize,
    /// Set for statements that return no columns.
    pub rows_affected: Option<usize>,
}

impl QueryOutput {
    /// Render as a right-aligned text table.
    pub fn render(&self) -> String {
        if let Some(n) = self.rows_affected {
            return format!("Statement executed ({} rows affected).", n);
        }
        if self.rows.is_empty() {
            return "No matching records found.".to_string();
        }

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let fmt_row = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:>width$}", c, width = *w))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut out = fmt_row(&self.columns);
        for row in &self.rows {
            out.push('\n');
            out.push_str(&fmt_row(row));
        }
        if self.truncated > 0 {
            out.push_str(&format!("\n... ({} more rows)", self.truncated));
        }
        out
    }
}

/// A SQLite database the SQL agent can inspect and query.
///
/// The connection is read-only: model-written statements can never modify
/// the data they are asked about.
pub struct SqlDatabase {
    path: PathBuf,
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
}

impl SqlDatabase {
    /// Open an existing database file. Missing files are an error, not created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            RevloopError::Database(format!("Failed to open {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "SQL database opened read-only");
        Ok(Self {
            path: path.to_path_buf(),
            interrupt: conn.get_interrupt_handle(),
            conn: Mutex::new(conn),
        })
    }

    /// Abort whatever statement is currently running on this connection.
    /// It fails with an interrupted error and releases the connection.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tables and their columns, one `Table:` block per table.
    pub fn schema(&self) -> Result<String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(db_err)?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;

        let mut out = String::new();
        for table in tables {
            out.push_str(&format!("Table: {}\nColumns:\n", table));
            let mut info = conn
                .prepare(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\"")))
                .map_err(db_err)?;
            let columns = info
                .query_map([], |row| {
                    Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })
                .map_err(db_err)?;
            for column in columns {
                let (name, ty) = column.map_err(db_err)?;
                let ty = if ty.is_empty() { "ANY".to_string() } else { ty };
                out.push_str(&format!("  - {} ({})\n", name, ty));
            }
        }

        if out.is_empty() {
            out.push_str("(no tables)\n");
        }
        Ok(out)
    }

    /// Run one SQL statement.
    pub fn query(&self, sql: &str) -> Result<QueryOutput> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        if columns.is_empty() {
            let n = stmt.execute([]).map_err(db_err)?;
            return Ok(QueryOutput {
                columns,
                rows: Vec::new(),
                truncated: 0,
                rows_affected: Some(n),
            });
        }

        let mut rows = Vec::new();
        let mut truncated = 0;
        let mut cursor = stmt.query([]).map_err(db_err)?;
        while let Some(row) = cursor.next().map_err(db_err)? {
            if rows.len() >= MAX_ROWS {
                truncated += 1;
                continue;
            }
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                cells.push(render_value(row.get_ref(i).map_err(db_err)?));
            }
            rows.push(cells);
        }

        Ok(QueryOutput {
            columns,
            rows,
            truncated,
            rows_affected: None,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RevloopError::Database(e.to_string()))
    }
}

fn render_value(v: ValueRef<'_>) -> String {
    match v {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn db_err(e: rusqlite::Error) -> RevloopError {
    RevloopError::Database(e.to_string())
}
