pub mod database;
pub mod registry;
pub mod sql;

pub use database::SqlDatabase;
pub use registry::ToolRegistry;
pub use sql::{RunSqlQueryTool, TableSchemaTool};
