//! Database capability - the contract every backend implements
//!
//! Backends are read-only by construction. They are selected from the database URL at
//! configuration time.

use crate::error::{CopilotError, Result};
use crate::execution::result::QueryRows;
use crate::metadata::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "SQLite",
            SqlDialect::Postgres => "PostgreSQL",
        }
    }

    /// Hints placed in the generation prompt.
    pub fn prompt_hints(&self) -> &'static [&'static str] {
        match self {
            SqlDialect::Sqlite => &[
                "Use SQLite syntax.",
                "Dates are TEXT: use strftime('%Y-%m', col), DATE(col) and DATE(col, '-14 days').",
                "There is no ILIKE; use LOWER(col) LIKE '...'.",
            ],
            SqlDialect::Postgres => &[
                "Use PostgreSQL syntax.",
                "Use date_trunc('month', col) and col - INTERVAL '14 days' for date arithmetic.",
                "Quote identifiers with double quotes only when they are mixed-case.",
            ],
        }
    }

    pub fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        match self {
            SqlDialect::Sqlite => Box::new(sqlparser::dialect::SQLiteDialect {}),
            SqlDialect::Postgres => Box::new(sqlparser::dialect::PostgreSqlDialect {}),
        }
    }
}

#[async_trait]
pub trait DatabaseCapability: Send + Sync {
    /// Backend name (e.g., "sqlite", "postgres")
    fn name(&self) -> &'static str;

    fn dialect(&self) -> SqlDialect;

    /// Run one read-only statement. Exceeding `timeout` yields `QueryTimeout`; any other
    /// database failure yields `Database` with the driver's message.
    ///
    /// At most `max_rows` rows are read from the cursor. If the statement would produce
    /// more, the result carries the first `max_rows` and `truncated` is set.
    async fn execute(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryRows>;

    /// Tables with their columns in declaration order.
    async fn list_tables(&self) -> Result<Vec<Table>>;
}

/// Open the backend named by the URL scheme.
///
/// `sqlite://path`, `sqlite:path`, or a bare path ending in `.db`/`.sqlite` open SQLite;
/// `postgres://` and `postgresql://` open PostgreSQL.
pub async fn connect(url: &str) -> Result<Arc<dyn DatabaseCapability>> {
    let trimmed = url.trim();
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        let db = crate::execution::postgres_engine::PostgresDatabase::connect(trimmed).await?;
        return Ok(Arc::new(db));
    }

    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);
    if path.is_empty() {
        return Err(CopilotError::Config("empty database URL".to_string()));
    }
    let db = crate::execution::sqlite_engine::SqliteDatabase::open(path)?;
    Ok(Arc::new(db))
}
