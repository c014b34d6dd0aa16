//! SQLite backend
//!
//! Each call opens its own read-only connection on a blocking thread. The connection's
//! interrupt handle is armed for the duration of the call, so a timeout or a dropped
//! future stops the running statement and the connection closes with the task.

use crate::error::{CopilotError, Result};
use crate::execution::engine::{DatabaseCapability, SqlDialect};
use crate::execution::result::{ColumnInfo, QueryRows};
use crate::metadata::{ColumnMetadata, Table};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(CopilotError::Config(format!(
                "SQLite database not found: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }
}

/// Interrupts the connection when dropped, unless disarmed first.
struct InterruptOnDrop {
    handle: Option<InterruptHandle>,
}

impl InterruptOnDrop {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Interrupting SQLite statement");
            handle.interrupt();
        }
    }
}

#[async_trait]
impl DatabaseCapability for SqliteDatabase {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryRows> {
        let conn = self.connection()?;
        let interrupt = InterruptOnDrop::new(conn.get_interrupt_handle());
        let sql = sql.to_string();

        let task = tokio::task::spawn_blocking(move || run_query(&conn, &sql, max_rows));
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => {
                interrupt.disarm();
                joined.map_err(|e| CopilotError::Database(format!("query task failed: {}", e)))?
            }
            Err(_) => {
                warn!("SQLite query exceeded {:?}, interrupting", timeout);
                drop(interrupt);
                Err(CopilotError::QueryTimeout(timeout))
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<Table>> {
        let conn = self
            .connection()
            .map_err(|e| CopilotError::SchemaUnavailable(e.to_string()))?;
        tokio::task::spawn_blocking(move || read_tables(&conn))
            .await
            .map_err(|e| CopilotError::SchemaUnavailable(format!("introspection task failed: {}", e)))?
    }
}

/// Steps the cursor at most `max_rows + 1` times; the extra step only detects truncation.
fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<ColumnInfo> = stmt
        .column_names()
        .iter()
        .map(|name| ColumnInfo {
            name: name.to_string(),
            data_type: "unknown".to_string(),
        })
        .collect();
    let width = columns.len();

    let mut out = Vec::new();
    let mut truncated = false;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if out.len() == max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(value_to_json(row.get_ref(idx)?));
        }
        out.push(values);
    }

    let mut result = QueryRows {
        columns,
        rows: out,
        truncated,
    };
    result.infer_missing_types();
    Ok(result)
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn read_tables(conn: &Connection) -> Result<Vec<Table>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let mut info = conn.prepare(&pragma)?;
        let columns: Vec<ColumnMetadata> = info
            .query_map([], |row| {
                Ok(ColumnMetadata {
                    name: row.get(1)?,
                    data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    nullable: row.get::<_, i64>(3)? == 0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        tables.push(Table { name, columns });
    }
    Ok(tables)
}
