//! PostgreSQL backend using sqlx
//!
//! Every statement runs in its own `READ ONLY` transaction with a local
//! `statement_timeout`, and the transaction is rolled back afterwards. Rows come back as
//! `row_to_json` text over positionally renamed columns so that any column type decodes
//! without per-type plumbing.

use crate::error::{CopilotError, Result};
use crate::execution::engine::{DatabaseCapability, SqlDialect};
use crate::execution::result::{ColumnInfo, QueryRows};
use crate::metadata::{ColumnMetadata, Table};
use async_trait::async_trait;
use itertools::Itertools;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Column, Executor, Statement, TypeInfo};
use std::time::Duration;
use tracing::warn;

/// Extra time allowed on top of the server-side timeout before the client gives up.
const CLIENT_GRACE: Duration = Duration::from_secs(2);

pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| CopilotError::Database(format!("failed to connect: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_read_only(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryRows> {
        let body = sql.trim().trim_end_matches(';').trim();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let statement = (&mut *tx).prepare(body).await?;
        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .map(|c| ColumnInfo {
                name: c.name().to_string(),
                data_type: c.type_info().name().to_lowercase(),
            })
            .collect();

        let wrapped = wrap_positional(body, columns.len(), max_rows);
        let raw: Vec<(Option<String>,)> = sqlx::query_as(&wrapped).fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        let rows = raw
            .iter()
            .map(|(text,)| decode_positional(text.as_deref(), columns.len()))
            .collect::<Result<Vec<_>>>()?;

        let mut result = QueryRows {
            columns,
            rows,
            truncated: false,
        };
        result.truncate(max_rows);
        Ok(result)
    }
}

/// Wraps `body` so each row comes back as one JSON object keyed `c0..cN` by position,
/// reading at most one row past the cap.
///
/// The alias list renames columns positionally, so duplicate output names (two unaliased
/// `sum` aggregates, `id` from both sides of a join) stay distinct.
fn wrap_positional(body: &str, width: usize, max_rows: usize) -> String {
    let alias = if width == 0 {
        "q".to_string()
    } else {
        format!("q({})", (0..width).map(|idx| format!("c{}", idx)).join(", "))
    };
    format!(
        "SELECT row_to_json(q)::text FROM ({}) AS {} LIMIT {}",
        body,
        alias,
        max_rows.min(i64::MAX as usize - 1) + 1
    )
}

fn decode_positional(text: Option<&str>, width: usize) -> Result<Vec<serde_json::Value>> {
    let object: serde_json::Map<String, serde_json::Value> = match text {
        Some(t) => serde_json::from_str(t)?,
        None => serde_json::Map::new(),
    };
    Ok((0..width)
        .map(|idx| {
            object
                .get(&format!("c{}", idx))
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        })
        .collect())
}

#[async_trait]
impl DatabaseCapability for PostgresDatabase {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn execute(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryRows> {
        let query = self.run_read_only(sql, timeout, max_rows);
        match tokio::time::timeout(timeout + CLIENT_GRACE, query).await {
            Ok(result) => result,
            Err(_) => {
                warn!("PostgreSQL query exceeded {:?}", timeout);
                Err(CopilotError::QueryTimeout(timeout))
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<Table>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text, data_type::text, is_nullable::text \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() \
             ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CopilotError::SchemaUnavailable(e.to_string()))?;

        let grouped = rows.into_iter().group_by(|row| row.0.clone());
        let tables = grouped
            .into_iter()
            .map(|(name, columns)| Table {
                name,
                columns: columns
                    .map(|(_, column, data_type, nullable)| ColumnMetadata {
                        name: column,
                        data_type,
                        nullable: nullable.eq_ignore_ascii_case("YES"),
                    })
                    .collect(),
            })
            .collect();
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrap_renames_columns_by_position_and_caps_rows() {
        let sql = wrap_positional("SELECT SUM(a), SUM(b) FROM t", 2, 1000);
        assert_eq!(
            sql,
            "SELECT row_to_json(q)::text FROM (SELECT SUM(a), SUM(b) FROM t) AS q(c0, c1) LIMIT 1001"
        );
        assert!(wrap_positional("SELECT FROM t", 0, 5).ends_with("AS q LIMIT 6"));
    }

    #[test]
    fn test_duplicate_column_names_keep_their_own_values() {
        let columns = ["sum", "sum"];
        let values = decode_positional(Some(r#"{"c0": 10, "c1": 20}"#), columns.len()).unwrap();
        assert_eq!(values, vec![json!(10), json!(20)]);
    }

    #[test]
    fn test_null_row_decodes_to_nulls() {
        let values = decode_positional(None, 2).unwrap();
        assert_eq!(values, vec![serde_json::Value::Null, serde_json::Value::Null]);
    }
}
