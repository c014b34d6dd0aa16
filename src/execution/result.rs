//! Execution Result - tagged outcome of running one candidate

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed execution. Every kind feeds the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SyntaxError,
    /// Unknown table or column
    SchemaMismatch,
    TypeError,
    Timeout,
    MutationRejected,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SyntaxError => "SyntaxError",
            FailureKind::SchemaMismatch => "SchemaMismatch",
            FailureKind::TypeError => "TypeError",
            FailureKind::Timeout => "Timeout",
            FailureKind::MutationRejected => "MutationRejected",
            FailureKind::Unknown => "Unknown",
        }
    }

    /// Whether re-generation with the failure detail is likely to help.
    pub fn is_likely_repairable(&self) -> bool {
        !matches!(self, FailureKind::Unknown)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type when the driver reports one, otherwise inferred from values.
    pub data_type: String,
}

/// Rows returned by a database capability, values as JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Set when rows beyond the configured cap were dropped.
    #[serde(default)]
    pub truncated: bool,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn truncate(&mut self, max_rows: usize) {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.truncated = true;
        }
    }

    /// Fill in `unknown` column types from the first non-null value of each column.
    pub fn infer_missing_types(&mut self) {
        for (idx, column) in self.columns.iter_mut().enumerate() {
            if !column.data_type.is_empty() && column.data_type != "unknown" {
                continue;
            }
            let inferred = self
                .rows
                .iter()
                .filter_map(|row| row.get(idx))
                .find(|v| !v.is_null())
                .map(json_type_name)
                .unwrap_or("unknown");
            column.data_type = inferred.to_string();
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "unknown",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "real",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "text",
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => "json",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        rows: QueryRows,
        elapsed_ms: u64,
    },
    Failure {
        kind: FailureKind,
        message: String,
        /// Offending identifier or token, when the error names one.
        fragment: Option<String>,
    },
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>, fragment: Option<String>) -> Self {
        ExecutionResult::Failure {
            kind,
            message: message.into(),
            fragment,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn rows(&self) -> Option<&QueryRows> {
        match self {
            ExecutionResult::Success { rows, .. } => Some(rows),
            ExecutionResult::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExecutionResult::Failure { kind, .. } => Some(*kind),
            ExecutionResult::Success { .. } => None,
        }
    }
}
