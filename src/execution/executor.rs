//! Executor
//!
//! Runs one candidate against the database capability and always answers with an
//! [`ExecutionResult`]: guard violations, timeouts and driver errors become classified
//! failures rather than errors.

use crate::error::CopilotError;
use crate::execution::engine::{DatabaseCapability, SqlDialect};
use crate::execution::error_classifier::ErrorClassifier;
use crate::execution::guard::check_read_only;
use crate::execution::result::{ExecutionResult, FailureKind};
use crate::generator::QueryCandidate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct Executor {
    db: Arc<dyn DatabaseCapability>,
    timeout: Duration,
    max_rows: usize,
    classifier: ErrorClassifier,
}

impl Executor {
    pub fn new(db: Arc<dyn DatabaseCapability>, timeout: Duration, max_rows: usize) -> Self {
        Self {
            db,
            timeout,
            max_rows,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.db.dialect()
    }

    pub async fn execute(&self, candidate: &QueryCandidate) -> ExecutionResult {
        self.execute_sql(&candidate.sql).await
    }

    /// Guard, run, and classify arbitrary SQL (used for canned queries too).
    pub async fn execute_sql(&self, sql: &str) -> ExecutionResult {
        if let Err(violation) = check_read_only(sql, self.db.dialect()) {
            warn!("Rejected candidate before execution: {}", violation.message);
            return ExecutionResult::failure(violation.kind, violation.message, violation.fragment);
        }

        let started = Instant::now();
        match self.db.execute(sql, self.timeout, self.max_rows).await {
            Ok(rows) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(
                    "Query succeeded on {}: {} rows in {} ms",
                    self.db.name(),
                    rows.row_count(),
                    elapsed_ms
                );
                ExecutionResult::Success { rows, elapsed_ms }
            }
            Err(CopilotError::QueryTimeout(limit)) => ExecutionResult::failure(
                FailureKind::Timeout,
                format!("Query exceeded the {} s execution limit", limit.as_secs_f32()),
                None,
            ),
            Err(CopilotError::Database(message)) => {
                let (kind, fragment) = self.classifier.classify(&message);
                info!("Query failed on {} ({}): {}", self.db.name(), kind, message);
                ExecutionResult::failure(kind, message, fragment)
            }
            Err(other) => {
                warn!("Unexpected execution error: {}", other);
                ExecutionResult::failure(FailureKind::Unknown, other.to_string(), None)
            }
        }
    }
}
