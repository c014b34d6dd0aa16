//! Session Log
//!
//! Append-only JSON-lines audit trail. Every finished session writes one record per
//! attempt, in attempt order, followed by one outcome record. Records are never
//! rewritten.

use crate::error::Result;
use crate::execution::{ExecutionResult, FailureKind};
use crate::execution_loop::session::{Attempt, SessionOutcome, SessionReport, SessionStatus};
use crate::generator::{QueryCandidate, RepairContext};
use crate::judge::ValidationScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Execution outcome without the result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionSummary {
    Success {
        columns: Vec<String>,
        row_count: usize,
        elapsed_ms: u64,
    },
    Failure {
        kind: FailureKind,
        message: String,
        fragment: Option<String>,
    },
}

impl From<&ExecutionResult> for ExecutionSummary {
    fn from(result: &ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success { rows, elapsed_ms } => ExecutionSummary::Success {
                columns: rows.columns.iter().map(|c| c.name.clone()).collect(),
                row_count: rows.row_count(),
                elapsed_ms: *elapsed_ms,
            },
            ExecutionResult::Failure {
                kind,
                message,
                fragment,
            } => ExecutionSummary::Failure {
                kind: *kind,
                message: message.clone(),
                fragment: fragment.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Attempt {
        session_id: Uuid,
        request: String,
        snapshot_version: String,
        index: u32,
        candidate: QueryCandidate,
        execution: ExecutionSummary,
        score: Option<ValidationScore>,
        repair_context: Option<RepairContext>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Outcome {
        session_id: Uuid,
        status: SessionStatus,
        outcome: SessionOutcome,
        attempts: u32,
        recorded_at: DateTime<Utc>,
    },
}

impl LogRecord {
    pub fn session_id(&self) -> Uuid {
        match self {
            LogRecord::Attempt { session_id, .. } | LogRecord::Outcome { session_id, .. } => *session_id,
        }
    }

    fn attempt(report: &SessionReport, attempt: &Attempt) -> Self {
        LogRecord::Attempt {
            session_id: report.session.id,
            request: report.session.request.clone(),
            snapshot_version: report.session.snapshot_version.clone(),
            index: attempt.index,
            candidate: attempt.candidate.clone(),
            execution: ExecutionSummary::from(&attempt.result),
            score: attempt.score.clone(),
            repair_context: attempt.repair_context.clone(),
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
        }
    }
}

pub struct SessionLog {
    path: PathBuf,
    // Keeps one session's lines contiguous when sessions finish concurrently.
    write_lock: Mutex<()>,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every attempt of a finished session, then its outcome.
    pub fn append_session(&self, report: &SessionReport) -> Result<()> {
        let mut lines = Vec::with_capacity(report.session.attempts().len() + 1);
        for attempt in report.session.attempts() {
            lines.push(serde_json::to_string(&LogRecord::attempt(report, attempt))?);
        }
        lines.push(serde_json::to_string(&LogRecord::Outcome {
            session_id: report.session.id,
            status: report.status(),
            outcome: report.outcome.clone(),
            attempts: report.session.attempts().len() as u32,
            recorded_at: Utc::now(),
        })?);

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Every record of one session, in write order. Unreadable lines are skipped.
    pub fn read_session(&self, session_id: Uuid) -> Result<Vec<LogRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| record.session_id() == session_id)
            .collect())
    }

    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed session log line {}: {}", line_no + 1, e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::QueryRows;
    use crate::execution_loop::session::Session;
    use tempfile::TempDir;

    fn report(request: &str) -> SessionReport {
        let mut session = Session::new(request, "v1");
        session.push_attempt(Attempt {
            index: 1,
            candidate: QueryCandidate {
                id: Uuid::new_v4(),
                sql: "SELECT profit FROM sales".to_string(),
                prompt_version: "test".to_string(),
                attempt_index: 1,
                parent: None,
            },
            result: ExecutionResult::failure(
                FailureKind::SchemaMismatch,
                "no such column: profit",
                Some("profit".to_string()),
            ),
            score: None,
            repair_context: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        });
        let first = session.attempts()[0].clone();
        session.push_attempt(Attempt {
            index: 2,
            candidate: QueryCandidate {
                id: Uuid::new_v4(),
                sql: "SELECT SUM(revenue) FROM sales".to_string(),
                prompt_version: "test".to_string(),
                attempt_index: 2,
                parent: Some(first.candidate.id),
            },
            result: ExecutionResult::Success {
                rows: QueryRows::default(),
                elapsed_ms: 2,
            },
            score: None,
            repair_context: Some(RepairContext::ExecutionFailure {
                attempt_index: 1,
                sql: first.candidate.sql.clone(),
                kind: FailureKind::SchemaMismatch,
                message: "no such column: profit".to_string(),
                fragment: Some("profit".to_string()),
                suggestions: Vec::new(),
            }),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        });
        session.finish(SessionStatus::Resolved);
        SessionReport {
            session,
            outcome: SessionOutcome::Resolved { attempt_index: 2 },
        }
    }

    #[test]
    fn test_append_and_read_back_by_session() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path().join("sessions.jsonl"));

        let first = report("total profit");
        let second = report("total revenue");
        log.append_session(&first).unwrap();
        log.append_session(&second).unwrap();

        let records = log.read_session(first.session.id).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], LogRecord::Attempt { index: 1, .. }));
        assert!(matches!(records[1], LogRecord::Attempt { index: 2, .. }));
        assert!(matches!(
            records[2],
            LogRecord::Outcome {
                status: SessionStatus::Resolved,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(log.read_all().unwrap().len(), 6);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_session(Uuid::new_v4()).unwrap().is_empty());
    }
}
