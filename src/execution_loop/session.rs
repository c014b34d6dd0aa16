//! Sessions and their attempt chains
//!
//! A session owns the ordered, append-only chain of attempts for one request. Each
//! attempt after the first carries the repair context built from its predecessor.

use crate::error::CopilotError;
use crate::execution::{ExecutionResult, QueryRows};
use crate::generator::{QueryCandidate, RepairContext};
use crate::judge::ValidationScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Resolved,
    Exhausted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub index: u32,
    pub candidate: QueryCandidate,
    pub result: ExecutionResult,
    pub score: Option<ValidationScore>,
    /// What the previous attempt got wrong; `None` only for the first attempt.
    pub repair_context: Option<RepairContext>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Attempt {
    pub fn rows(&self) -> Option<&QueryRows> {
        self.result.rows()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub request: String,
    /// Schema snapshot version used; empty when the schema could not be loaded.
    pub snapshot_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    status: SessionStatus,
    attempts: Vec<Attempt>,
}

impl Session {
    pub fn new(request: impl Into<String>, snapshot_version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            snapshot_version: snapshot_version.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: SessionStatus::Running,
            attempts: Vec::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Index the next attempt will carry.
    pub fn next_index(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    /// Append an attempt. Indices are consecutive from 1 and every repair points at the
    /// attempt right before it.
    pub(crate) fn push_attempt(&mut self, attempt: Attempt) {
        debug_assert_eq!(self.status, SessionStatus::Running);
        debug_assert_eq!(attempt.index, self.next_index());
        debug_assert_eq!(
            attempt.repair_context.as_ref().map(|r| r.source_attempt()),
            self.attempts.last().map(|a| a.index)
        );
        self.attempts.push(attempt);
    }

    pub(crate) fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Resolved {
        attempt_index: u32,
    },
    Exhausted {
        /// Highest-scoring attempt or, without scores, the last one that executed.
        best_effort: Option<u32>,
    },
    Aborted {
        kind: String,
        message: String,
    },
}

impl SessionOutcome {
    pub fn aborted(error: &CopilotError) -> Self {
        SessionOutcome::Aborted {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session: Session,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    fn attempt(&self, index: u32) -> Option<&Attempt> {
        self.session.attempts().iter().find(|a| a.index == index)
    }

    /// The accepted attempt of a resolved session.
    pub fn accepted(&self) -> Option<&Attempt> {
        match &self.outcome {
            SessionOutcome::Resolved { attempt_index } => self.attempt(*attempt_index),
            _ => None,
        }
    }

    /// The accepted attempt, or the best-effort one of an exhausted session.
    pub fn best_attempt(&self) -> Option<&Attempt> {
        match &self.outcome {
            SessionOutcome::Resolved { attempt_index } => self.attempt(*attempt_index),
            SessionOutcome::Exhausted {
                best_effort: Some(index),
            } => self.attempt(*index),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            SessionOutcome::Aborted { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Best-effort attempt of an exhausted chain: the highest score among successful
/// attempts (latest wins ties), else the last successful attempt.
pub fn best_effort(attempts: &[Attempt]) -> Option<u32> {
    let successes = attempts.iter().filter(|a| a.result.is_success());

    let best_scored = successes
        .clone()
        .filter_map(|a| a.score.as_ref().map(|s| (a, s.score)))
        .max_by(|(a, x), (b, y)| {
            x.partial_cmp(y)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        })
        .map(|(a, _)| a.index);

    best_scored.or_else(|| successes.last().map(|a| a.index))
}
