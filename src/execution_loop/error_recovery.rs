//! Error Recovery
//!
//! Builds the repair context for the next attempt from the last one's failure or low
//! score. Schema mismatches also carry the closest real names.

use crate::execution::{ExecutionResult, FailureKind};
use crate::execution_loop::session::Attempt;
use crate::generator::RepairContext;
use crate::metadata::SchemaSnapshot;
use std::cmp::Ordering;

/// Suggestions below this Jaro-Winkler similarity are noise.
const MIN_SUGGESTION_SIMILARITY: f64 = 0.6;
const MAX_SUGGESTIONS: usize = 3;

pub struct ErrorRecovery;

impl ErrorRecovery {
    /// Repair context for the attempt after `attempt`; `None` when it neither failed nor
    /// carries a score.
    pub fn build_repair_context(attempt: &Attempt, snapshot: &SchemaSnapshot) -> Option<RepairContext> {
        match &attempt.result {
            ExecutionResult::Failure {
                kind,
                message,
                fragment,
            } => {
                let suggestions = match (kind, fragment) {
                    (FailureKind::SchemaMismatch, Some(fragment)) => closest_names(fragment, snapshot),
                    _ => Vec::new(),
                };
                Some(RepairContext::ExecutionFailure {
                    attempt_index: attempt.index,
                    sql: attempt.candidate.sql.clone(),
                    kind: *kind,
                    message: message.clone(),
                    fragment: fragment.clone(),
                    suggestions,
                })
            }
            ExecutionResult::Success { .. } => attempt.score.as_ref().map(|score| RepairContext::LowScore {
                attempt_index: attempt.index,
                sql: attempt.candidate.sql.clone(),
                score: score.score,
                rationale: score.rationale.clone(),
            }),
        }
    }
}

/// Up to three schema names closest to `fragment`, best first.
///
/// A qualified name is compared both whole and by its last segment, so `s.profit`
/// and `profit` both find `sales.product_category`-like columns.
pub fn closest_names(fragment: &str, snapshot: &SchemaSnapshot) -> Vec<String> {
    let needle = fragment
        .rsplit('.')
        .next()
        .unwrap_or(fragment)
        .to_lowercase();

    let mut scored: Vec<(f64, String)> = snapshot
        .qualified_names()
        .into_iter()
        .map(|name| {
            let lower = name.to_lowercase();
            let last = lower.rsplit('.').next().unwrap_or(&lower);
            let similarity = strsim::jaro_winkler(&needle, last).max(strsim::jaro_winkler(&needle, &lower));
            (similarity, name)
        })
        .filter(|(similarity, _)| *similarity >= MIN_SUGGESTION_SIMILARITY)
        .collect();

    scored.sort_by(|(a, name_a), (b, name_b)| {
        b.partial_cmp(a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| name_a.cmp(name_b))
    });
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, name)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::QueryRows;
    use crate::generator::QueryCandidate;
    use crate::judge::ValidationScore;
    use crate::metadata::{ColumnMetadata, Table};
    use chrono::Utc;
    use uuid::Uuid;

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![Table::new(
            "sales",
            vec![
                ColumnMetadata::new("order_id", "INTEGER", false),
                ColumnMetadata::new("customer_id", "TEXT", false),
                ColumnMetadata::new("revenue", "REAL", true),
            ],
        )])
    }

    fn attempt(result: ExecutionResult, score: Option<ValidationScore>) -> Attempt {
        Attempt {
            index: 2,
            candidate: QueryCandidate {
                id: Uuid::new_v4(),
                sql: "SELECT customer, SUM(revenue) FROM sales".to_string(),
                prompt_version: "test".to_string(),
                attempt_index: 2,
                parent: None,
            },
            result,
            score,
            repair_context: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_schema_mismatch_gets_suggestions() {
        let failed = attempt(
            ExecutionResult::failure(
                FailureKind::SchemaMismatch,
                "no such column: customer",
                Some("customer".to_string()),
            ),
            None,
        );
        match ErrorRecovery::build_repair_context(&failed, &snapshot()) {
            Some(RepairContext::ExecutionFailure {
                attempt_index,
                suggestions,
                ..
            }) => {
                assert_eq!(attempt_index, 2);
                assert_eq!(suggestions.first().map(String::as_str), Some("sales.customer_id"));
                assert!(suggestions.len() <= 3);
            }
            other => panic!("unexpected repair context: {:?}", other),
        }
    }

    #[test]
    fn test_low_score_context() {
        let scored = attempt(
            ExecutionResult::Success {
                rows: QueryRows::default(),
                elapsed_ms: 3,
            },
            Some(ValidationScore {
                score: 4.0,
                rationale: "not grouped".to_string(),
            }),
        );
        assert!(matches!(
            ErrorRecovery::build_repair_context(&scored, &snapshot()),
            Some(RepairContext::LowScore { score, .. }) if score == 4.0
        ));
    }

    #[test]
    fn test_unscored_success_has_no_context() {
        let ok = attempt(
            ExecutionResult::Success {
                rows: QueryRows::default(),
                elapsed_ms: 3,
            },
            None,
        );
        assert!(ErrorRecovery::build_repair_context(&ok, &snapshot()).is_none());
    }

    #[test]
    fn test_unrelated_fragment_has_no_suggestions() {
        assert!(closest_names("xyzzy", &snapshot()).is_empty());
    }
}
