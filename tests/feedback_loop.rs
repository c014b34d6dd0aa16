mod common;

use common::{policy, row_count, FailingEmbedder, Fixture, ScriptedModel, TOP5_SQL};
use sqlpilot::config::ValidatorMode;
use sqlpilot::error::CopilotError;
use sqlpilot::execution::{ExecutionResult, FailureKind};
use sqlpilot::execution_loop::{CancellationToken, SessionOutcome, SessionRunner, SessionStatus};
use sqlpilot::generator::RepairContext;
use sqlpilot::observability::{LogRecord, SessionLog};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_top_customers_resolves_with_five_rows() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[&format!("```sql\n{};\n```", TOP5_SQL)]);
    let controller = fixture.controller(model.clone(), 3);

    let report = controller.run("Top 5 customers by total revenue").await;

    assert_eq!(report.status(), SessionStatus::Resolved);
    assert_eq!(report.session.attempts().len(), 1);
    let accepted = report.accepted().expect("accepted attempt");
    assert_eq!(accepted.candidate.sql, TOP5_SQL);
    assert!(accepted.repair_context.is_none());
    let rows = accepted.rows().expect("rows");
    assert_eq!(rows.row_count(), 5);
    assert_eq!(rows.column_names(), vec!["customer_id", "total_revenue"]);

    let prompt = &model.prompts()[0];
    assert!(prompt.contains("sales.customer_id"));
    assert!(prompt.contains("sales.revenue"));
    assert!(prompt.contains("- sales(order_id INTEGER"));
}

#[tokio::test]
async fn test_unknown_column_is_repaired() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[
        "SELECT customer_id, SUM(profit) AS total_profit FROM sales GROUP BY customer_id",
        "SELECT customer_id, SUM(revenue) AS total_revenue FROM sales GROUP BY customer_id",
    ]);
    let controller = fixture.controller(model.clone(), 3);

    let report = controller.run("total profit by customers").await;

    assert_eq!(report.status(), SessionStatus::Resolved);
    let attempts = report.session.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].result.failure_kind(), Some(FailureKind::SchemaMismatch));
    assert_eq!(attempts[1].candidate.parent, Some(attempts[0].candidate.id));
    match &attempts[1].repair_context {
        Some(RepairContext::ExecutionFailure {
            attempt_index,
            kind,
            fragment,
            ..
        }) => {
            assert_eq!(*attempt_index, 1);
            assert_eq!(*kind, FailureKind::SchemaMismatch);
            assert_eq!(fragment.as_deref(), Some("profit"));
        }
        other => panic!("unexpected repair context: {:?}", other),
    }

    let prompts = model.prompts();
    assert!(prompts[0].contains("NO MATCHING COLUMN for: profit"));
    assert!(prompts[1].contains("RETRY: attempt 1 failed with SchemaMismatch."));
    assert!(prompts[1].contains("no such column: profit"));
}

#[tokio::test]
async fn test_every_attempt_failing_exhausts_the_budget() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[
        "SELECT SUM(profit) FROM sales",
        "SELECT SUM(revenue) FROM orders",
        "SELECT SUM(revenue) FORM sales",
    ]);
    let controller = fixture.controller(model.clone(), 3);

    let report = controller.run("total profit").await;

    assert_eq!(report.status(), SessionStatus::Exhausted);
    assert_eq!(report.outcome, SessionOutcome::Exhausted { best_effort: None });
    let attempts = report.session.attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(model.calls(), 3);

    let mut messages = Vec::new();
    for (i, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.index, i as u32 + 1);
        match &attempt.result {
            ExecutionResult::Failure { message, .. } => messages.push(message.clone()),
            ExecutionResult::Success { .. } => panic!("attempt {} should fail", attempt.index),
        }
        let source = attempt.repair_context.as_ref().map(|r| r.source_attempt());
        assert_eq!(source, if i == 0 { None } else { Some(i as u32) });
    }
    messages.dedup();
    assert_eq!(messages.len(), 3, "error details should differ: {:?}", messages);

    // The unknown table is caught before execution.
    assert_eq!(attempts[1].result.failure_kind(), Some(FailureKind::SchemaMismatch));
    assert!(messages[1].contains("orders"));
}

#[tokio::test]
async fn test_generator_failure_aborts_without_attempts() {
    let fixture = Fixture::new();
    let model = ScriptedModel::new(vec![Err(CopilotError::GenerationUnavailable(
        "provider returned 503".to_string(),
    ))]);
    let controller = fixture.controller(model, 3);

    let report = controller.run("Top 5 customers by total revenue").await;

    assert_eq!(report.status(), SessionStatus::Aborted);
    assert!(report.session.attempts().is_empty());
    match &report.outcome {
        SessionOutcome::Aborted { kind, message } => {
            assert_eq!(kind, "GenerationUnavailable");
            assert_eq!(message, "Generation unavailable: provider returned 503");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_explanation_after_the_statement_is_not_kept() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&["SELECT SUM(revenue) AS total FROM sales;\nThis sums all revenue."]);
    let controller = fixture.controller(model, 3);

    let report = controller.run("total revenue").await;

    assert_eq!(report.status(), SessionStatus::Resolved);
    let accepted = report.accepted().expect("accepted attempt");
    assert_eq!(accepted.candidate.sql, "SELECT SUM(revenue) AS total FROM sales");
    assert_eq!(accepted.rows().map(|r| r.row_count()), Some(1));
}

#[tokio::test]
async fn test_mutating_candidate_is_rejected() {
    let fixture = Fixture::new();
    let before = row_count(&fixture.db_path);
    let model = ScriptedModel::sql(&["DELETE FROM sales", "DELETE FROM sales WHERE revenue < 100"]);
    let controller = fixture.controller(model, 2);

    let report = controller.run("remove cheap orders").await;

    assert_eq!(report.status(), SessionStatus::Exhausted);
    for attempt in report.session.attempts() {
        assert_eq!(attempt.result.failure_kind(), Some(FailureKind::MutationRejected));
    }
    assert_eq!(row_count(&fixture.db_path), before);
}

#[tokio::test]
async fn test_low_score_triggers_repair_then_resolves() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[
        "SELECT customer_id, SUM(revenue) AS total_revenue FROM sales GROUP BY customer_id",
        TOP5_SQL,
    ]);
    let judge = ScriptedModel::sql(&[
        r#"{"score": 4, "rationale": "Missing ORDER BY and LIMIT 5."}"#,
        r#"{"score": 9, "rationale": "Correct."}"#,
    ]);
    let controller = fixture.judged_controller(model.clone(), judge.clone(), 3, ValidatorMode::Advisory);

    let report = controller.run("Top 5 customers by total revenue").await;

    assert_eq!(report.status(), SessionStatus::Resolved);
    assert_eq!(report.outcome, SessionOutcome::Resolved { attempt_index: 2 });
    let attempts = report.session.attempts();
    assert_eq!(attempts[0].score.as_ref().map(|s| s.score), Some(4.0));
    assert!(matches!(
        attempts[1].repair_context,
        Some(RepairContext::LowScore { attempt_index: 1, .. })
    ));
    assert!(model.prompts()[1].contains("Missing ORDER BY and LIMIT 5."));
    assert_eq!(judge.calls(), 2);
}

#[tokio::test]
async fn test_repeated_candidate_reuses_its_score() {
    let fixture = Fixture::new();
    let sql = "SELECT SUM(revenue) AS total_revenue FROM sales";
    let model = ScriptedModel::sql(&[sql, sql]);
    let judge = ScriptedModel::sql(&[r#"{"score": 5, "rationale": "Not per customer."}"#]);
    let controller = fixture.judged_controller(model, judge.clone(), 2, ValidatorMode::Advisory);

    let report = controller.run("revenue per customer").await;

    assert_eq!(report.status(), SessionStatus::Exhausted);
    assert_eq!(judge.calls(), 1);
    assert_eq!(report.session.attempts()[1].score.as_ref().map(|s| s.score), Some(5.0));
    assert_eq!(report.outcome, SessionOutcome::Exhausted { best_effort: Some(2) });
}

#[tokio::test]
async fn test_unavailable_judge_depends_on_mode() {
    let fixture = Fixture::new();

    let advisory = fixture.judged_controller(
        ScriptedModel::sql(&[TOP5_SQL]),
        ScriptedModel::new(vec![]),
        3,
        ValidatorMode::Advisory,
    );
    let report = advisory.run("Top 5 customers by total revenue").await;
    assert_eq!(report.status(), SessionStatus::Resolved);
    assert!(report.accepted().unwrap().score.is_none());

    let mandatory = fixture.judged_controller(
        ScriptedModel::sql(&[TOP5_SQL]),
        ScriptedModel::new(vec![]),
        3,
        ValidatorMode::Mandatory,
    );
    let report = mandatory.run("Top 5 customers by total revenue").await;
    assert_eq!(report.status(), SessionStatus::Aborted);
    assert_eq!(report.session.attempts().len(), 1);
    assert!(matches!(
        &report.outcome,
        SessionOutcome::Aborted { kind, .. } if kind == "ValidationUnavailable"
    ));
}

#[tokio::test]
async fn test_embedding_failure_falls_back_to_full_listing() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[TOP5_SQL]);
    let controller = fixture.controller_with(
        model.clone(),
        fixture.matcher_with(Arc::new(FailingEmbedder)),
        policy(3, ValidatorMode::Disabled),
    );

    let report = controller.run("Top 5 customers by total revenue").await;

    assert_eq!(report.status(), SessionStatus::Resolved);
    let prompt = &model.prompts()[0];
    assert!(!prompt.contains("MOST RELEVANT SCHEMA ELEMENTS"));
    assert!(prompt.contains("- sales(order_id INTEGER"));
}

#[tokio::test]
async fn test_cancellation_aborts_the_session() {
    let fixture = Fixture::new();
    let controller = fixture.controller(ScriptedModel::slow(Duration::from_secs(30)), 3);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        controller.run_with_cancel("Top 5 customers by total revenue", &cancel),
    )
    .await
    .expect("cancellation should end the session promptly");

    assert_eq!(report.status(), SessionStatus::Aborted);
    assert!(report.session.attempts().is_empty());
    assert!(matches!(&report.outcome, SessionOutcome::Aborted { kind, .. } if kind == "Cancelled"));
}

#[tokio::test]
async fn test_finished_sessions_are_logged() {
    let fixture = Fixture::new();
    let log = Arc::new(SessionLog::new(fixture.dir.path().join("sessions.jsonl")));
    let model = ScriptedModel::sql(&["SELECT SUM(profit) FROM sales", TOP5_SQL]);
    let controller = fixture.controller(model, 3).with_session_log(log.clone());

    let report = controller.run("Top 5 customers by total revenue").await;

    let records = log.read_session(report.session.id).unwrap();
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
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let fixture = Fixture::new();
    let model = ScriptedModel::sql(&[TOP5_SQL, TOP5_SQL, TOP5_SQL]);
    let controller = Arc::new(fixture.controller(model, 1));
    let runner = SessionRunner::new(controller, 2);

    let requests = vec![
        "top customers".to_string(),
        "best customers".to_string(),
        "biggest spenders".to_string(),
    ];
    let reports = runner.run_batch(requests.clone()).await;

    assert_eq!(reports.len(), 3);
    for (report, request) in reports.iter().zip(&requests) {
        assert_eq!(&report.session.request, request);
        assert_eq!(report.status(), SessionStatus::Resolved);
    }
    // Sessions are independent.
    let ids: std::collections::HashSet<_> = reports.iter().map(|r| r.session.id).collect();
    assert_eq!(ids.len(), 3);
}
