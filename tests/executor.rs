mod common;

use common::{row_count, Fixture};
use sqlpilot::execution::{ExecutionResult, Executor, FailureKind};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_large_result_is_capped_not_timed_out() {
    let fixture = Fixture::new();
    let executor = Executor::new(fixture.db.clone(), Duration::from_secs(3), 10);
    let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n LIMIT 20000000) SELECT x FROM n";

    let started = Instant::now();
    let result = executor.execute_sql(sql).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    match result {
        ExecutionResult::Success { rows, .. } => {
            assert_eq!(rows.row_count(), 10);
            assert!(rows.truncated);
        }
        other => panic!("expected a truncated success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_small_result_is_not_flagged() {
    let fixture = Fixture::new();
    let executor = Executor::new(fixture.db.clone(), Duration::from_secs(3), 20);
    match executor.execute_sql("SELECT order_id FROM sales").await {
        ExecutionResult::Success { rows, .. } => {
            assert_eq!(rows.row_count(), 20);
            assert!(!rows.truncated);
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_trailing_statement_is_rejected_even_when_unparseable() {
    let fixture = Fixture::new();
    let executor = fixture.executor();

    for sql in [
        "SELECT COUNT(*) FROM sales; SELECT 2",
        "SELECT COUNT(*) FROM sales; SELEC 2",
        "SELEC COUNT(*) FROM sales; SELECT 2",
    ] {
        match executor.execute_sql(sql).await {
            ExecutionResult::Failure { kind, .. } => assert_eq!(kind, FailureKind::SyntaxError, "{}", sql),
            other => panic!("{} should be rejected, got {:?}", sql, other),
        }
    }
    assert_eq!(row_count(&fixture.db_path), 20);
}

#[tokio::test]
async fn test_keyword_named_columns_and_explain_run() {
    let fixture = Fixture::new();
    let executor = fixture.executor();

    let aliased = "SELECT order_id AS copy, customer_id AS merge, revenue AS replace FROM sales LIMIT 3";
    match executor.execute_sql(aliased).await {
        ExecutionResult::Success { rows, .. } => {
            assert_eq!(rows.column_names(), vec!["copy", "merge", "replace"]);
        }
        other => panic!("expected success, got {:?}", other),
    }

    assert!(executor
        .execute_sql("EXPLAIN SELECT COUNT(*) FROM sales")
        .await
        .is_success());
}
