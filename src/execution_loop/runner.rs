//! Session Runner
//!
//! Runs many requests at once, one independent session each. Sessions share only the
//! read-only schema snapshot and the embedding cache held by the controller.

use crate::execution_loop::cancel::CancellationToken;
use crate::execution_loop::controller::FeedbackLoop;
use crate::execution_loop::session::{Session, SessionOutcome, SessionReport, SessionStatus};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

pub struct SessionRunner {
    controller: Arc<FeedbackLoop>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl SessionRunner {
    pub fn new(controller: Arc<FeedbackLoop>, concurrency: usize) -> Self {
        Self {
            controller,
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels every session of this runner.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every request; reports come back in input order.
    pub async fn run_batch(&self, requests: Vec<String>) -> Vec<SessionReport> {
        info!(
            "Running {} requests with concurrency {}",
            requests.len(),
            self.concurrency
        );
        let permits = Arc::new(Semaphore::new(self.concurrency));

        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let controller = self.controller.clone();
            let permits = permits.clone();
            let cancel = self.cancel.clone();
            let fallback_request = request.clone();
            let handle = tokio::spawn(async move {
                // The semaphore is never closed, so acquiring only fails after a bug.
                let _permit = permits.acquire_owned().await.ok();
                controller.run_with_cancel(&request, &cancel).await
            });
            handles.push((fallback_request, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (request, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Session task for '{}' failed: {}", request, e);
                    reports.push(failed_task_report(&request, &e.to_string()));
                }
            }
        }
        reports
    }
}

fn failed_task_report(request: &str, message: &str) -> SessionReport {
    let mut session = Session::new(request, "");
    session.finish(SessionStatus::Aborted);
    SessionReport {
        session,
        outcome: SessionOutcome::Aborted {
            kind: "TaskFailed".to_string(),
            message: message.to_string(),
        },
    }
}
