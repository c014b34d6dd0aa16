//! Feedback Loop Controller
//!
//! Drives one request through generate → execute → judge → repair until it resolves,
//! runs out of attempts, or hits a fatal error. Failures inside an attempt never escape
//! the loop; they become the repair context of the next attempt.

use crate::config::{CopilotConfig, FeedbackConfig, ValidatorMode};
use crate::error::{CopilotError, Result};
use crate::execution::{check_read_only, connect, ExecutionResult, Executor, FailureKind};
use crate::execution_loop::cancel::CancellationToken;
use crate::execution_loop::error_recovery::ErrorRecovery;
use crate::execution_loop::session::{best_effort, Attempt, Session, SessionOutcome, SessionReport, SessionStatus};
use crate::generator::{name_check, QueryCandidate, QueryGenerator, RepairContext};
use crate::judge::{ValidationScore, Validator};
use crate::llm::{LanguageModel, LlmClient};
use crate::metadata::{SchemaIndex, SchemaSnapshot};
use crate::observability::SessionLog;
use crate::schema_rag::{build_embedder, EmbeddingCache, SchemaContext, SemanticMatcher};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Controller states. Terminal states end the session.
#[derive(Debug)]
enum LoopState {
    Generating {
        repair: Option<RepairContext>,
    },
    Executing {
        candidate: QueryCandidate,
        repair: Option<RepairContext>,
        started_at: DateTime<Utc>,
    },
    Validating {
        candidate: QueryCandidate,
        repair: Option<RepairContext>,
        result: ExecutionResult,
        started_at: DateTime<Utc>,
    },
    Repairing,
    Resolved {
        attempt_index: u32,
    },
    Exhausted,
    Aborted(CopilotError),
}

impl LoopState {
    fn name(&self) -> &'static str {
        match self {
            LoopState::Generating { .. } => "Generating",
            LoopState::Executing { .. } => "Executing",
            LoopState::Validating { .. } => "Validating",
            LoopState::Repairing => "Repairing",
            LoopState::Resolved { .. } => "Resolved",
            LoopState::Exhausted => "Exhausted",
            LoopState::Aborted(_) => "Aborted",
        }
    }
}

pub struct FeedbackLoop {
    schema: Arc<SchemaIndex>,
    matcher: Arc<SemanticMatcher>,
    generator: Arc<QueryGenerator>,
    executor: Arc<Executor>,
    validator: Option<Arc<Validator>>,
    policy: FeedbackConfig,
    log: Option<Arc<SessionLog>>,
}

impl FeedbackLoop {
    pub fn new(
        schema: Arc<SchemaIndex>,
        matcher: Arc<SemanticMatcher>,
        generator: Arc<QueryGenerator>,
        executor: Arc<Executor>,
        policy: FeedbackConfig,
    ) -> Self {
        Self {
            schema,
            matcher,
            generator,
            executor,
            validator: None,
            policy,
            log: None,
        }
    }

    /// Judge used when the policy enables validation.
    pub fn with_validator(mut self, validator: Arc<Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_session_log(mut self, log: Arc<SessionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Wire every capability from configuration: database by URL scheme, the configured
    /// model provider for both generation and judging, and the configured embedder.
    pub async fn from_config(config: &CopilotConfig) -> Result<Self> {
        config.validate()?;
        let db = connect(&config.database_url).await?;
        let llm: Arc<dyn LanguageModel> = Arc::new(LlmClient::new(&config.llm)?);
        let embedder = build_embedder(&config.embedding)?;

        let schema = Arc::new(SchemaIndex::new(db.clone()));
        let matcher = Arc::new(SemanticMatcher::new(
            embedder,
            Arc::new(EmbeddingCache::new()),
            config.feedback.similarity_floor,
            config.feedback.top_k,
        ));
        let generator = Arc::new(QueryGenerator::new(llm.clone(), db.dialect(), config.llm.timeout()));
        let executor = Arc::new(Executor::new(
            db,
            config.execution.timeout(),
            config.execution.max_rows,
        ));

        let mut feedback = Self::new(schema, matcher, generator, executor, config.feedback.clone());
        if config.feedback.validator != ValidatorMode::Disabled {
            feedback = feedback.with_validator(Arc::new(Validator::new(
                llm,
                config.feedback.validation_timeout(),
            )));
        }
        if let Some(path) = &config.session_log {
            feedback = feedback.with_session_log(Arc::new(SessionLog::new(path.clone())));
        }
        Ok(feedback)
    }

    pub fn schema(&self) -> &Arc<SchemaIndex> {
        &self.schema
    }

    pub fn matcher(&self) -> &Arc<SemanticMatcher> {
        &self.matcher
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn policy(&self) -> &FeedbackConfig {
        &self.policy
    }

    pub fn session_log(&self) -> Option<&Arc<SessionLog>> {
        self.log.as_ref()
    }

    fn active_validator(&self) -> Option<&Validator> {
        match self.policy.validator {
            ValidatorMode::Disabled => None,
            _ => self.validator.as_deref(),
        }
    }

    pub async fn run(&self, request: &str) -> SessionReport {
        self.run_with_cancel(request, &CancellationToken::new()).await
    }

    /// Run one session. Never fails: every outcome, fatal ones included, is reported.
    pub async fn run_with_cancel(&self, request: &str, cancel: &CancellationToken) -> SessionReport {
        let snapshot = match cancelable(cancel, self.schema.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let session = Session::new(request, "");
                warn!("[{}] Schema unavailable, aborting: {}", session.id, e);
                let error = match e {
                    CopilotError::SchemaUnavailable(_) | CopilotError::Cancelled => e,
                    other => CopilotError::SchemaUnavailable(other.to_string()),
                };
                return self.finish(session, LoopState::Aborted(error));
            }
        };

        let session = Session::new(request, snapshot.version.clone());
        info!(
            "[{}] Session started (schema {}, max {} attempts): {}",
            session.id, snapshot.version, self.policy.max_attempts, request
        );

        let context = match cancelable(cancel, self.matcher.build_context(request, &snapshot)).await {
            Ok(context) => context,
            Err(CopilotError::Cancelled) => return self.finish(session, LoopState::Aborted(CopilotError::Cancelled)),
            Err(e) => {
                warn!(
                    "[{}] Semantic matching unavailable, using the full schema listing: {}",
                    session.id, e
                );
                SchemaContext::full_listing(&snapshot)
            }
        };
        debug!(
            "[{}] Schema context: {} matched elements, unmatched terms {:?}",
            session.id,
            context.matched.len(),
            context.unmatched_terms
        );

        let mut run = SessionRun {
            controller: self,
            cancel,
            snapshot: &snapshot,
            context: &context,
            session,
            scores: HashMap::new(),
            unknown_streak: 0,
        };

        let mut state = LoopState::Generating { repair: None };
        loop {
            if cancel.is_cancelled() && !is_terminal(&state) {
                state = LoopState::Aborted(CopilotError::Cancelled);
            }
            if is_terminal(&state) {
                break;
            }
            let from = state.name();
            state = run.step(state).await;
            debug!("[{}] {} -> {}", run.session.id, from, state.name());
        }

        self.finish(run.session, state)
    }

    fn finish(&self, mut session: Session, state: LoopState) -> SessionReport {
        let (status, outcome) = match state {
            LoopState::Resolved { attempt_index } => {
                (SessionStatus::Resolved, SessionOutcome::Resolved { attempt_index })
            }
            LoopState::Aborted(error) => (SessionStatus::Aborted, SessionOutcome::aborted(&error)),
            _ => (
                SessionStatus::Exhausted,
                SessionOutcome::Exhausted {
                    best_effort: best_effort(session.attempts()),
                },
            ),
        };
        session.finish(status);

        match &outcome {
            SessionOutcome::Resolved { attempt_index } => info!(
                "[{}] Resolved on attempt {} of {}",
                session.id, attempt_index, self.policy.max_attempts
            ),
            SessionOutcome::Exhausted { best_effort } => warn!(
                "[{}] Exhausted after {} attempts (best effort: {:?})",
                session.id,
                session.attempts().len(),
                best_effort
            ),
            SessionOutcome::Aborted { kind, message } => {
                warn!("[{}] Aborted ({}): {}", session.id, kind, message)
            }
        }

        let report = SessionReport { session, outcome };
        if let Some(log) = &self.log {
            if let Err(e) = log.append_session(&report) {
                warn!("[{}] Failed to append session log: {}", report.session.id, e);
            }
        }
        report
    }
}

fn is_terminal(state: &LoopState) -> bool {
    matches!(
        state,
        LoopState::Resolved { .. } | LoopState::Exhausted | LoopState::Aborted(_)
    )
}

/// Race `fut` against the token; a cancelled token drops the future.
async fn cancelable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CopilotError::Cancelled),
        result = fut => result,
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Mutable state of one running session.
struct SessionRun<'a> {
    controller: &'a FeedbackLoop,
    cancel: &'a CancellationToken,
    snapshot: &'a SchemaSnapshot,
    context: &'a SchemaContext,
    session: Session,
    /// Scores of earlier candidates, keyed by whitespace-normalized SQL.
    scores: HashMap<String, ValidationScore>,
    unknown_streak: u32,
}

impl<'a> SessionRun<'a> {
    async fn step(&mut self, state: LoopState) -> LoopState {
        match state {
            LoopState::Generating { repair } => self.generate(repair).await,
            LoopState::Executing {
                candidate,
                repair,
                started_at,
            } => self.execute(candidate, repair, started_at).await,
            LoopState::Validating {
                candidate,
                repair,
                result,
                started_at,
            } => self.validate(candidate, repair, result, started_at).await,
            LoopState::Repairing => self.repair(),
            terminal => terminal,
        }
    }

    async fn generate(&mut self, repair: Option<RepairContext>) -> LoopState {
        let index = self.session.next_index();
        let parent = self.session.last_attempt().map(|a| a.candidate.id);
        let started_at = Utc::now();
        info!(
            "[{}] Generating attempt {} of {}",
            self.session.id, index, self.controller.policy.max_attempts
        );

        let generated = cancelable(
            self.cancel,
            self.controller
                .generator
                .generate(&self.session.request, self.context, repair.as_ref(), index, parent),
        )
        .await;

        match generated {
            Ok(candidate) => {
                debug!("[{}] Candidate {}:\n{}", self.session.id, index, candidate.sql);
                LoopState::Executing {
                    candidate,
                    repair,
                    started_at,
                }
            }
            Err(e) => LoopState::Aborted(e),
        }
    }

    async fn execute(
        &mut self,
        candidate: QueryCandidate,
        repair: Option<RepairContext>,
        started_at: DateTime<Utc>,
    ) -> LoopState {
        let result = match self.static_name_failure(&candidate) {
            Some(failure) => failure,
            None => {
                let executed = cancelable(self.cancel, async {
                    Ok(self.controller.executor.execute(&candidate).await)
                })
                .await;
                match executed {
                    Ok(result) => result,
                    Err(e) => return LoopState::Aborted(e),
                }
            }
        };

        if result.is_success() {
            self.unknown_streak = 0;
            if self.controller.active_validator().is_some() {
                return LoopState::Validating {
                    candidate,
                    repair,
                    result,
                    started_at,
                };
            }
            let index = candidate.attempt_index;
            self.record(candidate, result, None, repair, started_at);
            return LoopState::Resolved { attempt_index: index };
        }

        let unknown = result.failure_kind() == Some(FailureKind::Unknown);
        if unknown {
            self.unknown_streak += 1;
        } else {
            self.unknown_streak = 0;
        }
        let message = match &result {
            ExecutionResult::Failure { kind, message, .. } => {
                info!(
                    "[{}] Attempt {} failed ({}): {}",
                    self.session.id, candidate.attempt_index, kind, message
                );
                message.clone()
            }
            ExecutionResult::Success { .. } => String::new(),
        };

        let index = candidate.attempt_index;
        self.record(candidate, result, None, repair, started_at);

        if unknown && self.unknown_streak >= self.controller.policy.max_unknown_failures {
            return LoopState::Aborted(CopilotError::Database(message));
        }
        self.next_or_exhausted(index)
    }

    async fn validate(
        &mut self,
        candidate: QueryCandidate,
        repair: Option<RepairContext>,
        result: ExecutionResult,
        started_at: DateTime<Utc>,
    ) -> LoopState {
        let index = candidate.attempt_index;
        let key = normalize_sql(&candidate.sql);

        let scored = match self.scores.get(&key) {
            Some(previous) => {
                info!(
                    "[{}] Attempt {} repeats an earlier candidate, reusing score {:.1}",
                    self.session.id, index, previous.score
                );
                Ok(previous.clone())
            }
            None => match (self.controller.active_validator(), result.rows()) {
                (Some(validator), Some(rows)) => {
                    cancelable(
                        self.cancel,
                        validator.score(&self.session.request, &candidate, rows),
                    )
                    .await
                }
                _ => Err(CopilotError::ValidationUnavailable("no judge configured".to_string())),
            },
        };

        match scored {
            Ok(score) => {
                let accepted = score.meets(self.controller.policy.acceptance_threshold);
                self.scores.insert(key, score.clone());
                self.record(candidate, result, Some(score), repair, started_at);
                if accepted {
                    LoopState::Resolved { attempt_index: index }
                } else {
                    self.next_or_exhausted(index)
                }
            }
            Err(CopilotError::Cancelled) => {
                self.record(candidate, result, None, repair, started_at);
                LoopState::Aborted(CopilotError::Cancelled)
            }
            Err(e) => {
                self.record(candidate, result, None, repair, started_at);
                if self.controller.policy.validator == ValidatorMode::Mandatory {
                    LoopState::Aborted(e)
                } else {
                    warn!(
                        "[{}] Judge unavailable, accepting attempt {} on execution alone: {}",
                        self.session.id, index, e
                    );
                    LoopState::Resolved { attempt_index: index }
                }
            }
        }
    }

    fn repair(&mut self) -> LoopState {
        let repair = self
            .session
            .last_attempt()
            .and_then(|attempt| ErrorRecovery::build_repair_context(attempt, self.snapshot));
        match repair {
            Some(repair) => {
                info!("[{}] Repairing: {}", self.session.id, repair.summary());
                LoopState::Generating { repair: Some(repair) }
            }
            None => {
                warn!("[{}] Nothing to repair from, stopping", self.session.id);
                LoopState::Exhausted
            }
        }
    }

    fn next_or_exhausted(&self, index: u32) -> LoopState {
        if index < self.controller.policy.max_attempts {
            LoopState::Repairing
        } else {
            LoopState::Exhausted
        }
    }

    /// Pre-execution `SchemaMismatch` for tables missing from the snapshot. Candidates
    /// the read-only guard would reject are left to the executor.
    fn static_name_failure(&self, candidate: &QueryCandidate) -> Option<ExecutionResult> {
        if !self.controller.policy.static_name_check {
            return None;
        }
        let dialect = self.controller.executor.dialect();
        if check_read_only(&candidate.sql, dialect).is_err() {
            return None;
        }
        let unknown = name_check::unknown_tables(&candidate.sql, self.snapshot, dialect);
        let first = unknown.first()?;
        Some(ExecutionResult::failure(
            FailureKind::SchemaMismatch,
            format!("no such table: {}", first),
            Some(first.clone()),
        ))
    }

    fn record(
        &mut self,
        candidate: QueryCandidate,
        result: ExecutionResult,
        score: Option<ValidationScore>,
        repair: Option<RepairContext>,
        started_at: DateTime<Utc>,
    ) {
        self.session.push_attempt(Attempt {
            index: candidate.attempt_index,
            candidate,
            result,
            score,
            repair_context: repair,
            started_at,
            finished_at: Utc::now(),
        });
    }
}
