use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlpilot::config::{CopilotConfig, ValidatorMode};
use sqlpilot::execution::{connect, ExecutionResult, Executor, QueryRows};
use sqlpilot::execution_loop::{CancellationToken, FeedbackLoop, SessionOutcome, SessionReport, SessionRunner};
use sqlpilot::metadata::SchemaIndex;
use sqlpilot::observability::{ExecutionSummary, LogRecord, SessionLog};
use sqlpilot::schema_rag::{build_embedder, EmbeddingCache, SemanticMatcher};
use sqlpilot::{export, quick_queries};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Rows printed in text output; exports and JSON carry everything.
const PRINT_ROWS: usize = 20;

#[derive(Parser)]
#[command(name = "sqlpilot")]
#[command(about = "Ask analytics questions in plain language, get validated SQL and results")]
struct Cli {
    /// JSON config file (defaults, then this file, then environment, then flags)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (sqlite://path.db or postgres://...)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Turn a question into SQL, run it and repair it until it is accepted
    Ask {
        question: String,
        /// Write the accepted (or best-effort) result to a CSV file
        #[arg(long)]
        export: Option<PathBuf>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// disabled, advisory or mandatory
        #[arg(long)]
        validator: Option<ValidatorMode>,
    },
    /// Print the schema snapshot
    Schema,
    /// Rank schema elements against a term
    Match {
        term: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// List canned queries, or run one by name
    Quick {
        name: Option<String>,
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Run one question per line of a file, concurrently
    Batch {
        file: PathBuf,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show the logged attempts of a session
    History { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Ask {
            question,
            export,
            max_attempts,
            validator,
        } => {
            if let Some(max_attempts) = max_attempts {
                config.feedback.max_attempts = max_attempts;
            }
            if let Some(validator) = validator {
                config.feedback.validator = validator;
            }
            let controller = FeedbackLoop::from_config(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let report = controller.run_with_cancel(&question, &cancel).await;

            if let Some(path) = export {
                match report.best_attempt().and_then(|a| a.rows()) {
                    Some(rows) => export::write_csv(rows, &path)?,
                    None => warn!("Nothing to export: no attempt executed successfully"),
                }
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.accepted().is_none() {
                std::process::exit(2);
            }
        }
        Command::Schema => {
            let db = connect(&config.database_url).await?;
            let snapshot = SchemaIndex::new(db).snapshot().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            } else {
                println!("Schema {} ({} tables)", snapshot.version, snapshot.tables.len());
                for table in &snapshot.tables {
                    println!("\n{}", table.name);
                    for column in &table.columns {
                        println!(
                            "  {:<24} {}{}",
                            column.name,
                            column.data_type,
                            if column.nullable { "" } else { " NOT NULL" }
                        );
                    }
                }
            }
        }
        Command::Match { term, k } => {
            let db = connect(&config.database_url).await?;
            let snapshot = SchemaIndex::new(db).snapshot().await?;
            let matcher = SemanticMatcher::new(
                build_embedder(&config.embedding)?,
                Arc::new(EmbeddingCache::new()),
                config.feedback.similarity_floor,
                config.feedback.top_k,
            );
            let result = matcher
                .match_term(&term, &snapshot, k.unwrap_or(config.feedback.top_k))
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.matches.is_empty() {
                println!(
                    "No schema element matches '{}' above similarity {:.2}",
                    term, config.feedback.similarity_floor
                );
            } else {
                for matched in &result.matches {
                    println!("{:.3}  {}", matched.similarity, matched.element.qualified_name());
                }
            }
        }
        Command::Quick { name, export } => {
            let Some(name) = name else {
                for query in quick_queries::QUICK_QUERIES {
                    println!("{:<28} {}", query.name, query.title);
                }
                return Ok(());
            };
            let query = quick_queries::find(&name)
                .ok_or_else(|| anyhow!("no quick query named '{}' (run `sqlpilot quick` for the list)", name))?;
            let db = connect(&config.database_url).await?;
            let executor = Executor::new(db, config.execution.timeout(), config.execution.max_rows);
            match quick_queries::run(&executor, query).await {
                ExecutionResult::Success { rows, elapsed_ms } => {
                    if let Some(path) = export {
                        export::write_csv(&rows, &path)?;
                    }
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    } else {
                        println!("{} ({} ms)\n", query.title, elapsed_ms);
                        print_rows(&rows);
                    }
                }
                ExecutionResult::Failure { kind, message, .. } => {
                    bail!("quick query '{}' failed ({}): {}", query.name, kind, message)
                }
            }
        }
        Command::Batch { file, concurrency } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let requests: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect();

            let controller = Arc::new(FeedbackLoop::from_config(&config).await?);
            let runner = SessionRunner::new(controller, concurrency.unwrap_or(config.concurrency));
            let token = runner.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let reports = runner.run_batch(requests).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!("{}", "=".repeat(72));
                    print_report(report);
                }
                let resolved = reports.iter().filter(|r| r.accepted().is_some()).count();
                println!("\n{} of {} requests resolved", resolved, reports.len());
            }
        }
        Command::History { session_id } => {
            let session_id = Uuid::parse_str(session_id.trim())
                .with_context(|| format!("'{}' is not a session id", session_id))?;
            let path = config
                .session_log
                .clone()
                .ok_or_else(|| anyhow!("no session log configured (set SQLPILOT_SESSION_LOG)"))?;
            let records = SessionLog::new(path).read_session(session_id)?;
            if records.is_empty() {
                bail!("session {} not found in the log", session_id);
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_history(&records);
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<CopilotConfig> {
    let base = match &cli.config {
        Some(path) => CopilotConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CopilotConfig::default(),
    };
    let mut config = base.with_env_overrides(|key| std::env::var(key).ok())?;
    if let Some(url) = &cli.database {
        config.database_url = url.clone();
    }
    config.validate()?;
    info!("Using database {}", config.database_url);
    Ok(config)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            handle.cancel();
        }
    });
    token
}

fn print_report(report: &SessionReport) {
    println!("Question: {}", report.session.request);
    println!("Session:  {}", report.session.id);

    match &report.outcome {
        SessionOutcome::Resolved { attempt_index } => {
            println!("✅ Resolved on attempt {}", attempt_index)
        }
        SessionOutcome::Exhausted { best_effort } => match best_effort {
            Some(index) => println!("⚠️  Attempts exhausted; best effort is attempt {}", index),
            None => println!("⚠️  Attempts exhausted; no attempt executed successfully"),
        },
        SessionOutcome::Aborted { kind, message } => println!("❌ Aborted ({}): {}", kind, message),
    }

    if let Some(attempt) = report.best_attempt() {
        println!("\nSQL:\n{}\n", attempt.candidate.sql);
        if let Some(rows) = attempt.rows() {
            print_rows(rows);
        }
    }

    if report.session.attempts().len() > 1 || report.accepted().is_none() {
        println!("\nAttempts:");
        for attempt in report.session.attempts() {
            let outcome = match &attempt.result {
                ExecutionResult::Success { rows, .. } => format!("ok, {} rows", rows.row_count()),
                ExecutionResult::Failure { kind, message, .. } => format!("{}: {}", kind, message),
            };
            let score = attempt
                .score
                .as_ref()
                .map(|s| format!(" [score {:.1}]", s.score))
                .unwrap_or_default();
            println!("  {}. {}{}", attempt.index, outcome, score);
        }
    }
}

fn print_rows(rows: &QueryRows) {
    println!("{}", rows.column_names().join(" | "));
    for row in rows.rows.iter().take(PRINT_ROWS) {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => "NULL".to_string(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    if rows.row_count() > PRINT_ROWS {
        println!("... {} more rows", rows.row_count() - PRINT_ROWS);
    }
    if rows.truncated {
        println!("(result truncated at the row limit)");
    }
}

fn print_history(records: &[LogRecord]) {
    for record in records {
        match record {
            LogRecord::Attempt {
                index,
                candidate,
                execution,
                score,
                repair_context,
                ..
            } => {
                println!("Attempt {}", index);
                if let Some(repair) = repair_context {
                    println!("  repairing: {}", repair.summary());
                }
                println!("  sql: {}", candidate.sql.replace('\n', " "));
                match execution {
                    ExecutionSummary::Success { row_count, elapsed_ms, .. } => {
                        println!("  ok: {} rows in {} ms", row_count, elapsed_ms)
                    }
                    ExecutionSummary::Failure { kind, message, .. } => println!("  {}: {}", kind, message),
                }
                if let Some(score) = score {
                    println!("  score {:.1}: {}", score.score, score.rationale);
                }
            }
            LogRecord::Outcome {
                status, attempts, ..
            } => println!("Outcome: {:?} after {} attempts", status, attempts),
        }
    }
}
