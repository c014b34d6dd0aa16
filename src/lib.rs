//! sqlpilot: natural-language analytics questions to validated, executable SQL.
//!
//! A request flows through the [`execution_loop::FeedbackLoop`]: semantic matching
//! against the schema snapshot, candidate generation, read-only execution, judging,
//! and repair until the session resolves, exhausts its attempts, or aborts.

pub mod config;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod export;
pub mod generator;
pub mod judge;
pub mod llm;
pub mod metadata;
pub mod observability;
pub mod quick_queries;
pub mod schema_rag;

pub use config::CopilotConfig;
pub use error::{CopilotError, Result};
pub use execution_loop::{CancellationToken, FeedbackLoop, SessionReport, SessionRunner, SessionStatus};
