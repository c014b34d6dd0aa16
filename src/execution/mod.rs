pub mod engine;
pub mod error_classifier;
pub mod executor;
pub mod guard;
pub mod postgres_engine;
pub mod result;
pub mod sqlite_engine;

pub use engine::{connect, DatabaseCapability, SqlDialect};
pub use error_classifier::ErrorClassifier;
pub use executor::Executor;
pub use guard::{check_read_only, GuardViolation};
pub use result::{ColumnInfo, ExecutionResult, FailureKind, QueryRows};
