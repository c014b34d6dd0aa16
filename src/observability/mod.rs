pub mod session_log;

pub use session_log::{ExecutionSummary, LogRecord, SessionLog};
