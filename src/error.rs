use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("Validation unavailable: {0}")]
    ValidationUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CopilotError {
    /// Errors that end a session instead of feeding the repair loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CopilotError::GenerationUnavailable(_)
                | CopilotError::GenerationTimeout(_)
                | CopilotError::Cancelled
        )
    }

    /// Short machine-readable label, used in session logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            CopilotError::SchemaUnavailable(_) => "SchemaUnavailable",
            CopilotError::EmbeddingUnavailable(_) => "EmbeddingUnavailable",
            CopilotError::GenerationUnavailable(_) => "GenerationUnavailable",
            CopilotError::GenerationTimeout(_) => "GenerationTimeout",
            CopilotError::ValidationUnavailable(_) => "ValidationUnavailable",
            CopilotError::Database(_) => "Database",
            CopilotError::QueryTimeout(_) => "QueryTimeout",
            CopilotError::Config(_) => "Config",
            CopilotError::Cancelled => "Cancelled",
            CopilotError::Io(_) => "Io",
            CopilotError::Json(_) => "Json",
        }
    }
}

impl From<rusqlite::Error> for CopilotError {
    fn from(err: rusqlite::Error) -> Self {
        CopilotError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for CopilotError {
    fn from(err: sqlx::Error) -> Self {
        CopilotError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CopilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_generation_and_cancellation_are_fatal() {
        assert!(CopilotError::GenerationUnavailable("down".into()).is_fatal());
        assert!(CopilotError::GenerationTimeout(Duration::from_secs(5)).is_fatal());
        assert!(CopilotError::Cancelled.is_fatal());
        assert!(!CopilotError::EmbeddingUnavailable("down".into()).is_fatal());
        assert!(!CopilotError::ValidationUnavailable("down".into()).is_fatal());
        assert!(!CopilotError::Database("no such table: x".into()).is_fatal());
    }
}
