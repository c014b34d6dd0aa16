//! Query Generator
//!
//! Turns a request plus schema context (and, on retries, repair context) into one
//! [`QueryCandidate`]. The language model is treated as a nondeterministic oracle:
//! its reply is cleaned and the SQL extracted, never trusted to be well-formed.

pub mod name_check;
pub mod prompt;

use crate::error::{CopilotError, Result};
use crate::execution::engine::SqlDialect;
use crate::execution::guard::statement_end;
use crate::execution::FailureKind;
use crate::llm::{strip_code_fences, GenerationContext, LanguageModel, Purpose};
use crate::schema_rag::SchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub use prompt::PROMPT_TEMPLATE_VERSION;

lazy_static! {
    static ref SQL_LABEL: Regex = Regex::new(r"(?i)^\s*(?:sql(?:\s+query)?|query)\s*:\s*").unwrap();
    static ref QUERY_START: Regex = Regex::new(r"(?im)^\s*(SELECT|WITH)\b").unwrap();
}

/// One generated SQL candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCandidate {
    pub id: Uuid,
    pub sql: String,
    /// Prompt template version and schema snapshot version that produced it.
    pub prompt_version: String,
    pub attempt_index: u32,
    /// Candidate this one repairs.
    pub parent: Option<Uuid>,
}

/// Why a retry is happening: the previous attempt's failure or low score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RepairContext {
    ExecutionFailure {
        attempt_index: u32,
        sql: String,
        kind: FailureKind,
        message: String,
        fragment: Option<String>,
        suggestions: Vec<String>,
    },
    LowScore {
        attempt_index: u32,
        sql: String,
        score: f32,
        rationale: String,
    },
}

impl RepairContext {
    /// Index of the attempt this context was built from.
    pub fn source_attempt(&self) -> u32 {
        match self {
            RepairContext::ExecutionFailure { attempt_index, .. }
            | RepairContext::LowScore { attempt_index, .. } => *attempt_index,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            RepairContext::ExecutionFailure { kind, message, .. } => format!("{}: {}", kind, message),
            RepairContext::LowScore { score, rationale, .. } => {
                format!("score {:.1}: {}", score, rationale)
            }
        }
    }
}

pub struct QueryGenerator {
    llm: Arc<dyn LanguageModel>,
    dialect: SqlDialect,
    timeout: Duration,
}

impl QueryGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, dialect: SqlDialect, timeout: Duration) -> Self {
        Self {
            llm,
            dialect,
            timeout,
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Generate one candidate. Errors are always generation-capability errors
    /// (`GenerationUnavailable`, `GenerationTimeout`) or cancellation.
    pub async fn generate(
        &self,
        request: &str,
        context: &SchemaContext,
        repair: Option<&RepairContext>,
        attempt_index: u32,
        parent: Option<Uuid>,
    ) -> Result<QueryCandidate> {
        let prompt = prompt::build_prompt(request, context, self.dialect, repair);
        let purpose = if repair.is_some() {
            Purpose::Repair
        } else {
            Purpose::Generation
        };
        let generation_context = GenerationContext::new(prompt::SYSTEM_PROMPT, purpose);

        debug!("Generation prompt for attempt {}:\n{}", attempt_index, prompt);
        let response = tokio::time::timeout(self.timeout, self.llm.generate(&prompt, &generation_context))
            .await
            .map_err(|_| CopilotError::GenerationTimeout(self.timeout))?
            .map_err(as_generation_error)?;

        let sql = extract_sql(&response);
        info!(
            "Model {} produced candidate for attempt {} ({} chars)",
            self.llm.name(),
            attempt_index,
            sql.len()
        );

        Ok(QueryCandidate {
            id: Uuid::new_v4(),
            sql,
            prompt_version: format!("{}@{}", PROMPT_TEMPLATE_VERSION, context.snapshot_version),
            attempt_index,
            parent,
        })
    }
}

fn as_generation_error(err: CopilotError) -> CopilotError {
    match err {
        CopilotError::GenerationUnavailable(_)
        | CopilotError::GenerationTimeout(_)
        | CopilotError::Cancelled => err,
        other => CopilotError::GenerationUnavailable(other.to_string()),
    }
}

/// Pull the SQL statement out of a model reply: code fences, `SQL:` labels,
/// `{"sql": ...}` envelopes and leading prose are removed, and the reply is cut at the
/// first `;` outside quotes.
pub fn extract_sql(response: &str) -> String {
    let unfenced = strip_code_fences(response);

    let from_json = if unfenced.starts_with('{') {
        serde_json::from_str::<serde_json::Value>(unfenced)
            .ok()
            .and_then(|v| v.get("sql").and_then(|s| s.as_str()).map(|s| s.to_string()))
    } else {
        None
    };
    let text = from_json.unwrap_or_else(|| unfenced.to_string());

    let text = SQL_LABEL.replace(&text, "");
    let text = match QUERY_START.find(&text) {
        Some(m) => &text[m.start()..],
        None => &text[..],
    };
    let text = match statement_end(text, &GenericDialect {}) {
        Some(end) => &text[..end],
        None => text,
    };

    text.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnMetadata, SchemaSnapshot, Table};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: std::result::Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _context: &GenerationContext) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply
                .clone()
                .map_err(CopilotError::Config)
        }
    }

    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn generate(&self, _prompt: &str, _context: &GenerationContext) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("SELECT 1".to_string())
        }
    }

    fn context() -> SchemaContext {
        SchemaContext::full_listing(&SchemaSnapshot::new(vec![Table::new(
            "sales",
            vec![ColumnMetadata::new("revenue", "REAL", true)],
        )]))
    }

    #[test]
    fn test_extract_sql_drops_prose_after_the_statement() {
        assert_eq!(
            extract_sql("SELECT SUM(revenue) AS total FROM sales;\nThis sums all revenue."),
            "SELECT SUM(revenue) AS total FROM sales"
        );
        assert_eq!(
            extract_sql("SELECT customer_id FROM sales WHERE note = 'a;b'; -- it's done"),
            "SELECT customer_id FROM sales WHERE note = 'a;b'"
        );
    }

    #[test]
    fn test_extract_sql_variants() {
        assert_eq!(extract_sql("```sql\nSELECT 1;\n```"), "SELECT 1");
        assert_eq!(extract_sql("SQL: SELECT revenue FROM sales;"), "SELECT revenue FROM sales");
        assert_eq!(
            extract_sql("{\"sql\": \"SELECT SUM(revenue) FROM sales\"}"),
            "SELECT SUM(revenue) FROM sales"
        );
        assert_eq!(
            extract_sql("Here is the query you asked for:\nWITH t AS (SELECT 1) SELECT * FROM t;"),
            "WITH t AS (SELECT 1) SELECT * FROM t"
        );
        assert_eq!(extract_sql("I cannot help with that."), "I cannot help with that.");
    }

    #[tokio::test]
    async fn test_generate_records_lineage_and_version() {
        let model = Arc::new(ScriptedModel {
            reply: Ok("```sql\nSELECT SUM(revenue) FROM sales\n```".to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = QueryGenerator::new(model.clone(), SqlDialect::Sqlite, Duration::from_secs(5));
        let ctx = context();
        let parent = Uuid::new_v4();

        let candidate = generator
            .generate("total revenue", &ctx, None, 2, Some(parent))
            .await
            .unwrap();
        assert_eq!(candidate.sql, "SELECT SUM(revenue) FROM sales");
        assert_eq!(candidate.attempt_index, 2);
        assert_eq!(candidate.parent, Some(parent));
        assert_eq!(
            candidate.prompt_version,
            format!("{}@{}", PROMPT_TEMPLATE_VERSION, ctx.snapshot_version)
        );
        assert_eq!(model.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_errors_become_generation_unavailable() {
        let model = Arc::new(ScriptedModel {
            reply: Err("socket closed".to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = QueryGenerator::new(model, SqlDialect::Sqlite, Duration::from_secs(5));
        let err = generator
            .generate("total revenue", &context(), None, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CopilotError::GenerationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let generator = QueryGenerator::new(Arc::new(StalledModel), SqlDialect::Sqlite, Duration::from_millis(50));
        let err = generator
            .generate("total revenue", &context(), None, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CopilotError::GenerationTimeout(_)));
    }
}
