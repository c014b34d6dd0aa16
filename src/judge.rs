//! Validator (judge)
//!
//! A second model call scores how well an executed candidate answers the request.
//! Only successful executions are scored, which the signature enforces by taking
//! the returned rows.

use crate::error::{CopilotError, Result};
use crate::execution::QueryRows;
use crate::generator::QueryCandidate;
use crate::llm::{strip_code_fences, GenerationContext, LanguageModel, Purpose};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound of the score scale; scores are clamped into `0..=MAX_SCORE`.
pub const MAX_SCORE: f32 = 10.0;

/// Rows shown to the judge.
pub const SAMPLE_ROWS: usize = 20;

const JUDGE_SYSTEM_PROMPT: &str = "You review SQL written for analytics questions. Judge whether \
the query and its result answer the question. Respond with JSON only.";

lazy_static! {
    static ref LOOSE_SCORE: Regex = Regex::new(r"(?i)score\D{0,10}?(\d+(?:\.\d+)?)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationScore {
    pub score: f32,
    pub rationale: String,
}

impl ValidationScore {
    pub fn meets(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

pub struct Validator {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl Validator {
    pub fn new(llm: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Score `candidate` against `request`. Any judge failure is `ValidationUnavailable`.
    pub async fn score(
        &self,
        request: &str,
        candidate: &QueryCandidate,
        rows: &QueryRows,
    ) -> Result<ValidationScore> {
        let prompt = build_rubric_prompt(request, &candidate.sql, rows);
        let context = GenerationContext::new(JUDGE_SYSTEM_PROMPT, Purpose::Judging);

        let response = match tokio::time::timeout(self.timeout, self.llm.generate(&prompt, &context)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Judge call failed: {}", e);
                return Err(CopilotError::ValidationUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!("Judge call exceeded {:?}", self.timeout);
                return Err(CopilotError::ValidationUnavailable(format!(
                    "judge timed out after {} s",
                    self.timeout.as_secs_f32()
                )));
            }
        };

        let score = parse_score(&response)?;
        info!(
            "Attempt {} scored {:.1}/{}",
            candidate.attempt_index, score.score, MAX_SCORE
        );
        Ok(score)
    }
}

/// Rubric prompt: request, SQL, columns, row count and the first rows.
pub fn build_rubric_prompt(request: &str, sql: &str, rows: &QueryRows) -> String {
    let mut parts = Vec::new();

    parts.push(format!("QUESTION: {}", request));
    parts.push(format!("\nSQL:\n{}", sql));
    parts.push(format!("\nRESULT COLUMNS: {}", rows.column_names().join(", ")));
    parts.push(format!(
        "ROW COUNT: {}{}",
        rows.row_count(),
        if rows.truncated { " (truncated)" } else { "" }
    ));

    if rows.rows.is_empty() {
        parts.push("RESULT: (no rows)".to_string());
    } else {
        let shown = rows.rows.len().min(SAMPLE_ROWS);
        parts.push(format!("FIRST {} ROWS:", shown));
        for row in rows.rows.iter().take(SAMPLE_ROWS) {
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            parts.push(format!("| {} |", cells.join(" | ")));
        }
    }

    parts.push("\nRUBRIC (score 0-10):".to_string());
    parts.push("- Aggregation: the right measure is aggregated the right way.".to_string());
    parts.push("- Filters: every condition in the question is applied, no extra ones.".to_string());
    parts.push("- Columns: the result has the columns the question asks for.".to_string());
    parts.push("- Ordering and limits match the question (top N, latest, ...).".to_string());
    parts.push(
        "\nRespond with exactly: {\"score\": <0-10>, \"rationale\": \"<one or two sentences>\"}"
            .to_string(),
    );

    parts.join("\n")
}

/// Parse the judge's reply; scores outside the scale are clamped.
pub fn parse_score(response: &str) -> Result<ValidationScore> {
    let cleaned = strip_code_fences(response);
    let json_slice = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&cleaned[start..=end]),
        _ => None,
    };

    if let Some(value) = json_slice.and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()) {
        let score = value.get("score").and_then(|s| match s {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        });
        if let Some(score) = score {
            let rationale = ["rationale", "reason", "explanation"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|r| r.as_str()))
                .unwrap_or("")
                .trim()
                .to_string();
            return clamp(score as f32, rationale);
        }
    }

    if let Some(caps) = LOOSE_SCORE.captures(cleaned) {
        if let Ok(score) = caps[1].parse::<f32>() {
            return clamp(score, cleaned.trim().to_string());
        }
    }

    Err(CopilotError::ValidationUnavailable(format!(
        "unparseable judge response: {}",
        response.chars().take(200).collect::<String>()
    )))
}

fn clamp(score: f32, rationale: String) -> Result<ValidationScore> {
    if !score.is_finite() {
        return Err(CopilotError::ValidationUnavailable("judge returned a non-finite score".to_string()));
    }
    Ok(ValidationScore {
        score: score.clamp(0.0, MAX_SCORE),
        rationale,
    })
}
