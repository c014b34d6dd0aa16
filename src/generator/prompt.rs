//! Generation prompt
//!
//! The prompt names every table and column the generator may use and nothing else.
//! Terms that matched no schema element are listed explicitly so the model leaves
//! them out or substitutes a real column instead of inventing one.

use crate::execution::engine::SqlDialect;
use crate::generator::RepairContext;
use crate::schema_rag::SchemaContext;

/// Bumped whenever the prompt layout changes; recorded on every candidate.
pub const PROMPT_TEMPLATE_VERSION: &str = "sqlgen-v3";

pub const SYSTEM_PROMPT: &str = "You are an expert data analyst who writes a single read-only SQL \
query answering the user's question. Use only the tables and columns provided. Reply with the \
SQL only, no explanation.";

/// Build the user prompt for one generation call.
pub fn build_prompt(
    request: &str,
    context: &SchemaContext,
    dialect: SqlDialect,
    repair: Option<&RepairContext>,
) -> String {
    let mut parts = Vec::new();

    parts.push(format!("USER QUESTION: {}", request));

    parts.push(format!("\nDATABASE: {}", dialect.name()));
    for hint in dialect.prompt_hints() {
        parts.push(format!("- {}", hint));
    }

    if context.ranked && !context.matched.is_empty() {
        parts.push("\nMOST RELEVANT SCHEMA ELEMENTS (similarity):".to_string());
        for matched in &context.matched {
            parts.push(format!(
                "- {} ({:.2})",
                matched.element.qualified_name(),
                matched.similarity
            ));
        }
    }

    parts.push("\nAVAILABLE TABLES:".to_string());
    for table in &context.tables {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        parts.push(format!("- {}({})", table.name, columns.join(", ")));
    }

    if !context.unmatched_terms.is_empty() {
        parts.push(format!(
            "\nNO MATCHING COLUMN for: {}. Do not invent columns for these terms; leave them \
             out or use the closest listed column.",
            context.unmatched_terms.join(", ")
        ));
    }

    if let Some(repair) = repair {
        parts.push(String::new());
        parts.push(repair_section(repair));
    }

    parts.push("\nRULES:".to_string());
    parts.push("- Exactly one SELECT statement (WITH clauses allowed).".to_string());
    parts.push("- Never modify data: no INSERT, UPDATE, DELETE, DDL or PRAGMA.".to_string());
    parts.push("- Use only the tables and columns listed above.".to_string());
    parts.push("- Give aggregated columns readable aliases.".to_string());
    parts.push("\nSQL:".to_string());

    parts.join("\n")
}

/// The retry section describing what went wrong with the previous attempt.
pub fn repair_section(repair: &RepairContext) -> String {
    let mut parts = Vec::new();
    match repair {
        RepairContext::ExecutionFailure {
            attempt_index,
            sql,
            kind,
            message,
            fragment,
            suggestions,
        } => {
            parts.push(format!(
                "RETRY: attempt {} failed with {}.",
                attempt_index, kind
            ));
            parts.push(format!("Previous SQL:\n{}", sql));
            parts.push(format!("Error: {}", message));
            if let Some(fragment) = fragment {
                parts.push(format!("Offending fragment: {}", fragment));
            }
            if !suggestions.is_empty() {
                parts.push(format!("Closest schema names: {}", suggestions.join(", ")));
            }
            parts.push(kind_guidance(*kind).to_string());
        }
        RepairContext::LowScore {
            attempt_index,
            sql,
            score,
            rationale,
        } => {
            parts.push(format!(
                "RETRY: attempt {} ran but a reviewer scored it {:.1}/10.",
                attempt_index, score
            ));
            parts.push(format!("Previous SQL:\n{}", sql));
            parts.push(format!("Reviewer feedback: {}", rationale));
            parts.push("Rewrite the query so it answers the question as the feedback describes.".to_string());
        }
    }
    parts.join("\n")
}

fn kind_guidance(kind: crate::execution::FailureKind) -> &'static str {
    use crate::execution::FailureKind::*;
    match kind {
        SyntaxError => "Fix the syntax for this database.",
        SchemaMismatch => "Use only the table and column names listed above.",
        TypeError => "Fix the types: cast values, or group every non-aggregated column.",
        Timeout => "The query was too slow. Simplify it, filter earlier, or aggregate less data.",
        MutationRejected => "Only a read-only SELECT is allowed.",
        Unknown => "Rewrite the query to avoid this error.",
    }
}
