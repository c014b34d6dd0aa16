//! Read-only guard
//!
//! Runs before anything reaches the database. A candidate must be exactly one query
//! statement (or an `EXPLAIN` of one), and no unquoted mutating keyword may open a
//! statement or a parenthesized body such as a CTE.

use crate::execution::engine::SqlDialect;
use crate::execution::result::FailureKind;
use lazy_static::lazy_static;
use sqlparser::ast::Statement;
use sqlparser::dialect::Dialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::collections::HashSet;
use tracing::debug;

lazy_static! {
    static ref MUTATING_KEYWORDS: HashSet<&'static str> = [
        "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE", "DROP", "CREATE", "ALTER",
        "TRUNCATE", "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX",
        "COPY", "CALL",
    ]
    .into_iter()
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardViolation {
    pub kind: FailureKind,
    pub message: String,
    pub fragment: Option<String>,
}

impl GuardViolation {
    fn mutation(keyword: &str) -> Self {
        Self {
            kind: FailureKind::MutationRejected,
            message: format!(
                "Statement contains '{}'; only read-only SELECT queries are allowed",
                keyword
            ),
            fragment: Some(keyword.to_string()),
        }
    }

    fn syntax(message: String, fragment: Option<String>) -> Self {
        Self {
            kind: FailureKind::SyntaxError,
            message,
            fragment,
        }
    }
}

/// Accepts `sql` only if it is a single read-only query.
///
/// Parser failures are not rejected here unless a mutating keyword opens a statement or
/// text follows the first `;`: the database reports a more useful syntax error for the
/// repair loop.
pub fn check_read_only(sql: &str, dialect: SqlDialect) -> Result<(), GuardViolation> {
    let parser_dialect = dialect.parser_dialect();

    if sql.trim().is_empty() {
        return Err(GuardViolation::syntax("Generated SQL is empty".to_string(), None));
    }

    if let Some(keyword) = leading_mutating_keyword(sql, parser_dialect.as_ref()) {
        return Err(GuardViolation::mutation(&keyword));
    }

    match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => {
            if statements.len() != 1 {
                return Err(GuardViolation::syntax(
                    format!(
                        "Expected exactly one SQL statement, found {}",
                        statements.len()
                    ),
                    None,
                ));
            }
            match &statements[0] {
                Statement::Query(_) => Ok(()),
                Statement::Explain { statement, .. } if matches!(**statement, Statement::Query(_)) => {
                    Ok(())
                }
                Statement::Explain { statement, .. } => Err(GuardViolation::mutation(&leading_word(statement))),
                other => Err(GuardViolation::mutation(&leading_word(other))),
            }
        }
        Err(e) => {
            if let Some(rest) = trailing_text(sql, parser_dialect.as_ref()) {
                return Err(GuardViolation::syntax(
                    "Expected exactly one SQL statement, found more text after ';'".to_string(),
                    Some(rest),
                ));
            }
            debug!("Guard could not parse candidate ({}), deferring to database", e);
            Ok(())
        }
    }
}

/// Byte offset of the first `;` outside string literals, quoted identifiers and comments.
pub fn statement_end(sql: &str, dialect: &dyn Dialect) -> Option<usize> {
    sql.match_indices(';').map(|(pos, _)| pos).find(|&pos| {
        // A prefix that ends inside a quote or block comment does not tokenize.
        match Tokenizer::new(dialect, &sql[..pos]).tokenize() {
            Ok(tokens) => !matches!(
                tokens.last(),
                Some(Token::Whitespace(Whitespace::SingleLineComment { .. }))
            ),
            Err(_) => false,
        }
    })
}

fn trailing_text(sql: &str, dialect: &dyn Dialect) -> Option<String> {
    let end = statement_end(sql, dialect)?;
    let rest = sql[end + 1..]
        .trim_start_matches(|c: char| c == ';' || c.is_whitespace())
        .trim_end();
    (!rest.is_empty()).then(|| rest.to_string())
}

fn leading_word(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("statement")
        .to_uppercase()
}

/// First unquoted mutating keyword in a position that opens a statement: the first
/// token, or one following `;`, `(`, `)`, `EXPLAIN` or `ANALYZE`.
fn leading_mutating_keyword(sql: &str, dialect: &dyn Dialect) -> Option<String> {
    match Tokenizer::new(dialect, sql).tokenize() {
        Ok(tokens) => {
            let significant: Vec<&Token> = tokens
                .iter()
                .filter(|t| !matches!(t, Token::Whitespace(_)))
                .collect();
            significant.iter().enumerate().find_map(|(idx, token)| {
                let Token::Word(word) = token else {
                    return None;
                };
                let upper = word.value.to_uppercase();
                if word.quote_style.is_some() || !MUTATING_KEYWORDS.contains(upper.as_str()) {
                    return None;
                }
                let opens_statement = idx == 0
                    || match significant[idx - 1] {
                        Token::SemiColon | Token::LParen | Token::RParen => true,
                        Token::Word(prev) => matches!(prev.keyword, Keyword::EXPLAIN | Keyword::ANALYZE),
                        _ => false,
                    };
                // REPLACE(str, from, to) is a string function, not a statement.
                let is_call = matches!(significant.get(idx + 1), Some(Token::LParen));
                (opens_statement && !(upper == "REPLACE" && is_call)).then_some(upper)
            })
        }
        // Untokenizable input: fall back to the first word of each `;`-separated piece.
        Err(_) => sql
            .split(';')
            .filter_map(|piece| piece.split(|c: char| !c.is_alphanumeric() && c != '_').find(|w| !w.is_empty()))
            .map(|w| w.to_uppercase())
            .find(|w| MUTATING_KEYWORDS.contains(w.as_str())),
    }
}
