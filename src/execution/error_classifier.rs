//! Error Classifier
//!
//! Maps database error messages (SQLite and PostgreSQL wording) onto [`FailureKind`]
//! and pulls out the offending identifier when the message names one.

use crate::execution::result::FailureKind;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NO_SUCH_OBJECT: Regex =
        Regex::new(r#"(?i)no such (?:column|table|function): ([^\s,;)]+)"#).unwrap();
    static ref PG_MISSING_OBJECT: Regex =
        Regex::new(r#"(?i)(?:column|relation|function) "?([^"\s]+?)"?(?:\(.*?\))? does not exist"#).unwrap();
    static ref AMBIGUOUS: Regex = Regex::new(r#"(?i)ambiguous column(?: name)?:? "?([^"\s]+)"?"#).unwrap();
    static ref NEAR_TOKEN: Regex = Regex::new(r#"(?i)near "([^"]*)""#).unwrap();
    static ref PG_AT_OR_NEAR: Regex = Regex::new(r#"(?i)at or near "([^"]*)""#).unwrap();
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a database error message.
    pub fn classify(&self, message: &str) -> (FailureKind, Option<String>) {
        let lower = message.to_lowercase();

        if let Some(caps) = NO_SUCH_OBJECT.captures(message) {
            return (FailureKind::SchemaMismatch, Some(clean_fragment(&caps[1])));
        }
        if let Some(caps) = PG_MISSING_OBJECT.captures(message) {
            return (FailureKind::SchemaMismatch, Some(clean_fragment(&caps[1])));
        }
        if let Some(caps) = AMBIGUOUS.captures(message) {
            return (FailureKind::SchemaMismatch, Some(clean_fragment(&caps[1])));
        }

        if lower.contains("statement timeout")
            || lower.contains("canceling statement")
            || lower.contains("interrupted")
            || lower.contains("timed out")
        {
            return (FailureKind::Timeout, None);
        }

        if lower.contains("readonly database")
            || lower.contains("read-only transaction")
            || lower.contains("read only transaction")
        {
            return (FailureKind::MutationRejected, None);
        }

        if lower.contains("datatype mismatch")
            || lower.contains("type mismatch")
            || lower.contains("invalid input syntax for type")
            || lower.contains("operator does not exist")
            || lower.contains("cannot be cast")
            || lower.contains("cannot cast")
            || lower.contains("must appear in the group by clause")
            || lower.contains("misuse of aggregate")
            || lower.contains("wrong number of arguments")
        {
            let fragment = PG_AT_OR_NEAR
                .captures(message)
                .map(|caps| caps[1].to_string());
            return (FailureKind::TypeError, fragment);
        }

        if lower.contains("syntax error") || lower.contains("incomplete input") || lower.contains("unrecognized token") {
            let fragment = NEAR_TOKEN
                .captures(message)
                .or_else(|| PG_AT_OR_NEAR.captures(message))
                .map(|caps| caps[1].to_string());
            return (FailureKind::SyntaxError, fragment);
        }

        (FailureKind::Unknown, None)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_fragment(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .to_string()
}
