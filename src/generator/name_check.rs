//! Static table-name check
//!
//! Finds the tables a candidate reads (FROM / JOIN targets) and reports the ones that
//! are neither in the schema snapshot nor defined by the query's own CTEs. Runs before
//! the database sees the candidate.

use crate::execution::engine::SqlDialect;
use crate::metadata::SchemaSnapshot;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::HashSet;

/// Functions whose argument syntax uses FROM (`EXTRACT(YEAR FROM d)`).
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "POSITION", "OVERLAY"];

/// Table references of a query.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableReferences {
    /// Tables read in FROM / JOIN clauses, first occurrence order.
    pub tables: Vec<String>,
    /// Names defined in WITH clauses.
    pub ctes: Vec<String>,
}

fn plain_word(token: &Token) -> Option<&Word> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word),
        _ => None,
    }
}

fn is_keyword(token: Option<&&Token>, keyword: &str) -> bool {
    token
        .and_then(|t| plain_word(t))
        .map(|w| w.value.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
}

fn is_identifier(token: &Token) -> bool {
    match token {
        Token::Word(word) => {
            word.quote_style.is_some() || word.keyword == sqlparser::keywords::Keyword::NoKeyword
        }
        _ => false,
    }
}

/// Extract FROM / JOIN targets and CTE names. Unparseable input yields nothing: the
/// database reports a better error for it.
pub fn referenced_tables(sql: &str, dialect: SqlDialect) -> TableReferences {
    let parser_dialect = dialect.parser_dialect();
    let tokens = match Tokenizer::new(parser_dialect.as_ref(), sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return TableReferences::default(),
    };
    let tokens: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut refs = TableReferences::default();
    let mut seen = HashSet::new();
    // One entry per open parenthesis: does FROM inside it belong to a function call?
    let mut paren_is_function: Vec<bool> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        match token {
            Token::LParen => {
                let is_function = i > 0
                    && plain_word(tokens[i - 1])
                        .map(|w| {
                            FROM_ARGUMENT_FUNCTIONS
                                .iter()
                                .any(|f| w.value.eq_ignore_ascii_case(f))
                        })
                        .unwrap_or(false);
                paren_is_function.push(is_function);
            }
            Token::RParen => {
                paren_is_function.pop();
            }
            Token::Word(_) if is_cte_name(&tokens, i) => {
                if let Token::Word(word) = token {
                    refs.ctes.push(word.value.clone());
                }
            }
            _ => {}
        }

        let Some(word) = plain_word(token) else {
            i += 1;
            continue;
        };
        let upper = word.value.to_uppercase();
        let inside_function = paren_is_function.last().copied().unwrap_or(false);
        let is_distinct_from = upper == "FROM" && i > 0 && is_keyword(tokens.get(i - 1), "DISTINCT");

        if (upper == "FROM" && !inside_function && !is_distinct_from) || upper == "JOIN" {
            let allow_list = upper == "FROM";
            i = read_table_list(&tokens, i + 1, allow_list, &mut refs, &mut seen);
            continue;
        }
        i += 1;
    }

    refs
}

/// `name AS (` or `name (cols) AS (` right after WITH, RECURSIVE, or a comma that
/// follows a CTE body.
fn is_cte_name(tokens: &[&Token], i: usize) -> bool {
    if !is_identifier(tokens[i]) || i == 0 {
        return false;
    }
    let prev = tokens[i - 1];
    let after_with = is_keyword(Some(&prev), "WITH") || is_keyword(Some(&prev), "RECURSIVE");
    let after_cte_body = matches!(prev, Token::Comma) && i >= 2 && matches!(tokens[i - 2], Token::RParen);
    if !(after_with || after_cte_body) {
        return false;
    }

    let mut j = i + 1;
    if matches!(tokens.get(j), Some(Token::LParen)) {
        while j < tokens.len() && !matches!(tokens[j], Token::RParen) {
            j += 1;
        }
        j += 1;
    }
    is_keyword(tokens.get(j), "AS")
        && (matches!(tokens.get(j + 1), Some(Token::LParen))
            || is_keyword(tokens.get(j + 1), "MATERIALIZED")
            || is_keyword(tokens.get(j + 1), "NOT"))
}

/// Read `table [AS] [alias] (, table [AS] [alias])*` starting at `i`; returns the index
/// after the last consumed token.
fn read_table_list(
    tokens: &[&Token],
    mut i: usize,
    allow_list: bool,
    refs: &mut TableReferences,
    seen: &mut HashSet<String>,
) -> usize {
    loop {
        // Subqueries and table functions are not table names.
        let Some(Token::Word(first)) = tokens.get(i) else {
            return i;
        };
        if first.quote_style.is_none() && first.keyword == sqlparser::keywords::Keyword::LATERAL {
            return i + 1;
        }

        let mut name = first.value.clone();
        let mut qualified = false;
        i += 1;
        while matches!(tokens.get(i), Some(Token::Period)) {
            if let Some(Token::Word(part)) = tokens.get(i + 1) {
                name = part.value.clone();
                qualified = true;
                i += 2;
            } else {
                break;
            }
        }
        if matches!(tokens.get(i), Some(Token::LParen)) {
            return i;
        }
        if !(qualified && is_system_schema(tokens, i)) && seen.insert(name.to_lowercase()) {
            refs.tables.push(name);
        }

        // Optional alias.
        if is_keyword(tokens.get(i), "AS") {
            i += 2;
        } else if tokens.get(i).map(|t| is_identifier(t)).unwrap_or(false) {
            i += 1;
        }

        if allow_list && matches!(tokens.get(i), Some(Token::Comma)) {
            i += 1;
            continue;
        }
        return i;
    }
}

/// True when the qualified name ending just before `end` lives in a catalog schema.
fn is_system_schema(tokens: &[&Token], end: usize) -> bool {
    // tokens[end - 3] is the schema word of `schema . table`.
    end >= 3
        && matches!(tokens[end - 3], Token::Word(w)
            if w.value.eq_ignore_ascii_case("information_schema") || w.value.eq_ignore_ascii_case("pg_catalog"))
}

/// Tables read by `sql` that exist neither in `snapshot` nor as CTEs of the query.
pub fn unknown_tables(sql: &str, snapshot: &SchemaSnapshot, dialect: SqlDialect) -> Vec<String> {
    let refs = referenced_tables(sql, dialect);
    let ctes: HashSet<String> = refs.ctes.iter().map(|c| c.to_lowercase()).collect();
    refs.tables
        .into_iter()
        .filter(|t| !ctes.contains(&t.to_lowercase()))
        .filter(|t| !t.to_lowercase().starts_with("sqlite_"))
        .filter(|t| snapshot.table(t).is_none())
        .collect()
}
