//! FTS5 match-expression builder.
//!
//! # Responsibility
//! - Escape plain query text into an AND of quoted terms.
//! - Parse boolean-mode text (`AND`/`OR`/`NOT`, `+term`, `-term`, quoted
//!   phrases) into a valid FTS5 expression.
//!
//! # Invariants
//! - Every user term reaches FTS5 quoted; user text never injects FTS5
//!   syntax of its own.
//! - Dangling or doubled operators are rejected before SQLite sees them.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug)]
pub enum SearchError {
    /// Query text cannot be turned into a valid FTS5 expression.
    InvalidQuery { query: String, message: String },
    Db(DbError),
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidQuery { query, message } => {
                write!(f, "invalid full-text query `{query}`: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SearchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidQuery { .. } => None,
            Self::Db(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(String),
}

/// Builds an FTS5 expression; `None` for blank text.
pub fn build_match_expression(text: &str, boolean: bool) -> SearchResult<Option<String>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if !boolean {
        let terms: Vec<String> = text.split_whitespace().map(escape_fts_term).collect();
        return Ok(Some(terms.join(" AND ")));
    }
    boolean_expression(text)
}

/// Joins several expressions into one disjunction.
pub fn combine_any(expressions: &[String]) -> Option<String> {
    match expressions {
        [] => None,
        [single] => Some(single.clone()),
        many => Some(
            many.iter()
                .map(|expr| format!("({expr})"))
                .collect::<Vec<_>>()
                .join(" OR "),
        ),
    }
}

fn boolean_expression(text: &str) -> SearchResult<Option<String>> {
    let invalid = |message: &str| SearchError::InvalidQuery {
        query: text.to_string(),
        message: message.to_string(),
    };

    let mut parts: Vec<String> = Vec::new();
    let mut pending: Option<&'static str> = None;

    for token in tokenize(text).map_err(|message| invalid(message))? {
        let (operator, term) = match &token {
            Token::Word(word) => match word.to_ascii_uppercase().as_str() {
                "AND" => (Some("AND"), None),
                "OR" => (Some("OR"), None),
                "NOT" => (Some("NOT"), None),
                _ => match word.strip_prefix('+') {
                    Some(rest) => (None, Some(("AND", rest))),
                    None => match word.strip_prefix('-') {
                        Some(rest) => (None, Some(("NOT", rest))),
                        None => (None, Some(("", word.as_str()))),
                    },
                },
            },
            Token::Phrase(phrase) => (None, Some(("", phrase.as_str()))),
        };

        if let Some(operator) = operator {
            if parts.is_empty() {
                return Err(invalid(&format!("`{operator}` needs a term on its left")));
            }
            pending = match (pending, operator) {
                (None, op) => Some(op),
                (Some("AND"), "NOT") => Some("NOT"),
                (Some(previous), op) => {
                    return Err(invalid(&format!("`{previous}` followed by `{op}`")));
                }
            };
            continue;
        }

        let Some((prefix, term)) = term else {
            continue;
        };
        if term.is_empty() {
            return Err(invalid("empty term"));
        }
        if !parts.is_empty() {
            let joiner = match (pending.take(), prefix) {
                (Some(op), "") => op,
                (Some(_), prefix_op) | (None, prefix_op) if !prefix_op.is_empty() => prefix_op,
                _ => "AND",
            };
            parts.push(joiner.to_string());
        } else if prefix == "NOT" {
            return Err(invalid("`-term` needs a term on its left"));
        }
        parts.push(escape_fts_term(term));
    }

    if let Some(operator) = pending {
        return Err(invalid(&format!("dangling `{operator}`")));
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join(" ")))
}

fn tokenize(text: &str) -> Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut phrase = String::new();
            let mut closed = false;
            for next in chars.by_ref() {
                if next == '"' {
                    closed = true;
                    break;
                }
                phrase.push(next);
            }
            if !closed {
                return Err("unterminated phrase");
            }
            tokens.push(Token::Phrase(phrase));
        } else {
            let mut word = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_whitespace() || next == '"' {
                    break;
                }
                word.push(next);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

fn escape_fts_term(raw: &str) -> String {
    let escaped = raw.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// Maps a statement error, classifying FTS5 syntax failures as
/// [`SearchError::InvalidQuery`].
pub fn map_query_error(err: rusqlite::Error, query: &str) -> SearchError {
    if is_match_syntax_error(&err) {
        return SearchError::InvalidQuery {
            query: query.to_string(),
            message: err.to_string(),
        };
    }
    SearchError::Db(DbError::Sqlite(err))
}

fn is_match_syntax_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            let msg = message.to_lowercase();
            (msg.contains("fts5") && msg.contains("syntax"))
                || msg.contains("malformed match expression")
                || msg.contains("unterminated")
        }
        _ => false,
    }
}
