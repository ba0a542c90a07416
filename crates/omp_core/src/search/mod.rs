//! Free-text search support for MSB queries.
//!
//! # Responsibility
//! - Translate query text into SQLite FTS5 match expressions.
//! - Classify FTS5 syntax failures as query errors.

pub mod fts;
