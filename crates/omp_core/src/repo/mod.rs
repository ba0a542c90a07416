//! Repository contracts and SQLite implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access traits.
//! - Keep SQL inside the persistence boundary.
//!
//! # Invariants
//! - Repositories are constructed with `try_new`, which rejects connections
//!   that are not migrated to the latest schema.
//! - Missing MSBs surface as [`MsbError::NotFound`] through
//!   [`RepoError::Msb`], distinct from storage failures.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::comment::CommentError;
use crate::model::msb::MsbError;
use crate::model::program::ProgramError;
use crate::payload::PayloadError;
use crate::query::QueryError;
use crate::search::fts::SearchError;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod done_repo;
pub mod msb_repo;
pub mod project_repo;
pub mod user_repo;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    Program(ProgramError),
    Msb(MsbError),
    Query(QueryError),
    Search(SearchError),
    Payload(PayloadError),
    Comment(CommentError),
    ProjectNotFound(String),
    ProgramNotFound(String),
    ProjectExists(String),
    UserExists(String),
    /// Optimistic version check failed on program store.
    VersionConflict {
        project_id: String,
        expected: Option<i64>,
        actual: i64,
    },
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
}

impl RepoError {
    /// Whether this is the non-fatal "MSB not found" condition.
    pub fn is_msb_not_found(&self) -> bool {
        matches!(self, Self::Msb(MsbError::NotFound { .. }))
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Program(err) => write!(f, "{err}"),
            Self::Msb(err) => write!(f, "{err}"),
            Self::Query(err) => write!(f, "{err}"),
            Self::Search(err) => write!(f, "{err}"),
            Self::Payload(err) => write!(f, "{err}"),
            Self::Comment(err) => write!(f, "{err}"),
            Self::ProjectNotFound(id) => write!(f, "project not found: {id}"),
            Self::ProgramNotFound(id) => write!(f, "no science program stored for project {id}"),
            Self::ProjectExists(id) => write!(f, "project already exists: {id}"),
            Self::UserExists(id) => write!(f, "user already exists: {id}"),
            Self::VersionConflict {
                project_id,
                expected,
                actual,
            } => match expected {
                Some(expected) => write!(
                    f,
                    "science program for {project_id} changed since version {expected} (now {actual})"
                ),
                None => write!(
                    f,
                    "science program for {project_id} already exists at version {actual}"
                ),
            },
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "repository requires table `{table}`"),
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Program(err) => Some(err),
            Self::Msb(err) => Some(err),
            Self::Query(err) => Some(err),
            Self::Search(err) => Some(err),
            Self::Payload(err) => Some(err),
            Self::Comment(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ProgramError> for RepoError {
    fn from(value: ProgramError) -> Self {
        Self::Program(value)
    }
}

impl From<MsbError> for RepoError {
    fn from(value: MsbError) -> Self {
        Self::Msb(value)
    }
}

impl From<QueryError> for RepoError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

impl From<SearchError> for RepoError {
    fn from(value: SearchError) -> Self {
        match value {
            SearchError::Db(err) => Self::Db(err),
            other => Self::Search(other),
        }
    }
}

impl From<PayloadError> for RepoError {
    fn from(value: PayloadError) -> Self {
        Self::Payload(value)
    }
}

impl From<CommentError> for RepoError {
    fn from(value: CommentError) -> Self {
        Self::Comment(value)
    }
}

/// Rejects connections not at the latest schema or missing `columns`.
pub(crate) fn ensure_connection_ready(
    conn: &Connection,
    table: &'static str,
    columns: &[&'static str],
) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, table)? {
        return Err(RepoError::MissingRequiredTable(table));
    }
    for &column in columns {
        if !table_has_column(conn, table, column)? {
            return Err(RepoError::MissingRequiredColumn { table, column });
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type IN ('table', 'view') AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn int_to_bool(value: i64, column: &str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}

/// Canonical project id form (trimmed, upper-case).
pub fn normalize_project_id(project_id: &str) -> String {
    project_id.trim().to_uppercase()
}
