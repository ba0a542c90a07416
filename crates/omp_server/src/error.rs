//! Caller-facing error taxonomy.
//!
//! # Invariants
//! - This is the only place core errors become [`ErrorKind`]s.
//! - Anything not explicitly classified is [`ErrorKind::StorageFatal`].

use omp_core::db::{is_busy, DbError};
use omp_core::model::msb::MsbError;
use omp_core::payload::PayloadError;
use omp_core::search::fts::SearchError;
use omp_core::{RepoError, ServiceError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ApiResult<T> = Result<T, OmpError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// MSB, program or project absent.
    NotFound,
    /// Stale program version, held write lock or duplicate registration.
    ConcurrencyConflict,
    /// Bad project password or unknown user id.
    Authentication,
    /// Query or program document could not be parsed.
    MalformedQuery,
    /// Transition not allowed from the MSB's current state.
    InvalidTransition,
    StorageFatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::Authentication => "authentication",
            Self::MalformedQuery => "malformed_query",
            Self::InvalidTransition => "invalid_transition",
            Self::StorageFatal => "storage_fatal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OmpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for OmpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for OmpError {}

impl From<ServiceError> for OmpError {
    fn from(value: ServiceError) -> Self {
        let kind = match &value {
            ServiceError::Authentication(_) | ServiceError::UnknownUser(_) => {
                ErrorKind::Authentication
            }
            ServiceError::Repo(err) => repo_kind(err),
            ServiceError::Comment(_) => ErrorKind::MalformedQuery,
            ServiceError::Payload(err) => payload_kind(err),
            ServiceError::Xml(_) => ErrorKind::StorageFatal,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<RepoError> for OmpError {
    fn from(value: RepoError) -> Self {
        Self::new(repo_kind(&value), value.to_string())
    }
}

impl From<DbError> for OmpError {
    fn from(value: DbError) -> Self {
        Self::new(db_kind(&value), value.to_string())
    }
}

fn repo_kind(err: &RepoError) -> ErrorKind {
    match err {
        RepoError::Msb(MsbError::NotFound { .. })
        | RepoError::ProjectNotFound(_)
        | RepoError::ProgramNotFound(_) => ErrorKind::NotFound,
        RepoError::Msb(_) => ErrorKind::InvalidTransition,
        RepoError::VersionConflict { .. }
        | RepoError::ProjectExists(_)
        | RepoError::UserExists(_) => ErrorKind::ConcurrencyConflict,
        RepoError::Query(_) | RepoError::Program(_) | RepoError::Comment(_) => {
            ErrorKind::MalformedQuery
        }
        RepoError::Search(SearchError::InvalidQuery { .. }) => ErrorKind::MalformedQuery,
        RepoError::Search(SearchError::Db(err)) | RepoError::Db(err) => db_kind(err),
        RepoError::Payload(err) => payload_kind(err),
        _ => ErrorKind::StorageFatal,
    }
}

fn db_kind(err: &DbError) -> ErrorKind {
    match err {
        DbError::Sqlite(err) if is_busy(err) => ErrorKind::ConcurrencyConflict,
        _ => ErrorKind::StorageFatal,
    }
}

fn payload_kind(err: &PayloadError) -> ErrorKind {
    match err {
        PayloadError::Decompression(_) | PayloadError::NotUtf8(_) => ErrorKind::MalformedQuery,
        PayloadError::Compression(_) => ErrorKind::StorageFatal,
    }
}
