//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Validate callers (project passwords, observer ids) before mutating.
//! - Keep the server facade decoupled from storage details.

use crate::model::comment::CommentError;
use crate::payload::PayloadError;
use crate::repo::RepoError;
use crate::xml::XmlError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod history_service;
pub mod msb_service;
pub mod program_service;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug)]
pub enum ServiceError {
    Repo(RepoError),
    Comment(CommentError),
    Payload(PayloadError),
    Xml(XmlError),
    /// Project password rejected.
    Authentication(String),
    /// Observer id not registered.
    UnknownUser(String),
}

impl ServiceError {
    /// Whether this is the non-fatal "MSB not found" condition.
    pub fn is_msb_not_found(&self) -> bool {
        matches!(self, Self::Repo(err) if err.is_msb_not_found())
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Comment(err) => write!(f, "{err}"),
            Self::Payload(err) => write!(f, "{err}"),
            Self::Xml(err) => write!(f, "{err}"),
            Self::Authentication(project_id) => {
                write!(f, "password does not match for project {project_id}")
            }
            Self::UnknownUser(user_id) => write!(f, "unknown user id `{user_id}`"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Comment(err) => Some(err),
            Self::Payload(err) => Some(err),
            Self::Xml(err) => Some(err),
            Self::Authentication(_) | Self::UnknownUser(_) => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<CommentError> for ServiceError {
    fn from(value: CommentError) -> Self {
        Self::Comment(value)
    }
}

impl From<PayloadError> for ServiceError {
    fn from(value: PayloadError) -> Self {
        Self::Payload(value)
    }
}

impl From<XmlError> for ServiceError {
    fn from(value: XmlError) -> Self {
        Self::Xml(value)
    }
}
