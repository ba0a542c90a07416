//! Core domain logic for the Observation Management Project (OMP).
//! This crate is the single source of truth for MSB lifecycle invariants.

pub mod clock;
pub mod config;
pub mod db;
pub mod document;
pub mod logging;
pub mod model;
pub mod payload;
pub mod query;
pub mod repo;
pub mod search;
pub mod service;
pub mod xml;

pub use config::OmpConfig;
pub use logging::{default_log_level, init_from_config, init_logging, logging_status};
pub use model::comment::{Comment, CommentError, MsbStatus};
pub use model::msb::{Msb, MsbError, MsbState};
pub use model::program::{ProgramError, ScienceProgram, TransitionEffect};
pub use model::range::{Range, RangeConflict};
pub use payload::{Payload, PayloadError, ReturnFormat};
pub use query::{MaxResults, MsbQuery, QueryError};
pub use repo::done_repo::{
    DoneRepository, HistoryStatus, MsbHistory, ObservedQuery, SqliteDoneRepository,
};
pub use repo::msb_repo::{
    MsbCount, MsbRepository, MsbStoreSettings, MsbSummary, ProgramVersion, SqliteMsbRepository,
    Transition,
};
pub use repo::project_repo::{Project, ProjectRepository, SqliteProjectRepository};
pub use repo::user_repo::{SqliteUserRepository, User, UserRepository};
pub use repo::{RepoError, RepoResult};
pub use service::history_service::HistoryService;
pub use service::msb_service::{MsbActionRequest, MsbService, QueryOutcome};
pub use service::program_service::{FetchedProgram, ProgramService, StoreOutcome};
pub use service::{ServiceError, ServiceResult};
