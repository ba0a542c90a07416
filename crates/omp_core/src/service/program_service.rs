//! Science program use-case service.
//!
//! # Responsibility
//! - Authenticate project passwords for program store and fetch.
//! - Decode submitted payloads and encode returned ones.
//!
//! # Invariants
//! - The password is verified before anything is stored.

use crate::model::program::ScienceProgram;
use crate::payload::{decode_submission, encode_response, Payload, ReturnFormat};
use crate::repo::msb_repo::{MsbRepository, ProgramVersion};
use crate::repo::project_repo::{Project, ProjectRepository};
use crate::service::{ServiceError, ServiceResult};

/// Result of a successful store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub project_id: String,
    /// Human-readable program summary.
    pub summary: String,
    pub version: ProgramVersion,
}

/// Program returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedProgram {
    pub project_id: String,
    pub version: ProgramVersion,
    pub payload: Payload,
}

pub struct ProgramService<M, P> {
    msbs: M,
    projects: P,
    compression_threshold_bytes: usize,
}

impl<M: MsbRepository, P: ProjectRepository> ProgramService<M, P> {
    pub fn new(msbs: M, projects: P, compression_threshold_bytes: usize) -> Self {
        Self {
            msbs,
            projects,
            compression_threshold_bytes,
        }
    }

    /// Stores a submitted program.
    ///
    /// # Contract
    /// - Gzip payloads are detected by magic number and inflated.
    /// - A stale `expected_version` fails unless `force` is set.
    pub fn store_program(
        &self,
        payload: &[u8],
        password: &str,
        force: bool,
        expected_version: Option<ProgramVersion>,
    ) -> ServiceResult<StoreOutcome> {
        let xml = decode_submission(payload)?;
        let program = ScienceProgram::parse(&xml).map_err(crate::repo::RepoError::from)?;
        self.authenticate(&program.project_id, password)?;

        let version = self.msbs.store_program(&program, expected_version, force)?;
        Ok(StoreOutcome {
            project_id: program.project_id.clone(),
            summary: program.summary_text(),
            version,
        })
    }

    pub fn fetch_program(
        &self,
        project_id: &str,
        password: &str,
        format: ReturnFormat,
    ) -> ServiceResult<FetchedProgram> {
        self.authenticate(project_id, password)?;
        let stored = self.msbs.fetch_program(project_id)?;
        Ok(FetchedProgram {
            project_id: stored.project_id,
            version: stored.version,
            payload: encode_response(stored.xml, format, self.compression_threshold_bytes)?,
        })
    }

    pub fn add_project(&self, project: &Project, password: &str) -> ServiceResult<()> {
        Ok(self.projects.add_project(project, password)?)
    }

    fn authenticate(&self, project_id: &str, password: &str) -> ServiceResult<()> {
        if self.projects.verify_password(project_id, password)? {
            Ok(())
        } else {
            log::warn!(
                "event=project_auth module=program_service status=error project={}",
                project_id.trim()
            );
            Err(ServiceError::Authentication(project_id.trim().to_uppercase()))
        }
    }
}
