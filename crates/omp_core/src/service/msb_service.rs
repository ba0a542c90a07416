//! MSB use-case service.
//!
//! # Responsibility
//! - Fetch, query and transition MSBs on behalf of observers.
//! - Record fetches and free-form comments in history.
//!
//! # Invariants
//! - Transitions on a missing MSB are logged no-ops, never errors.
//! - An explicit author must be a registered user.

use crate::model::comment::{Comment, MsbStatus};
use crate::query::{MaxResults, MsbQuery};
use crate::repo::done_repo::{DoneRepository, MsbSnapshot, NewHistoryEntry};
use crate::repo::msb_repo::{
    FetchedMsb, MsbCount, MsbRepository, MsbSummary, Transition, TransitionOutcome,
    TransitionRequest,
};
use crate::repo::user_repo::UserRepository;
use crate::repo::RepoError;
use crate::service::{ServiceError, ServiceResult};

const FETCH_COMMENT: &str = "MSB retrieved from database";

/// Caller input shared by every MSB transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsbActionRequest {
    pub project_id: String,
    pub checksum: String,
    pub author: Option<String>,
    /// History text; a per-action default is used when blank.
    pub reason: Option<String>,
    pub transaction_id: Option<String>,
}

impl MsbActionRequest {
    pub fn new(project_id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            checksum: checksum.into(),
            ..Self::default()
        }
    }

    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn in_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Parsed query plus its ranked matches.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub query: MsbQuery,
    pub summaries: Vec<MsbSummary>,
}

pub struct MsbService<M, D, U> {
    msbs: M,
    history: D,
    users: U,
}

impl<M: MsbRepository, D: DoneRepository, U: UserRepository> MsbService<M, D, U> {
    pub fn new(msbs: M, history: D, users: U) -> Self {
        Self {
            msbs,
            history,
            users,
        }
    }

    /// Fetches one MSB and records the retrieval in history.
    ///
    /// # Contract
    /// - Returns `Ok(None)` when no MSB has this checksum.
    pub fn fetch_msb(
        &self,
        checksum: &str,
        project_id: Option<&str>,
    ) -> ServiceResult<Option<FetchedMsb>> {
        let Some(fetched) = self.msbs.fetch_msb(checksum, project_id)? else {
            log::info!(
                "event=msb_fetch module=msb_service status=not_found checksum={}",
                checksum.trim()
            );
            return Ok(None);
        };
        let comment = Comment::new(FETCH_COMMENT, MsbStatus::Fetched)?;
        self.history.add_history(&NewHistoryEntry::new(
            &fetched.project_id,
            &fetched.msb.checksum,
            &comment,
            MsbSnapshot::of(&fetched.msb),
        ))?;
        Ok(Some(fetched))
    }

    /// Parses and runs a query document.
    ///
    /// # Contract
    /// - `max_count == 0` uses the configured default cap.
    /// - `max_count < 0` is unlimited.
    pub fn query(&self, query_xml: &str, max_count: i64) -> ServiceResult<QueryOutcome> {
        let query = MsbQuery::parse(query_xml).map_err(RepoError::from)?;
        let summaries = self
            .msbs
            .query_msbs(&query, MaxResults::from_count(max_count))?;
        Ok(QueryOutcome { query, summaries })
    }

    /// Applies a transition.
    ///
    /// # Contract
    /// - Returns `Ok(None)` when the MSB does not exist (logged warning).
    /// - Rejects unknown authors with [`ServiceError::UnknownUser`].
    pub fn apply(
        &self,
        transition: Transition,
        request: &MsbActionRequest,
    ) -> ServiceResult<Option<TransitionOutcome>> {
        self.ensure_known_author(request.author.as_deref())?;
        let transition_request = TransitionRequest::new(
            transition,
            request.author.as_deref(),
            request.reason.as_deref(),
            request.transaction_id.as_deref(),
        )?;
        let action = transition_request.transition.status();

        match self.msbs.apply_transition(
            &request.project_id,
            &request.checksum,
            &transition_request,
        ) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) if err.is_msb_not_found() => {
                log::warn!(
                    "event=msb_transition module=msb_service status=not_found action={action} project={} checksum={}",
                    request.project_id.trim(),
                    request.checksum.trim()
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records a free-form comment; returns the history id.
    pub fn comment(&self, request: &MsbActionRequest) -> ServiceResult<i64> {
        self.ensure_known_author(request.author.as_deref())?;
        let text = request.reason.as_deref().unwrap_or_default();
        let comment = Comment::new(text, MsbStatus::Comment)?
            .by(request.author.as_deref())
            .in_transaction(request.transaction_id.as_deref());
        Ok(self
            .history
            .add_comment(&request.project_id, request.checksum.trim(), &comment)?)
    }

    pub fn msb_counts(&self, project_ids: &[String]) -> ServiceResult<Vec<MsbCount>> {
        Ok(self.msbs.msb_counts(project_ids)?)
    }

    fn ensure_known_author(&self, author: Option<&str>) -> ServiceResult<()> {
        let Some(author) = author.map(str::trim).filter(|author| !author.is_empty()) else {
            return Ok(());
        };
        if self.users.user_exists(author)? {
            Ok(())
        } else {
            Err(ServiceError::UnknownUser(author.to_string()))
        }
    }
}
