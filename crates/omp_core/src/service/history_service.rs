//! History use-case service.

use crate::repo::done_repo::{DoneRepository, HistoryStatus, MsbHistory, ObservedQuery};
use crate::service::ServiceResult;

pub struct HistoryService<D: DoneRepository> {
    history: D,
}

impl<D: DoneRepository> HistoryService<D> {
    pub fn new(history: D) -> Self {
        Self { history }
    }

    /// Timelines for a project, a checksum or both; at least one is required.
    pub fn history_for(
        &self,
        project_id: Option<&str>,
        checksum: Option<&str>,
    ) -> ServiceResult<Vec<MsbHistory>> {
        fn clean(value: Option<&str>) -> Option<&str> {
            value.map(str::trim).filter(|value| !value.is_empty())
        }
        Ok(self.history.history_for(clean(project_id), clean(checksum))?)
    }

    pub fn history_for_transaction(&self, transaction_id: &str) -> ServiceResult<Option<MsbHistory>> {
        Ok(self.history.history_for_transaction(transaction_id)?)
    }

    pub fn observed(&self, query: &ObservedQuery) -> ServiceResult<Vec<MsbHistory>> {
        Ok(self.history.observed_between(query)?)
    }

    pub fn current_status(&self, project_id: &str, checksum: &str) -> ServiceResult<HistoryStatus> {
        Ok(self.history.current_status(project_id, checksum)?)
    }
}
