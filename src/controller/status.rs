use crate::controller::error::Result;
use crate::controller::repository::ExperimentRepository;
use crate::model::StatusCounts;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Per-status experiment counts for an environment
///
/// Counts come from one repository snapshot, so an experiment that changes
/// status mid-scan is counted exactly once. Status is taken from the
/// experiment record itself, never re-derived from iterations.
pub struct StatusAggregator {
    repository: Arc<dyn ExperimentRepository>,
}

impl StatusAggregator {
    pub fn new(repository: Arc<dyn ExperimentRepository>) -> Self {
        Self { repository }
    }

    pub async fn count_by_status(&self, env_id: Uuid) -> Result<StatusCounts> {
        let experiments = self.repository.snapshot(env_id).await?;

        let mut counts = StatusCounts::zeroed();
        for experiment in &experiments {
            counts.increment(experiment.status);
        }

        debug!(env_id = %env_id, total = counts.total(), "Counted experiments by status");
        Ok(counts)
    }
}
