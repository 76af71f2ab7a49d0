use crate::controller::metrics_reader::MetricsError;
use crate::controller::repository::RepositoryError;
use crate::controller::state_machine::TransitionConflict;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the experiment engine
///
/// - `Validation`: malformed or duplicate input, fix the request
/// - `Conflict`: lifecycle precondition failed, re-fetch state before retrying
/// - `NotFound`: unknown id or access outside the environment
/// - `Unavailable`: metrics backend unreachable, retry with backoff
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(#[from] TransitionConflict),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ExperimentError {
    pub fn experiment_not_found(env_id: Uuid, experiment_id: Uuid) -> Self {
        ExperimentError::NotFound(format!(
            "experiment {} in environment {}",
            experiment_id, env_id
        ))
    }

    /// Active iteration reported with a conflict, for caller reconciliation
    pub fn active_iteration_id(&self) -> Option<Uuid> {
        match self {
            ExperimentError::Conflict(conflict) => conflict.active_iteration_id(),
            _ => None,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExperimentError::Validation(_) => "validation",
            ExperimentError::Conflict(_) => "conflict",
            ExperimentError::NotFound(_) => "not_found",
            ExperimentError::Unavailable(_) => "unavailable",
            ExperimentError::Repository(_) => "repository",
        }
    }
}

impl From<MetricsError> for ExperimentError {
    fn from(err: MetricsError) -> Self {
        ExperimentError::Unavailable(err.to_string())
    }
}

pub type Result<T, E = ExperimentError> = std::result::Result<T, E>;
