//! Boundary surface called by request handlers
//!
//! Normalizes paging and batch input, then hands off to the lifecycle
//! service (mutations) or the aggregators (reads). No state-machine logic
//! lives here.

use crate::config::{EngineConfig, PagingLimits};
use crate::controller::clock::Clock;
use crate::controller::error::{ExperimentError, Result};
use crate::controller::lifecycle::ExperimentLifecycleService;
use crate::controller::metrics_reader::MetricsReader;
use crate::controller::repository::ExperimentRepository;
use crate::controller::results::ResultsAggregator;
use crate::controller::status::StatusAggregator;
use crate::model::{
    CreateExperiment, Experiment, ExperimentFilter, ExperimentStatusCount, Iteration,
    IterationRef, IterationResult, PageRequest, PagedResult, StatusCounts,
};
use crate::server::metrics::SharedMetrics;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct ExperimentFacade {
    repository: Arc<dyn ExperimentRepository>,
    lifecycle: ExperimentLifecycleService,
    status: StatusAggregator,
    results: ResultsAggregator,
    limits: PagingLimits,
}

impl ExperimentFacade {
    pub fn new(
        repository: Arc<dyn ExperimentRepository>,
        reader: Arc<dyn MetricsReader>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            lifecycle: ExperimentLifecycleService::new(
                repository.clone(),
                clock,
                metrics.clone(),
            ),
            status: StatusAggregator::new(repository.clone()),
            results: ResultsAggregator::new(
                repository.clone(),
                reader,
                config.metrics_timeout,
                metrics,
            ),
            repository,
            limits: config.limits,
        }
    }

    pub fn limits(&self) -> PagingLimits {
        self.limits
    }

    /// Apply the default for 0 and clamp to the max page size
    pub fn normalize_page(&self, page: PageRequest) -> PageRequest {
        let page_size = match page.page_size {
            0 => self.limits.default_page_size,
            n => n.min(self.limits.max_page_size),
        };
        PageRequest::new(page.page_index, page_size)
    }

    pub async fn list_experiments(
        &self,
        env_id: Uuid,
        filter: &ExperimentFilter,
        page: PageRequest,
    ) -> Result<PagedResult<Experiment>> {
        let page = self.normalize_page(page);
        let result = self.repository.list(env_id, filter, page).await?;
        debug!(
            env_id = %env_id,
            page_index = page.page_index,
            page_size = page.page_size,
            total = result.total_count,
            "Listed experiments"
        );
        Ok(result)
    }

    pub async fn create_experiment(
        &self,
        env_id: Uuid,
        request: CreateExperiment,
    ) -> Result<Experiment> {
        self.lifecycle.create_experiment(env_id, request).await
    }

    pub async fn get_experiment(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Experiment> {
        self.lifecycle.get_experiment(env_id, experiment_id).await
    }

    pub async fn list_iterations(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<Vec<Iteration>> {
        self.lifecycle.list_iterations(env_id, experiment_id).await
    }

    pub async fn status_counts(&self, env_id: Uuid) -> Result<StatusCounts> {
        self.status.count_by_status(env_id).await
    }

    /// Status counts as ordered rows
    pub async fn status_count_rows(&self, env_id: Uuid) -> Result<Vec<ExperimentStatusCount>> {
        Ok(self.status.count_by_status(env_id).await?.rows())
    }

    /// One result per pair, same order as `pairs`
    ///
    /// Only an oversized batch fails as a whole; everything else is per entry.
    pub async fn iteration_results(
        &self,
        env_id: Uuid,
        pairs: &[IterationRef],
    ) -> Result<Vec<IterationResult>> {
        if pairs.len() > self.limits.max_batch_size {
            return Err(ExperimentError::Validation(format!(
                "batch of {} pairs exceeds the limit of {}",
                pairs.len(),
                self.limits.max_batch_size
            )));
        }
        Ok(self.results.get_iteration_results(env_id, pairs).await)
    }

    pub async fn start_iteration(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Iteration> {
        self.lifecycle.start_iteration(env_id, experiment_id).await
    }

    pub async fn stop_iteration(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
        iteration_id: Uuid,
    ) -> Result<Iteration> {
        self.lifecycle
            .stop_iteration(env_id, experiment_id, iteration_id)
            .await
    }

    pub async fn archive_experiment_iterations(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<bool> {
        self.lifecycle
            .archive_experiment_iterations(env_id, experiment_id)
            .await
    }

    pub async fn archive_experiment(&self, env_id: Uuid, experiment_id: Uuid) -> Result<bool> {
        self.lifecycle.archive_experiment(env_id, experiment_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "facade_test.rs"]
mod tests;
