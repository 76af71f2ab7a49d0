//! Experiment and iteration lifecycle orchestration
//!
//! Every mutation of one experiment runs under that experiment's lock and
//! ends in a single `ExperimentRepository::commit`, so a caller that goes
//! away before the commit leaves no trace and one that goes away after it
//! sees the whole change applied.

use crate::controller::clock::Clock;
use crate::controller::error::{ExperimentError, Result};
use crate::controller::locks::KeyedLocks;
use crate::controller::repository::{ExperimentRepository, RepositoryError};
use crate::controller::state_machine::{
    check_archive_experiment, check_experiment_transition, check_start_iteration,
    check_stop_iteration, transition_iteration, TransitionConflict,
};
use crate::model::{
    CreateExperiment, Experiment, ExperimentStatus, Iteration, IterationStatus,
};
use crate::server::metrics::SharedMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_FLAG_KEY_LEN: usize = 128;

pub struct ExperimentLifecycleService {
    repository: Arc<dyn ExperimentRepository>,
    clock: Arc<dyn Clock>,
    experiment_locks: KeyedLocks<Uuid>,
    /// Serializes creates within an environment so name checks can't race
    environment_locks: KeyedLocks<Uuid>,
    metrics: Option<SharedMetrics>,
}

impl ExperimentLifecycleService {
    pub fn new(
        repository: Arc<dyn ExperimentRepository>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            repository,
            clock,
            experiment_locks: KeyedLocks::new(),
            environment_locks: KeyedLocks::new(),
            metrics,
        }
    }

    pub async fn create_experiment(
        &self,
        env_id: Uuid,
        request: CreateExperiment,
    ) -> Result<Experiment> {
        let started = Instant::now();
        let result = self.create_experiment_inner(env_id, request).await;
        self.observe("create_experiment", started, &result);
        result
    }

    async fn create_experiment_inner(
        &self,
        env_id: Uuid,
        request: CreateExperiment,
    ) -> Result<Experiment> {
        let request = normalize_create_request(request)?;

        let _guard = self.environment_locks.acquire(&env_id).await;

        if let Some(existing) = self.repository.find_by_name(env_id, &request.name).await? {
            warn!(
                env_id = %env_id,
                name = %request.name,
                existing_id = %existing.id,
                "Rejected experiment with duplicate name"
            );
            return Err(ExperimentError::Validation(format!(
                "experiment name '{}' already exists in this environment",
                request.name
            )));
        }

        let now = self.clock.now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            env_id,
            name: request.name,
            feature_flag_key: request.feature_flag_key,
            description: request.description,
            baseline_variant: request.baseline_variant,
            status: ExperimentStatus::Draft,
            current_iteration_id: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.save(&experiment).await.map_err(|e| {
            error!(env_id = %env_id, error = %e, "Failed to persist new experiment");
            ExperimentError::from(e)
        })?;

        info!(
            env_id = %env_id,
            experiment_id = %experiment.id,
            feature_flag_key = %experiment.feature_flag_key,
            "Experiment created"
        );
        Ok(experiment)
    }

    /// Open a new measurement window
    ///
    /// Not idempotent: a second call while an iteration is active fails with
    /// a conflict naming the active iteration.
    pub async fn start_iteration(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Iteration> {
        let started = Instant::now();
        let result = self.start_iteration_inner(env_id, experiment_id).await;
        self.observe("start_iteration", started, &result);
        result
    }

    async fn start_iteration_inner(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Iteration> {
        let _guard = self.experiment_locks.acquire(&experiment_id).await;
        let mut experiment = self.load(env_id, experiment_id).await?;

        if let Err(conflict) = check_start_iteration(&experiment) {
            warn!(
                env_id = %env_id,
                experiment_id = %experiment_id,
                reason = %conflict,
                "Rejected start iteration"
            );
            return Err(conflict.into());
        }

        // Windows never overlap, even if the clock stepped backwards
        let previous_end = self
            .repository
            .list_iterations(experiment_id)
            .await?
            .iter()
            .filter_map(|i| i.stopped_at)
            .max();
        let now = self.clock.now();
        let started_at = match previous_end {
            Some(end) if end > now => end,
            _ => now,
        };

        let iteration = Iteration {
            id: Uuid::new_v4(),
            experiment_id,
            status: IterationStatus::Active,
            started_at,
            stopped_at: None,
        };

        experiment.status = ExperimentStatus::Running;
        experiment.current_iteration_id = Some(iteration.id);
        experiment.updated_at = now;

        self.commit(&experiment, std::slice::from_ref(&iteration))
            .await?;

        info!(
            env_id = %env_id,
            experiment_id = %experiment_id,
            iteration_id = %iteration.id,
            "Iteration started"
        );
        Ok(iteration)
    }

    /// Close the current measurement window
    ///
    /// Retrying with the id of the most recent, already stopped iteration
    /// returns it unchanged; any other non-current id is a conflict.
    pub async fn stop_iteration(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
        iteration_id: Uuid,
    ) -> Result<Iteration> {
        let started = Instant::now();
        let result = self
            .stop_iteration_inner(env_id, experiment_id, iteration_id)
            .await;
        self.observe("stop_iteration", started, &result);
        result
    }

    async fn stop_iteration_inner(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
        iteration_id: Uuid,
    ) -> Result<Iteration> {
        let _guard = self.experiment_locks.acquire(&experiment_id).await;
        let mut experiment = self.load(env_id, experiment_id).await?;

        if !experiment.is_archived() && experiment.current_iteration_id != Some(iteration_id) {
            if let Some(stopped) = self.previous_stop(&experiment, iteration_id).await? {
                debug!(
                    experiment_id = %experiment_id,
                    iteration_id = %iteration_id,
                    "Iteration already stopped, returning it unchanged"
                );
                return Ok(stopped);
            }
        }

        if let Err(conflict) = check_stop_iteration(&experiment, iteration_id) {
            warn!(
                env_id = %env_id,
                experiment_id = %experiment_id,
                iteration_id = %iteration_id,
                reason = %conflict,
                "Rejected stop iteration"
            );
            return Err(conflict.into());
        }

        let mut iteration = self.current_iteration(&experiment, iteration_id).await?;
        let now = self.clock.now();
        stop_in_place(&mut experiment, &mut iteration, now)?;
        experiment.updated_at = now;

        self.commit(&experiment, std::slice::from_ref(&iteration))
            .await?;

        info!(
            env_id = %env_id,
            experiment_id = %experiment_id,
            iteration_id = %iteration_id,
            "Iteration stopped"
        );
        Ok(iteration)
    }

    /// Stop the active iteration (if any) and archive every iteration
    ///
    /// Returns `false` without writing when nothing is left to archive.
    pub async fn archive_experiment_iterations(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<bool> {
        let started = Instant::now();
        let result = self
            .archive_experiment_iterations_inner(env_id, experiment_id)
            .await;
        self.observe("archive_experiment_iterations", started, &result);
        result
    }

    async fn archive_experiment_iterations_inner(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<bool> {
        let _guard = self.experiment_locks.acquire(&experiment_id).await;
        let mut experiment = self.load(env_id, experiment_id).await?;
        let iterations = self.repository.list_iterations(experiment_id).await?;
        let now = self.clock.now();

        let changed = archive_all_in_place(&mut experiment, iterations, now)?;
        if changed.is_empty() {
            debug!(
                experiment_id = %experiment_id,
                "No iterations to archive"
            );
            return Ok(false);
        }

        experiment.updated_at = now;
        self.commit(&experiment, &changed).await?;

        info!(
            env_id = %env_id,
            experiment_id = %experiment_id,
            archived = changed.len(),
            "Experiment iterations archived"
        );
        Ok(true)
    }

    /// Archive all iterations and move the experiment to its terminal status
    pub async fn archive_experiment(&self, env_id: Uuid, experiment_id: Uuid) -> Result<bool> {
        let started = Instant::now();
        let result = self.archive_experiment_inner(env_id, experiment_id).await;
        self.observe("archive_experiment", started, &result);
        result
    }

    async fn archive_experiment_inner(&self, env_id: Uuid, experiment_id: Uuid) -> Result<bool> {
        let _guard = self.experiment_locks.acquire(&experiment_id).await;
        let mut experiment = self.load(env_id, experiment_id).await?;

        if let Err(conflict) = check_archive_experiment(&experiment) {
            warn!(
                env_id = %env_id,
                experiment_id = %experiment_id,
                reason = %conflict,
                "Rejected archive experiment"
            );
            return Err(conflict.into());
        }

        let iterations = self.repository.list_iterations(experiment_id).await?;
        let now = self.clock.now();
        let changed = archive_all_in_place(&mut experiment, iterations, now)?;

        check_experiment_transition(experiment.status, ExperimentStatus::Archived)?;
        experiment.status = ExperimentStatus::Archived;
        experiment.current_iteration_id = None;
        experiment.updated_at = now;

        self.commit(&experiment, &changed).await?;

        info!(
            env_id = %env_id,
            experiment_id = %experiment_id,
            archived_iterations = changed.len(),
            "Experiment archived"
        );
        Ok(true)
    }

    pub async fn get_experiment(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Experiment> {
        self.load(env_id, experiment_id).await
    }

    /// Iterations of an experiment in `env_id`, oldest first
    pub async fn list_iterations(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<Vec<Iteration>> {
        self.load(env_id, experiment_id).await?;
        Ok(self.repository.list_iterations(experiment_id).await?)
    }

    async fn load(&self, env_id: Uuid, experiment_id: Uuid) -> Result<Experiment> {
        self.repository
            .get(env_id, experiment_id)
            .await?
            .ok_or_else(|| ExperimentError::experiment_not_found(env_id, experiment_id))
    }

    async fn current_iteration(
        &self,
        experiment: &Experiment,
        iteration_id: Uuid,
    ) -> Result<Iteration> {
        match self.repository.get_iteration(iteration_id).await? {
            Some(iteration) if iteration.experiment_id == experiment.id => Ok(iteration),
            _ => {
                error!(
                    experiment_id = %experiment.id,
                    iteration_id = %iteration_id,
                    "Current iteration missing from repository"
                );
                Err(RepositoryError::Backend(format!(
                    "current iteration {} of experiment {} is missing",
                    iteration_id, experiment.id
                ))
                .into())
            }
        }
    }

    /// The iteration, if it is this experiment's most recent one and already stopped
    async fn previous_stop(
        &self,
        experiment: &Experiment,
        iteration_id: Uuid,
    ) -> Result<Option<Iteration>> {
        if experiment.current_iteration_id.is_some() {
            return Ok(None);
        }
        let latest = self
            .repository
            .list_iterations(experiment.id)
            .await?
            .into_iter()
            .max_by_key(|i| i.started_at);

        Ok(latest.filter(|i| i.id == iteration_id && i.status == IterationStatus::Stopped))
    }

    async fn commit(&self, experiment: &Experiment, iterations: &[Iteration]) -> Result<()> {
        self.repository
            .commit(experiment, iterations)
            .await
            .map_err(|e| {
                error!(
                    experiment_id = %experiment.id,
                    error = %e,
                    "Failed to commit lifecycle change"
                );
                ExperimentError::from(e)
            })
    }

    fn observe<T>(&self, operation: &str, started: Instant, result: &Result<T>) {
        if let Some(ref metrics) = self.metrics {
            let outcome = match result {
                Ok(_) => "success",
                Err(e) => e.kind(),
            };
            metrics.record_operation(operation, outcome, started.elapsed().as_secs_f64());
        }
    }
}

fn normalize_create_request(request: CreateExperiment) -> Result<CreateExperiment> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(ExperimentError::Validation(
            "name cannot be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ExperimentError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }

    let feature_flag_key = request.feature_flag_key.trim().to_string();
    if feature_flag_key.is_empty() {
        return Err(ExperimentError::Validation(
            "featureFlagKey cannot be empty".to_string(),
        ));
    }
    if feature_flag_key.chars().count() > MAX_FLAG_KEY_LEN {
        return Err(ExperimentError::Validation(format!(
            "featureFlagKey must be at most {} characters",
            MAX_FLAG_KEY_LEN
        )));
    }

    Ok(CreateExperiment {
        name,
        feature_flag_key,
        description: non_blank(request.description),
        baseline_variant: non_blank(request.baseline_variant),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Stop `iteration` and clear it from `experiment`
fn stop_in_place(
    experiment: &mut Experiment,
    iteration: &mut Iteration,
    now: DateTime<Utc>,
) -> std::result::Result<(), TransitionConflict> {
    check_experiment_transition(experiment.status, ExperimentStatus::Stopped)?;
    transition_iteration(iteration, IterationStatus::Stopped)?;
    iteration.stopped_at = Some(now.max(iteration.started_at));
    experiment.status = ExperimentStatus::Stopped;
    experiment.current_iteration_id = None;
    Ok(())
}

/// Archive every non-archived iteration, stopping the active one first
///
/// Returns the iterations that changed.
fn archive_all_in_place(
    experiment: &mut Experiment,
    iterations: Vec<Iteration>,
    now: DateTime<Utc>,
) -> std::result::Result<Vec<Iteration>, TransitionConflict> {
    let mut changed = Vec::new();

    for mut iteration in iterations {
        if iteration.status == IterationStatus::Archived {
            continue;
        }
        if iteration.is_active() {
            if experiment.current_iteration_id == Some(iteration.id) {
                stop_in_place(experiment, &mut iteration, now)?;
            } else {
                // Orphaned active iteration; close it without touching the experiment
                transition_iteration(&mut iteration, IterationStatus::Stopped)?;
                iteration.stopped_at = Some(now.max(iteration.started_at));
            }
        }
        transition_iteration(&mut iteration, IterationStatus::Archived)?;
        changed.push(iteration);
    }

    Ok(changed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "lifecycle_test.rs"]
mod tests;
