//! Durable storage seam for experiments and iterations
//!
//! `ExperimentRepository` is the consumed collaborator. `InMemoryRepository`
//! is the in-process implementation used by the server binary and tests:
//! every write (including `commit`) is applied under one write lock, and
//! every read clones out of one read lock, so readers never observe an
//! experiment without its matching iteration update.

use crate::model::{Experiment, ExperimentFilter, Iteration, PageRequest, PagedResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Repository lock poisoned")]
    Poisoned,

    #[error("Experiment {0} does not exist")]
    MissingExperiment(Uuid),

    #[error("Iteration {iteration_id} does not belong to experiment {experiment_id}")]
    ForeignIteration {
        iteration_id: Uuid,
        experiment_id: Uuid,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Storage for experiments, keyed by environment
///
/// Implementations must apply `commit` as one durable unit: either the
/// experiment and all given iterations are written, or none are.
#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    /// Experiment by id, only if it lives in `env_id`
    async fn get(&self, env_id: Uuid, experiment_id: Uuid)
        -> Result<Option<Experiment>, RepositoryError>;

    /// Experiment in `env_id` whose name matches case-insensitively
    async fn find_by_name(
        &self,
        env_id: Uuid,
        name: &str,
    ) -> Result<Option<Experiment>, RepositoryError>;

    /// Filtered page, newest first; `page.page_size` is already normalized
    async fn list(
        &self,
        env_id: Uuid,
        filter: &ExperimentFilter,
        page: PageRequest,
    ) -> Result<PagedResult<Experiment>, RepositoryError>;

    /// Every experiment in `env_id`, read in a single consistent pass
    async fn snapshot(&self, env_id: Uuid) -> Result<Vec<Experiment>, RepositoryError>;

    async fn save(&self, experiment: &Experiment) -> Result<(), RepositoryError>;

    async fn save_iteration(&self, iteration: &Iteration) -> Result<(), RepositoryError>;

    /// Atomically write an experiment together with its changed iterations
    async fn commit(
        &self,
        experiment: &Experiment,
        iterations: &[Iteration],
    ) -> Result<(), RepositoryError>;

    async fn get_iteration(&self, iteration_id: Uuid) -> Result<Option<Iteration>, RepositoryError>;

    /// Iterations of one experiment ordered by `started_at`
    async fn list_iterations(&self, experiment_id: Uuid) -> Result<Vec<Iteration>, RepositoryError>;
}

#[derive(Default)]
struct Store {
    experiments: HashMap<Uuid, Experiment>,
    iterations: HashMap<Uuid, Iteration>,
    iterations_by_experiment: HashMap<Uuid, Vec<Uuid>>,
}

impl Store {
    fn put_iteration(&mut self, iteration: &Iteration) {
        let ids = self
            .iterations_by_experiment
            .entry(iteration.experiment_id)
            .or_default();
        if !ids.contains(&iteration.id) {
            ids.push(iteration.id);
        }
        self.iterations.insert(iteration.id, iteration.clone());
    }

    fn check_iteration(&self, iteration: &Iteration) -> Result<(), RepositoryError> {
        match self.iterations.get(&iteration.id) {
            Some(existing) if existing.experiment_id != iteration.experiment_id => {
                Err(RepositoryError::ForeignIteration {
                    iteration_id: iteration.id,
                    experiment_id: iteration.experiment_id,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Process-local repository
#[derive(Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Store>, RepositoryError> {
        self.store.read().map_err(|_| RepositoryError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Store>, RepositoryError> {
        self.store.write().map_err(|_| RepositoryError::Poisoned)
    }
}

#[async_trait]
impl ExperimentRepository for InMemoryRepository {
    async fn get(
        &self,
        env_id: Uuid,
        experiment_id: Uuid,
    ) -> Result<Option<Experiment>, RepositoryError> {
        let store = self.read()?;
        Ok(store
            .experiments
            .get(&experiment_id)
            .filter(|e| e.env_id == env_id)
            .cloned())
    }

    async fn find_by_name(
        &self,
        env_id: Uuid,
        name: &str,
    ) -> Result<Option<Experiment>, RepositoryError> {
        let wanted = name.trim().to_lowercase();
        let store = self.read()?;
        Ok(store
            .experiments
            .values()
            .find(|e| e.env_id == env_id && e.name.to_lowercase() == wanted)
            .cloned())
    }

    async fn list(
        &self,
        env_id: Uuid,
        filter: &ExperimentFilter,
        page: PageRequest,
    ) -> Result<PagedResult<Experiment>, RepositoryError> {
        let mut matching: Vec<Experiment> = {
            let store = self.read()?;
            store
                .experiments
                .values()
                .filter(|e| e.env_id == env_id && filter.matches(e))
                .cloned()
                .collect()
        };

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total_count = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect();

        Ok(PagedResult { total_count, items })
    }

    async fn snapshot(&self, env_id: Uuid) -> Result<Vec<Experiment>, RepositoryError> {
        let store = self.read()?;
        Ok(store
            .experiments
            .values()
            .filter(|e| e.env_id == env_id)
            .cloned()
            .collect())
    }

    async fn save(&self, experiment: &Experiment) -> Result<(), RepositoryError> {
        let mut store = self.write()?;
        store.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn save_iteration(&self, iteration: &Iteration) -> Result<(), RepositoryError> {
        let mut store = self.write()?;
        if !store.experiments.contains_key(&iteration.experiment_id) {
            return Err(RepositoryError::MissingExperiment(iteration.experiment_id));
        }
        store.check_iteration(iteration)?;
        store.put_iteration(iteration);
        Ok(())
    }

    async fn commit(
        &self,
        experiment: &Experiment,
        iterations: &[Iteration],
    ) -> Result<(), RepositoryError> {
        let mut store = self.write()?;

        // Validate everything before touching the store
        for iteration in iterations {
            if iteration.experiment_id != experiment.id {
                return Err(RepositoryError::ForeignIteration {
                    iteration_id: iteration.id,
                    experiment_id: experiment.id,
                });
            }
            store.check_iteration(iteration)?;
        }

        store.experiments.insert(experiment.id, experiment.clone());
        for iteration in iterations {
            store.put_iteration(iteration);
        }
        Ok(())
    }

    async fn get_iteration(&self, iteration_id: Uuid) -> Result<Option<Iteration>, RepositoryError> {
        let store = self.read()?;
        Ok(store.iterations.get(&iteration_id).cloned())
    }

    async fn list_iterations(&self, experiment_id: Uuid) -> Result<Vec<Iteration>, RepositoryError> {
        let store = self.read()?;
        let mut iterations: Vec<Iteration> = store
            .iterations_by_experiment
            .get(&experiment_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| store.iterations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        iterations.sort_by_key(|i| i.started_at);
        Ok(iterations)
    }
}
