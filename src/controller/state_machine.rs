//! Legal transitions for experiments and their iterations
//!
//! Experiment: `Draft --start--> Running --stop--> Stopped --start--> Running`,
//! any non-archived status `--archive--> Archived`. Archived is terminal.
//!
//! Iteration: `(none) --start--> Active --stop--> Stopped --archiveAll--> Archived`.
//!
//! All checks here are pure. The lifecycle service calls them while holding the
//! per-experiment lock and maps violations to `ExperimentError::Conflict`.

use crate::model::{Experiment, ExperimentStatus, Iteration, IterationStatus};
use thiserror::Error;
use uuid::Uuid;

/// A state-machine precondition that did not hold
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionConflict {
    #[error("experiment {experiment_id} already has active iteration {active_iteration_id}")]
    IterationAlreadyActive {
        experiment_id: Uuid,
        active_iteration_id: Uuid,
    },

    #[error("experiment {experiment_id} is archived")]
    ExperimentArchived { experiment_id: Uuid },

    #[error(
        "iteration {requested} is not the current iteration of experiment {experiment_id} (current: {})",
        display_current(.current)
    )]
    IterationNotCurrent {
        experiment_id: Uuid,
        requested: Uuid,
        current: Option<Uuid>,
    },

    #[error("experiment cannot move from {from} to {to}")]
    IllegalExperimentTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("iteration {iteration_id} cannot move from {from} to {to}")]
    IllegalIterationTransition {
        iteration_id: Uuid,
        from: IterationStatus,
        to: IterationStatus,
    },
}

fn display_current(current: &Option<Uuid>) -> String {
    current
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl TransitionConflict {
    /// The iteration that currently blocks the request, if any
    pub fn active_iteration_id(&self) -> Option<Uuid> {
        match self {
            TransitionConflict::IterationAlreadyActive {
                active_iteration_id,
                ..
            } => Some(*active_iteration_id),
            TransitionConflict::IterationNotCurrent { current, .. } => *current,
            _ => None,
        }
    }
}

/// Experiment-level transition table
pub fn experiment_transition_allowed(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    use ExperimentStatus::*;

    matches!(
        (from, to),
        (Draft, Running)
            | (Stopped, Running)
            | (Running, Stopped)
            | (Draft, Archived)
            | (Running, Archived)
            | (Stopped, Archived)
    )
}

/// Iteration-level transition table
pub fn iteration_transition_allowed(from: IterationStatus, to: IterationStatus) -> bool {
    use IterationStatus::*;

    matches!((from, to), (Active, Stopped) | (Stopped, Archived))
}

/// True iff a new iteration may start on this experiment
pub fn can_start_iteration(experiment: &Experiment) -> bool {
    experiment.status != ExperimentStatus::Archived && experiment.current_iteration_id.is_none()
}

/// True iff `iteration_id` is the experiment's current iteration
pub fn can_stop_iteration(experiment: &Experiment, iteration_id: Uuid) -> bool {
    experiment.current_iteration_id == Some(iteration_id)
}

pub fn check_start_iteration(experiment: &Experiment) -> Result<(), TransitionConflict> {
    if experiment.is_archived() {
        return Err(TransitionConflict::ExperimentArchived {
            experiment_id: experiment.id,
        });
    }

    if let Some(active_iteration_id) = experiment.current_iteration_id {
        return Err(TransitionConflict::IterationAlreadyActive {
            experiment_id: experiment.id,
            active_iteration_id,
        });
    }

    check_experiment_transition(experiment.status, ExperimentStatus::Running)
}

pub fn check_stop_iteration(
    experiment: &Experiment,
    iteration_id: Uuid,
) -> Result<(), TransitionConflict> {
    if experiment.is_archived() {
        return Err(TransitionConflict::ExperimentArchived {
            experiment_id: experiment.id,
        });
    }

    if !can_stop_iteration(experiment, iteration_id) {
        return Err(TransitionConflict::IterationNotCurrent {
            experiment_id: experiment.id,
            requested: iteration_id,
            current: experiment.current_iteration_id,
        });
    }

    check_experiment_transition(experiment.status, ExperimentStatus::Stopped)
}

pub fn check_archive_experiment(experiment: &Experiment) -> Result<(), TransitionConflict> {
    if experiment.is_archived() {
        return Err(TransitionConflict::ExperimentArchived {
            experiment_id: experiment.id,
        });
    }
    check_experiment_transition(experiment.status, ExperimentStatus::Archived)
}

pub fn check_experiment_transition(
    from: ExperimentStatus,
    to: ExperimentStatus,
) -> Result<(), TransitionConflict> {
    if experiment_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionConflict::IllegalExperimentTransition { from, to })
    }
}

/// Move an iteration to `to`, validating against the iteration table
pub fn transition_iteration(
    iteration: &mut Iteration,
    to: IterationStatus,
) -> Result<(), TransitionConflict> {
    if !iteration_transition_allowed(iteration.status, to) {
        return Err(TransitionConflict::IllegalIterationTransition {
            iteration_id: iteration.id,
            from: iteration.status,
            to,
        });
    }
    iteration.status = to;
    Ok(())
}

/// Experiment/iteration consistency
///
/// `status == Running` iff `current_iteration_id` is set, and the current
/// iteration (when given) is Active and belongs to the experiment.
pub fn is_consistent(experiment: &Experiment, current: Option<&Iteration>) -> bool {
    let running = experiment.status == ExperimentStatus::Running;
    if running != experiment.current_iteration_id.is_some() {
        return false;
    }

    match (experiment.current_iteration_id, current) {
        (Some(id), Some(iteration)) => {
            iteration.id == id && iteration.experiment_id == experiment.id && iteration.is_active()
        }
        (Some(_), None) => false,
        (None, _) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn experiment(status: ExperimentStatus, current: Option<Uuid>) -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            name: "exp".to_string(),
            feature_flag_key: "flag".to_string(),
            description: None,
            baseline_variant: None,
            status,
            current_iteration_id: current,
            created_at: now,
            updated_at: now,
        }
    }

    fn iteration(experiment_id: Uuid, status: IterationStatus) -> Iteration {
        Iteration {
            id: Uuid::new_v4(),
            experiment_id,
            status,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    #[test]
    fn test_can_start_from_draft_and_stopped() {
        assert!(can_start_iteration(&experiment(ExperimentStatus::Draft, None)));
        assert!(can_start_iteration(&experiment(ExperimentStatus::Stopped, None)));
        assert!(check_start_iteration(&experiment(ExperimentStatus::Stopped, None)).is_ok());
    }

    #[test]
    fn test_cannot_start_while_active() {
        let active = Uuid::new_v4();
        let exp = experiment(ExperimentStatus::Running, Some(active));

        assert!(!can_start_iteration(&exp));
        let err = check_start_iteration(&exp).unwrap_err();
        assert_eq!(err.active_iteration_id(), Some(active));
    }

    #[test]
    fn test_cannot_start_archived() {
        let exp = experiment(ExperimentStatus::Archived, None);
        assert!(!can_start_iteration(&exp));
        assert!(matches!(
            check_start_iteration(&exp),
            Err(TransitionConflict::ExperimentArchived { .. })
        ));
    }

    #[test]
    fn test_stop_requires_current_iteration() {
        let active = Uuid::new_v4();
        let exp = experiment(ExperimentStatus::Running, Some(active));

        assert!(can_stop_iteration(&exp, active));
        assert!(check_stop_iteration(&exp, active).is_ok());

        let other = Uuid::new_v4();
        let err = check_stop_iteration(&exp, other).unwrap_err();
        assert_eq!(
            err,
            TransitionConflict::IterationNotCurrent {
                experiment_id: exp.id,
                requested: other,
                current: Some(active),
            }
        );
    }

    #[test]
    fn test_archived_is_terminal() {
        for to in ExperimentStatus::ALL {
            assert!(!experiment_transition_allowed(ExperimentStatus::Archived, to));
        }
        let exp = experiment(ExperimentStatus::Archived, None);
        assert!(check_archive_experiment(&exp).is_err());
    }

    #[test]
    fn test_iteration_table() {
        assert!(iteration_transition_allowed(
            IterationStatus::Active,
            IterationStatus::Stopped
        ));
        assert!(iteration_transition_allowed(
            IterationStatus::Stopped,
            IterationStatus::Archived
        ));
        assert!(!iteration_transition_allowed(
            IterationStatus::Active,
            IterationStatus::Archived
        ));
        assert!(!iteration_transition_allowed(
            IterationStatus::Archived,
            IterationStatus::Active
        ));
    }

    #[test]
    fn test_transition_iteration_rejects_skip() {
        let mut it = iteration(Uuid::new_v4(), IterationStatus::Active);
        assert!(transition_iteration(&mut it, IterationStatus::Archived).is_err());
        assert_eq!(it.status, IterationStatus::Active);

        transition_iteration(&mut it, IterationStatus::Stopped).unwrap();
        transition_iteration(&mut it, IterationStatus::Archived).unwrap();
        assert_eq!(it.status, IterationStatus::Archived);
    }

    #[test]
    fn test_is_consistent() {
        let mut exp = experiment(ExperimentStatus::Draft, None);
        assert!(is_consistent(&exp, None));

        let it = iteration(exp.id, IterationStatus::Active);
        exp.status = ExperimentStatus::Running;
        assert!(!is_consistent(&exp, None));

        exp.current_iteration_id = Some(it.id);
        assert!(is_consistent(&exp, Some(&it)));

        exp.status = ExperimentStatus::Stopped;
        assert!(!is_consistent(&exp, Some(&it)));
    }
}
