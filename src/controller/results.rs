//! Batch iteration result assembly
//!
//! One output entry per requested pair, in request order. Failures are
//! carried per entry as `IterationOutcome::Error`; nothing in a batch aborts
//! the other entries.

use crate::controller::metrics_reader::{MetricsError, MetricsReader};
use crate::controller::repository::ExperimentRepository;
use crate::model::{
    Experiment, Iteration, IterationData, IterationOutcome, IterationRef, IterationResult,
    ResultError, VariantCounts, VariantResult,
};
use crate::server::metrics::SharedMetrics;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ResultsAggregator {
    repository: Arc<dyn ExperimentRepository>,
    reader: Arc<dyn MetricsReader>,
    fetch_timeout: Duration,
    metrics: Option<SharedMetrics>,
}

impl ResultsAggregator {
    pub fn new(
        repository: Arc<dyn ExperimentRepository>,
        reader: Arc<dyn MetricsReader>,
        fetch_timeout: Duration,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            repository,
            reader,
            fetch_timeout,
            metrics,
        }
    }

    /// Results for every pair, positionally matching `pairs`
    ///
    /// Entries are resolved concurrently; `join_all` keeps input order.
    pub async fn get_iteration_results(
        &self,
        env_id: Uuid,
        pairs: &[IterationRef],
    ) -> Vec<IterationResult> {
        let results = join_all(pairs.iter().map(|pair| self.resolve(env_id, *pair))).await;

        debug!(
            env_id = %env_id,
            requested = pairs.len(),
            "Assembled iteration results"
        );
        results
    }

    async fn resolve(&self, env_id: Uuid, pair: IterationRef) -> IterationResult {
        let outcome = match self.lookup(env_id, pair).await {
            Ok((experiment, iteration)) => self.fetch_outcome(&experiment, &iteration).await,
            Err(err) => IterationOutcome::Error(err),
        };

        let label = outcome_label(&outcome);
        if let IterationOutcome::Error(err) = &outcome {
            warn!(
                env_id = %env_id,
                experiment_id = %pair.experiment_id,
                iteration_id = %pair.iteration_id,
                kind = label,
                error = %err.message,
                "Iteration result entry failed"
            );
        }
        if let Some(ref metrics) = self.metrics {
            metrics.record_iteration_result(label);
        }

        IterationResult {
            experiment_id: pair.experiment_id,
            iteration_id: pair.iteration_id,
            outcome,
        }
    }

    /// Resolve the pair, rejecting any id outside `env_id` or the named experiment
    async fn lookup(
        &self,
        env_id: Uuid,
        pair: IterationRef,
    ) -> Result<(Experiment, Iteration), ResultError> {
        let experiment = self
            .repository
            .get(env_id, pair.experiment_id)
            .await
            .map_err(|e| ResultError::unavailable(e.to_string()))?
            .ok_or_else(|| {
                ResultError::not_found(format!(
                    "experiment {} in environment {}",
                    pair.experiment_id, env_id
                ))
            })?;

        let iteration = self
            .repository
            .get_iteration(pair.iteration_id)
            .await
            .map_err(|e| ResultError::unavailable(e.to_string()))?
            .filter(|it| it.experiment_id == experiment.id)
            .ok_or_else(|| {
                ResultError::not_found(format!(
                    "iteration {} of experiment {}",
                    pair.iteration_id, pair.experiment_id
                ))
            })?;

        Ok((experiment, iteration))
    }

    async fn fetch_outcome(&self, experiment: &Experiment, iteration: &Iteration) -> IterationOutcome {
        let fetched =
            match tokio::time::timeout(self.fetch_timeout, self.reader.fetch_counts(iteration.id))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(MetricsError::Timeout(self.fetch_timeout)),
            };

        match fetched {
            Ok(counts) if counts.is_empty() => IterationOutcome::NoData,
            Ok(counts) => IterationOutcome::Data(assemble(
                iteration,
                counts,
                experiment.baseline_variant.as_deref(),
            )),
            Err(err) => IterationOutcome::Error(ResultError::unavailable(err.to_string())),
        }
    }
}

/// Fold raw counts into report rows
///
/// Repeated variant keys are summed. Rows are sorted by variant key.
fn assemble(iteration: &Iteration, counts: Vec<VariantCounts>, baseline: Option<&str>) -> IterationData {
    let mut by_variant: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for c in counts {
        let entry = by_variant.entry(c.variant).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(c.exposures);
        entry.1 = entry.1.saturating_add(c.conversions);
    }

    let variants: Vec<VariantResult> = by_variant
        .into_iter()
        .map(|(variant, (exposures, conversions))| VariantResult {
            is_baseline: baseline == Some(variant.as_str()),
            conversion_rate: conversion_rate(exposures, conversions),
            variant,
            exposures,
            conversions,
        })
        .collect();

    IterationData {
        started_at: iteration.started_at,
        stopped_at: iteration.stopped_at,
        is_finished: iteration.stopped_at.is_some(),
        total_exposures: variants.iter().fold(0u64, |acc, v| acc.saturating_add(v.exposures)),
        total_conversions: variants.iter().fold(0u64, |acc, v| acc.saturating_add(v.conversions)),
        variants,
    }
}

fn conversion_rate(exposures: u64, conversions: u64) -> f64 {
    if exposures == 0 {
        0.0
    } else {
        conversions as f64 / exposures as f64
    }
}

fn outcome_label(outcome: &IterationOutcome) -> &'static str {
    use crate::model::ResultErrorKind;

    match outcome {
        IterationOutcome::Data(_) => "data",
        IterationOutcome::NoData => "no_data",
        IterationOutcome::Error(err) => match err.kind {
            ResultErrorKind::NotFound => "not_found",
            ResultErrorKind::Unavailable => "unavailable",
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "results_test.rs"]
mod tests;
