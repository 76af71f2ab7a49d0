use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of an Experiment
///
/// Ordering follows the lifecycle, so maps keyed by status iterate
/// Draft → Running → Stopped → Archived.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
    JsonSchema,
)]
pub enum ExperimentStatus {
    /// Created, no iteration ever started
    #[default]
    Draft,
    /// Exactly one iteration is active
    Running,
    /// Has stopped iterations and none active
    Stopped,
    /// Terminal; all iterations archived
    Archived,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 4] = [
        ExperimentStatus::Draft,
        ExperimentStatus::Running,
        ExperimentStatus::Stopped,
        ExperimentStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "Draft",
            ExperimentStatus::Running => "Running",
            ExperimentStatus::Stopped => "Stopped",
            ExperimentStatus::Archived => "Archived",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single Iteration
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum IterationStatus {
    /// Measurement window is open
    Active,
    /// Measurement window closed, `stoppedAt` set
    Stopped,
    /// Retired together with the rest of the experiment's iterations
    Archived,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Active => "Active",
            IterationStatus::Stopped => "Stopped",
            IterationStatus::Archived => "Archived",
        }
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An A/B test bound to one feature flag within an environment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Experiment {
    pub id: Uuid,

    /// Owning environment
    #[serde(rename = "envId")]
    pub env_id: Uuid,

    pub name: String,

    /// Flag whose variants this experiment measures
    #[serde(rename = "featureFlagKey")]
    pub feature_flag_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Variant treated as control in result rows
    #[serde(rename = "baselineVariant", skip_serializing_if = "Option::is_none")]
    pub baseline_variant: Option<String>,

    pub status: ExperimentStatus,

    /// Set iff `status == Running`
    #[serde(rename = "currentIterationId")]
    pub current_iteration_id: Option<Uuid>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn is_archived(&self) -> bool {
        self.status == ExperimentStatus::Archived
    }
}

/// One non-overlapping measurement window of an experiment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Iteration {
    pub id: Uuid,

    #[serde(rename = "experimentId")]
    pub experiment_id: Uuid,

    pub status: IterationStatus,

    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,

    /// None while the iteration is active
    #[serde(rename = "stoppedAt")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Iteration {
    pub fn is_active(&self) -> bool {
        self.status == IterationStatus::Active
    }
}

/// Request body for creating an experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CreateExperiment {
    pub name: String,

    #[serde(rename = "featureFlagKey")]
    pub feature_flag_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(
        rename = "baselineVariant",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub baseline_variant: Option<String>,
}

/// Filter for experiment list queries
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentFilter {
    /// Only experiments in this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExperimentStatus>,

    /// Case-insensitive substring of the experiment name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ExperimentFilter {
    pub fn matches(&self, experiment: &Experiment) -> bool {
        if let Some(status) = self.status {
            if experiment.status != status {
                return false;
            }
        }

        match self.name.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => experiment
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}

/// Page selection for list queries (0-based page index)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PageRequest {
    #[serde(rename = "pageIndex", default)]
    pub page_index: u32,

    /// 0 means "use the default page size"
    #[serde(rename = "pageSize", default)]
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page_index: u32, page_size: u32) -> Self {
        Self {
            page_index,
            page_size,
        }
    }

    /// Number of items to skip; saturates instead of overflowing
    pub fn offset(&self) -> usize {
        (self.page_index as usize).saturating_mul(self.page_size as usize)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PagedResult<T> {
    #[serde(rename = "totalCount")]
    pub total_count: u64,
    pub items: Vec<T>,
}

/// One row of the status count view
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub struct ExperimentStatusCount {
    pub status: ExperimentStatus,
    pub count: u64,
}

/// Per-status experiment counts for one environment
///
/// Always holds all four statuses; missing ones are zero.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(transparent)]
pub struct StatusCounts(BTreeMap<ExperimentStatus, u64>);

impl StatusCounts {
    pub fn zeroed() -> Self {
        Self(ExperimentStatus::ALL.iter().map(|s| (*s, 0)).collect())
    }

    pub fn increment(&mut self, status: ExperimentStatus) {
        *self.0.entry(status).or_insert(0) += 1;
    }

    pub fn get(&self, status: ExperimentStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn as_map(&self) -> &BTreeMap<ExperimentStatus, u64> {
        &self.0
    }

    /// Rows in lifecycle order
    pub fn rows(&self) -> Vec<ExperimentStatusCount> {
        ExperimentStatus::ALL
            .iter()
            .map(|status| ExperimentStatusCount {
                status: *status,
                count: self.get(*status),
            })
            .collect()
    }
}

impl Default for StatusCounts {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// One requested `(experimentId, iterationId)` pair in a batch result query
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub struct IterationRef {
    #[serde(rename = "experimentId")]
    pub experiment_id: Uuid,

    #[serde(rename = "iterationId")]
    pub iteration_id: Uuid,
}

impl IterationRef {
    pub fn new(experiment_id: Uuid, iteration_id: Uuid) -> Self {
        Self {
            experiment_id,
            iteration_id,
        }
    }
}

/// Raw per-variant counts as bucketed by the metrics pipeline
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct VariantCounts {
    pub variant: String,
    pub exposures: u64,
    pub conversions: u64,
}

/// Report row for one variant of one iteration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct VariantResult {
    pub variant: String,
    pub exposures: u64,
    pub conversions: u64,

    /// conversions / exposures, 0.0 when nothing was exposed
    #[serde(rename = "conversionRate")]
    pub conversion_rate: f64,

    #[serde(rename = "isBaseline")]
    pub is_baseline: bool,
}

/// Assembled metric data for one iteration window
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct IterationData {
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,

    #[serde(rename = "stoppedAt")]
    pub stopped_at: Option<DateTime<Utc>>,

    /// True once the window has been closed
    #[serde(rename = "isFinished")]
    pub is_finished: bool,

    #[serde(rename = "totalExposures")]
    pub total_exposures: u64,

    #[serde(rename = "totalConversions")]
    pub total_conversions: u64,

    pub variants: Vec<VariantResult>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ResultErrorKind {
    NotFound,
    Unavailable,
}

/// Typed per-entry failure in a batch result query
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ResultError {
    pub kind: ResultErrorKind,
    pub message: String,
}

impl ResultError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ResultErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ResultErrorKind::Unavailable,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "state")]
pub enum IterationOutcome {
    /// Metrics were available for the window
    Data(IterationData),
    /// Iteration is valid but the metrics pipeline has no counts for it
    NoData,
    /// Entry failed; other entries are unaffected
    Error(ResultError),
}

/// Result for one position of a batch result query
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct IterationResult {
    #[serde(rename = "experimentId")]
    pub experiment_id: Uuid,

    #[serde(rename = "iterationId")]
    pub iteration_id: Uuid,

    pub outcome: IterationOutcome,
}

impl IterationResult {
    pub fn data(&self) -> Option<&IterationData> {
        match &self.outcome {
            IterationOutcome::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ResultError> {
        match &self.outcome {
            IterationOutcome::Error(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
