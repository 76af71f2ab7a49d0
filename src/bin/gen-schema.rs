use kokeilu::model::{
    CreateExperiment, Experiment, ExperimentStatusCount, Iteration, IterationRef,
    IterationResult, PagedResult,
};
use kokeilu::server::api::{ApiResponse, ConflictDetail, ListExperimentsQuery};
use schemars::schema_for;
use serde_json::{json, Value};

fn main() -> anyhow::Result<()> {
    // Use: cargo run --bin gen-schema > schema/experiments.json
    // One JSON Schema per request/response body of the experiment API.
    let schemas: Value = json!({
        "CreateExperiment": schema_for!(CreateExperiment),
        "ListExperimentsQuery": schema_for!(ListExperimentsQuery),
        "IterationResultsRequest": schema_for!(Vec<IterationRef>),
        "ExperimentResponse": schema_for!(ApiResponse<Experiment>),
        "ExperimentPageResponse": schema_for!(ApiResponse<PagedResult<Experiment>>),
        "IterationResponse": schema_for!(ApiResponse<Iteration>),
        "IterationListResponse": schema_for!(ApiResponse<Vec<Iteration>>),
        "StatusCountResponse": schema_for!(ApiResponse<Vec<ExperimentStatusCount>>),
        "IterationResultsResponse": schema_for!(ApiResponse<Vec<IterationResult>>),
        "ArchiveResponse": schema_for!(ApiResponse<bool>),
        "ConflictResponse": schema_for!(ApiResponse<ConflictDetail>),
    });

    let json_output = serde_json::to_string_pretty(&schemas)?;
    println!("{}", json_output);
    Ok(())
}
