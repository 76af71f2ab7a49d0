//! Experiment API under `/api/envs/{envId}/experiments`
//!
//! Every response, success or failure, is wrapped in `ApiResponse`:
//! `{ "success": bool, "errors": [..], "data": .. }`.

use crate::controller::{ExperimentError, ExperimentFacade};
use crate::model::{
    CreateExperiment, Experiment, ExperimentFilter, ExperimentStatus, ExperimentStatusCount,
    Iteration, IterationRef, IterationResult, PageRequest, PagedResult,
};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub errors: Vec<String>,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            errors: vec![],
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![message.into()],
            data: None,
        }
    }
}

/// Extra detail returned with a 409 so callers can reconcile
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ConflictDetail {
    #[serde(rename = "activeIterationId")]
    pub active_iteration_id: Uuid,
}

/// Query string of the list endpoint
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ListExperimentsQuery {
    #[serde(default)]
    pub status: Option<ExperimentStatus>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "pageIndex", default)]
    pub page_index: u32,

    #[serde(rename = "pageSize", default)]
    pub page_size: u32,
}

impl ListExperimentsQuery {
    fn into_parts(self) -> (ExperimentFilter, PageRequest) {
        (
            ExperimentFilter {
                status: self.status,
                name: self.name,
            },
            PageRequest::new(self.page_index, self.page_size),
        )
    }
}

pub struct ApiError(ExperimentError);

impl From<ExperimentError> for ApiError {
    fn from(err: ExperimentError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn invalid_request(message: impl std::fmt::Display) -> Self {
        ApiError(ExperimentError::Validation(message.to_string()))
    }
}

pub fn status_code(err: &ExperimentError) -> StatusCode {
    match err {
        ExperimentError::Validation(_) => StatusCode::BAD_REQUEST,
        ExperimentError::Conflict(_) => StatusCode::CONFLICT,
        ExperimentError::NotFound(_) => StatusCode::NOT_FOUND,
        ExperimentError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExperimentError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            error!(status = %status, error = %self.0, "Request failed");
        } else {
            warn!(status = %status, error = %self.0, "Request rejected");
        }

        match self.0.active_iteration_id() {
            Some(active_iteration_id) => {
                let body = ApiResponse {
                    success: false,
                    errors: vec![self.0.to_string()],
                    data: Some(ConflictDetail {
                        active_iteration_id,
                    }),
                };
                (status, Json(body)).into_response()
            }
            None => (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response(),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

type Facade = Arc<ExperimentFacade>;

fn extract<T>(value: Result<T, impl std::fmt::Display>) -> Result<T, ApiError> {
    value.map_err(ApiError::invalid_request)
}

async fn list_experiments(
    State(facade): State<Facade>,
    env_id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<ListExperimentsQuery>, QueryRejection>,
) -> ApiResult<PagedResult<Experiment>> {
    let Path(env_id) = extract(env_id)?;
    let Query(query) = extract(query)?;
    let (filter, page) = query.into_parts();

    let result = facade.list_experiments(env_id, &filter, page).await?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn create_experiment(
    State(facade): State<Facade>,
    env_id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<CreateExperiment>, JsonRejection>,
) -> ApiResult<Experiment> {
    let Path(env_id) = extract(env_id)?;
    let Json(request) = extract(body)?;

    let experiment = facade.create_experiment(env_id, request).await?;
    Ok(Json(ApiResponse::ok(experiment)))
}

async fn status_count(
    State(facade): State<Facade>,
    env_id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Vec<ExperimentStatusCount>> {
    let Path(env_id) = extract(env_id)?;

    let rows = facade.status_count_rows(env_id).await?;
    Ok(Json(ApiResponse::ok(rows)))
}

async fn iteration_results(
    State(facade): State<Facade>,
    env_id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<Vec<IterationRef>>, JsonRejection>,
) -> ApiResult<Vec<IterationResult>> {
    let Path(env_id) = extract(env_id)?;
    let Json(pairs) = extract(body)?;

    let results = facade.iteration_results(env_id, &pairs).await?;
    Ok(Json(ApiResponse::ok(results)))
}

async fn get_experiment(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<Experiment> {
    let Path((env_id, experiment_id)) = extract(ids)?;

    let experiment = facade.get_experiment(env_id, experiment_id).await?;
    Ok(Json(ApiResponse::ok(experiment)))
}

async fn archive_experiment(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<bool> {
    let Path((env_id, experiment_id)) = extract(ids)?;

    let archived = facade.archive_experiment(env_id, experiment_id).await?;
    Ok(Json(ApiResponse::ok(archived)))
}

async fn list_iterations(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<Vec<Iteration>> {
    let Path((env_id, experiment_id)) = extract(ids)?;

    let iterations = facade.list_iterations(env_id, experiment_id).await?;
    Ok(Json(ApiResponse::ok(iterations)))
}

async fn start_iteration(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<Iteration> {
    let Path((env_id, experiment_id)) = extract(ids)?;

    let iteration = facade.start_iteration(env_id, experiment_id).await?;
    Ok(Json(ApiResponse::ok(iteration)))
}

async fn archive_iterations(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<bool> {
    let Path((env_id, experiment_id)) = extract(ids)?;

    let archived = facade
        .archive_experiment_iterations(env_id, experiment_id)
        .await?;
    Ok(Json(ApiResponse::ok(archived)))
}

async fn stop_iteration(
    State(facade): State<Facade>,
    ids: Result<Path<(Uuid, Uuid, Uuid)>, PathRejection>,
) -> ApiResult<Iteration> {
    let Path((env_id, experiment_id, iteration_id)) = extract(ids)?;

    let iteration = facade
        .stop_iteration(env_id, experiment_id, iteration_id)
        .await?;
    Ok(Json(ApiResponse::ok(iteration)))
}

/// Routes for the experiment API, ready to merge into the server router
pub fn api_router(facade: Arc<ExperimentFacade>) -> Router {
    Router::new()
        .route(
            "/api/envs/{env_id}/experiments",
            get(list_experiments).post(create_experiment),
        )
        .route(
            "/api/envs/{env_id}/experiments/status-count",
            get(status_count),
        )
        .route(
            "/api/envs/{env_id}/experiments/iteration-results",
            put(iteration_results),
        )
        .route(
            "/api/envs/{env_id}/experiments/{experiment_id}",
            get(get_experiment).delete(archive_experiment),
        )
        .route(
            "/api/envs/{env_id}/experiments/{experiment_id}/iterations",
            get(list_iterations)
                .post(start_iteration)
                .delete(archive_iterations),
        )
        .route(
            "/api/envs/{env_id}/experiments/{experiment_id}/iterations/{iteration_id}",
            put(stop_iteration),
        )
        .with_state(facade)
}
