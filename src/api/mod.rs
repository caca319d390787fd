use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::controller::{CancelOutcome, ControllerContext};
use crate::error::HerdError;
use crate::scheduler::JobSpec;

type ApiState = Arc<ControllerContext>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PatchRequest {
    #[serde(default)]
    op: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogResponse {
    job_id: Uuid,
    logs: Vec<String>,
}

/// Error rendered as `{"error": ...}` with a matching status code.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<HerdError> for ApiError {
    fn from(e: HerdError) -> Self {
        let status = match &e {
            HerdError::JobNotFound(_) | HerdError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            HerdError::InvalidJob(_) => StatusCode::BAD_REQUEST,
            HerdError::InvalidTransition { .. } => StatusCode::CONFLICT,
            HerdError::StoreFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid job id {raw:?}")))
}

/// Build the administrative API router, mounted under `/v1`.
pub fn router(ctx: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job).patch(patch_job).delete(delete_job))
        .route("/jobs/:id/log", get(job_log))
        .route("/nodes", get(list_nodes));

    Router::new()
        .nest("/v1", v1)
        .layer(cors)
        .with_state(ctx)
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, ctx: ApiState, shutdown: CancellationToken) {
    let app = router(ctx);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn submit_job(
    State(ctx): State<ApiState>,
    body: Result<Json<JobSpec>, axum::extract::rejection::JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(spec) = body.map_err(|_| ApiError::bad_request("couldn't parse job definition"))?;
    let job = ctx.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(ctx): State<ApiState>,
    query: Result<Query<ListQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::bad_request("limit must be a non-negative integer"))?;
    Ok(Json(ctx.jobs(query.limit).await))
}

async fn get_job(
    State(ctx): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(ctx.job(&id).await?))
}

async fn patch_job(
    State(ctx): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<PatchRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let Json(patch) = body.map_err(|_| ApiError::bad_request("couldn't parse patch definition"))?;
    if patch.op.is_empty() || patch.path.is_empty() || patch.value.is_empty() {
        return Err(ApiError::bad_request("op, path and value are required"));
    }
    // 404 before validating the operation itself
    ctx.job(&id).await?;

    if patch.op != "update" {
        return Err(ApiError(StatusCode::NOT_IMPLEMENTED, format!("op {} not implemented", patch.op)));
    }
    if !matches!(patch.path.as_str(), "status" | "/status") {
        return Err(ApiError::bad_request(format!("invalid path {}", patch.path)));
    }
    if !matches!(patch.value.as_str(), "cancel" | "4") {
        return Err(ApiError::bad_request("invalid value (4 or cancel)"));
    }

    match ctx.cancel_job(&id).await {
        Ok(CancelOutcome::Cancelled) | Ok(CancelOutcome::Requested) => Ok(StatusCode::ACCEPTED),
        // The agent went away between lookup and send.
        Err(HerdError::NodeNotFound(node)) => Err(ApiError(
            StatusCode::CONFLICT,
            format!("node {node} is not connected"),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn delete_job(
    State(ctx): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    ctx.delete_job(&id).await?;
    Ok(StatusCode::OK)
}

async fn job_log(
    State(ctx): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let logs = ctx.job_log(&id).await?;
    Ok(Json(LogResponse { job_id: id, logs }))
}

async fn list_nodes(State(ctx): State<ApiState>) -> impl IntoResponse {
    Json(ctx.nodes().await)
}
