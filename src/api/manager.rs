use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{parse_job_id, ApiError};
use crate::error::ForemanError;
use crate::scheduler::job::{JobHistory, JobHistoryDetail, JobSpec};
use crate::scheduler::manager::JobManager;
use crate::scheduler::registry::WorkerNode;
use crate::transport::routes::{manager as route, NODE_URL_HEADER};
use crate::transport::wire::{
    CancelJobResponse, DoneReport, HeartbeatAck, JobFailure, JobProgress, NodeInitResponse,
    StatusResponse, SubmitJobResponse,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(manager: Arc<JobManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(route::JOB, post(submit_job).get(list_jobs))
        .route(route::JOB_BY_ID, get(job_history).delete(cancel_job))
        .route(route::JOB_DETAIL, get(job_details))
        .route(route::NODE_INIT, post(node_init))
        .route(route::HEARTBEAT, post(heartbeat))
        .route(route::JOB_DONE, post(job_done))
        .route(route::JOB_FAILED, post(job_failed))
        .route(route::JOB_PROGRESS, post(job_progress))
        .route(route::JOB_CANCELED, get(job_canceled))
        .route(route::NODES, get(list_nodes))
        .route(route::NODES_SLASH, get(list_nodes))
        .route(route::PING, get(ping))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(manager)
}

fn reporter(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(NODE_URL_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

async fn submit_job(
    State(manager): State<Arc<JobManager>>,
    body: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResult<SubmitJobResponse> {
    let spec = json_body(body)?;
    let job_id = manager.submit(spec).await?;
    Ok(Json(SubmitJobResponse { job_id }))
}

async fn list_jobs(State(manager): State<Arc<JobManager>>) -> Json<Vec<JobHistory>> {
    Json(manager.history_list().await)
}

async fn cancel_job(
    State(manager): State<Arc<JobManager>>,
    Path(job_id): Path<String>,
) -> ApiResult<CancelJobResponse> {
    let job_id = parse_job_id(&job_id)?;
    let outcome = manager.cancel(job_id).await;
    Ok(Json(CancelJobResponse { outcome }))
}

async fn job_history(
    State(manager): State<Arc<JobManager>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobHistory> {
    let job_id = parse_job_id(&job_id)?;
    manager
        .history(job_id)
        .await
        .map(Json)
        .ok_or_else(|| ForemanError::JobNotFound(job_id).into())
}

async fn job_details(
    State(manager): State<Arc<JobManager>>,
    Path(job_id): Path<String>,
) -> ApiResult<Vec<JobHistoryDetail>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(manager.details(job_id).await))
}

async fn node_init(
    State(manager): State<Arc<JobManager>>,
    body: Result<Json<String>, JsonRejection>,
) -> ApiResult<NodeInitResponse> {
    let url = json_body(body)?;
    let node_id = manager.node_initialized(&url).await?;
    Ok(Json(NodeInitResponse { node_id }))
}

async fn heartbeat(
    State(manager): State<Arc<JobManager>>,
    body: Result<Json<String>, JsonRejection>,
) -> ApiResult<HeartbeatAck> {
    let url = json_body(body)?;
    let registered = manager.heartbeat(&url).await;
    Ok(Json(HeartbeatAck { registered }))
}

async fn job_done(
    State(manager): State<Arc<JobManager>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusResponse> {
    let job_id = parse_job_id(&job_id)?;
    let report = if body.iter().all(u8::is_ascii_whitespace) {
        DoneReport::default()
    } else {
        serde_json::from_slice::<DoneReport>(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid done report: {}", e)))?
    };
    let outcome = manager
        .job_done(job_id, report.result.as_deref(), reporter(&headers))
        .await?;
    Ok(Json(StatusResponse { outcome }))
}

async fn job_failed(
    State(manager): State<Arc<JobManager>>,
    headers: HeaderMap,
    body: Result<Json<JobFailure>, JsonRejection>,
) -> ApiResult<StatusResponse> {
    let failure = json_body(body)?;
    if failure.job_id.is_nil() {
        return Err(ApiError::bad_request("Invalid job id value."));
    }
    let outcome = manager
        .job_failed(failure.job_id, &failure.error, reporter(&headers))
        .await?;
    Ok(Json(StatusResponse { outcome }))
}

async fn job_progress(
    State(manager): State<Arc<JobManager>>,
    body: Result<Json<JobProgress>, JsonRejection>,
) -> ApiResult<StatusResponse> {
    let progress = json_body(body)?;
    if progress.job_id.is_nil() {
        return Err(ApiError::bad_request("Invalid job id value."));
    }
    let outcome = manager.progress(progress.job_id, &progress.text).await;
    Ok(Json(StatusResponse { outcome }))
}

async fn job_canceled(
    State(manager): State<Arc<JobManager>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusResponse> {
    let job_id = parse_job_id(&job_id)?;
    let outcome = manager.job_canceled(job_id, reporter(&headers)).await?;
    Ok(Json(StatusResponse { outcome }))
}

async fn list_nodes(State(manager): State<Arc<JobManager>>) -> Json<Vec<WorkerNode>> {
    Json(manager.nodes().await)
}

async fn ping() -> &'static str {
    "pong"
}
