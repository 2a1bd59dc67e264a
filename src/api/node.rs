use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::agent::{AgentCancelOutcome, NodeAgent, StartOutcome};
use crate::api::parse_job_id;
use crate::scheduler::job::DispatchedJob;
use crate::transport::routes::node as route;
use crate::transport::wire::SlotStatus;

pub fn router(agent: NodeAgent) -> Router {
    Router::new()
        .route(route::JOB, post(start_job))
        .route(route::JOB_BY_ID, delete(cancel_job))
        .route(route::IS_ALIVE, get(is_alive))
        .route(route::STATUS, get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

/// 200 started, 409 busy, 400 with the reason as plain text otherwise.
async fn start_job(
    State(agent): State<NodeAgent>,
    body: Result<Json<DispatchedJob>, JsonRejection>,
) -> impl IntoResponse {
    let job = match body {
        Ok(Json(job)) => job,
        Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()),
    };
    match agent.start_job(job).await {
        StartOutcome::Started => (StatusCode::OK, String::new()),
        StartOutcome::Busy => (StatusCode::CONFLICT, "Node is busy".to_string()),
        StartOutcome::Invalid(reason) => (StatusCode::BAD_REQUEST, reason),
    }
}

async fn cancel_job(
    State(agent): State<NodeAgent>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match agent.cancel(job_id).await {
        AgentCancelOutcome::Cancelling => StatusCode::OK.into_response(),
        AgentCancelOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        AgentCancelOutcome::AlreadyCancelling => StatusCode::CONFLICT.into_response(),
    }
}

async fn is_alive() -> StatusCode {
    StatusCode::OK
}

async fn status(State(agent): State<NodeAgent>) -> Json<SlotStatus> {
    Json(agent.status().await)
}
