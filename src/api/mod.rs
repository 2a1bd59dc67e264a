//! HTTP surfaces of the manager and of a node.

pub mod manager;
pub mod node;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ForemanError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// An error answered to an HTTP caller.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ForemanError> for ApiError {
    fn from(err: ForemanError) -> Self {
        let status = match &err {
            ForemanError::Validation(_)
            | ForemanError::Store(_)
            | ForemanError::UnknownHandler(_) => StatusCode::BAD_REQUEST,
            ForemanError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            ForemanError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ForemanError::ClaimLost(_) | ForemanError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ForemanError::Transport(_) => StatusCode::BAD_GATEWAY,
            ForemanError::Io(_) | ForemanError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), error = %self.message, "Request failed");
        } else {
            tracing::debug!(status = self.status.as_u16(), error = %self.message, "Request refused");
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Parse a job id path segment. The nil id is never valid.
pub fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    match Uuid::parse_str(raw) {
        Ok(id) if !id.is_nil() => Ok(id),
        Ok(_) => Err(ApiError::bad_request("Invalid job id value.")),
        Err(e) => Err(ApiError::bad_request(format!("Invalid job id '{}': {}", raw, e))),
    }
}

/// Serve `router` on `listener` until `token` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    tracing::info!(addr = %addr, "HTTP server stopped");
    Ok(())
}
