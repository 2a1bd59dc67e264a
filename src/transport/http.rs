//! reqwest-backed implementations of the transport traits.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::scheduler::job::{DispatchedJob, JobHistory, JobHistoryDetail, JobSpec};
use crate::scheduler::registry::WorkerNode;
use crate::transport::routes::{self, NODE_URL_HEADER};
use crate::transport::wire::{
    CancelJobResponse, DoneReport, HeartbeatAck, JobFailure, JobProgress, SubmitJobResponse,
};
use crate::transport::{
    ManagerTransport, NodeCancelOutcome, NodeTransport, PushOutcome, StatusUpdate, TransportError,
};

type TransportResult<T> = std::result::Result<T, TransportError>;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ForemanError::Internal(format!("failed to build http client: {}", e)))
}

fn endpoint(base: &str, route: &str, job_id: Option<Uuid>) -> TransportResult<Url> {
    routes::endpoint(base, route, job_id).map_err(|e| TransportError::Endpoint(e.to_string()))
}

fn classify(url: &Url, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_decode() {
        TransportError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        TransportError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

async fn send(url: &Url, request: RequestBuilder) -> TransportResult<Response> {
    request.send().await.map_err(|e| classify(url, e))
}

/// Turn a non-2xx response into [`TransportError::Status`].
async fn require_success(url: &Url, response: Response) -> TransportResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(url: &Url, response: Response) -> TransportResult<T> {
    let response = require_success(url, response).await?;
    response.json::<T>().await.map_err(|e| TransportError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Client the manager uses to reach worker nodes.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: Client,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl NodeTransport for HttpNodeClient {
    async fn push_job(&self, node_url: &str, job: &DispatchedJob) -> TransportResult<PushOutcome> {
        let url = endpoint(node_url, routes::node::JOB, None)?;
        let response = send(&url, self.client.post(url.clone()).json(job)).await?;

        let status = response.status();
        let outcome = match status {
            s if s.is_success() => PushOutcome::Accepted,
            StatusCode::CONFLICT => PushOutcome::Busy,
            StatusCode::BAD_REQUEST => {
                let reason = response.text().await.unwrap_or_default();
                PushOutcome::Rejected(reason)
            }
            other => PushOutcome::Unexpected(other.as_u16()),
        };
        tracing::debug!(node = node_url, job_id = %job.id, status = status.as_u16(), "Job pushed");
        Ok(outcome)
    }

    async fn cancel_job(&self, node_url: &str, job_id: Uuid) -> TransportResult<NodeCancelOutcome> {
        let url = endpoint(node_url, routes::node::JOB_BY_ID, Some(job_id))?;
        let response = send(&url, self.client.delete(url.clone())).await?;

        Ok(match response.status() {
            s if s.is_success() => NodeCancelOutcome::Cancelling,
            StatusCode::NOT_FOUND => NodeCancelOutcome::NotFound,
            StatusCode::CONFLICT => NodeCancelOutcome::AlreadyCancelling,
            other => NodeCancelOutcome::Unexpected(other.as_u16()),
        })
    }
}

/// Client for the manager's HTTP surface, used by node agents and the CLI.
#[derive(Debug, Clone)]
pub struct HttpManagerClient {
    client: Client,
    base: String,
}

impl HttpManagerClient {
    pub fn new(manager_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base: routes::normalize_base_url(manager_url)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, route: &str, job_id: Option<Uuid>) -> TransportResult<Url> {
        endpoint(&self.base, route, job_id)
    }

    pub async fn ping(&self) -> bool {
        let Ok(url) = self.url(routes::manager::PING, None) else {
            return false;
        };
        matches!(self.client.get(url).send().await, Ok(r) if r.status().is_success())
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmitJobResponse> {
        let url = self.url(routes::manager::JOB, None)?;
        let response = send(&url, self.client.post(url.clone()).json(spec)).await?;
        Ok(decode(&url, response).await?)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelJobResponse> {
        let url = self.url(routes::manager::JOB_BY_ID, Some(job_id))?;
        let response = send(&url, self.client.delete(url.clone())).await?;
        Ok(decode(&url, response).await?)
    }

    /// History row for one job; `None` if the manager does not know it.
    pub async fn history(&self, job_id: Uuid) -> Result<Option<JobHistory>> {
        let url = self.url(routes::manager::JOB_BY_ID, Some(job_id))?;
        let response = send(&url, self.client.get(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(decode(&url, response).await?))
    }

    pub async fn history_list(&self) -> Result<Vec<JobHistory>> {
        let url = self.url(routes::manager::JOB, None)?;
        let response = send(&url, self.client.get(url.clone())).await?;
        Ok(decode(&url, response).await?)
    }

    pub async fn details(&self, job_id: Uuid) -> Result<Vec<JobHistoryDetail>> {
        let url = self.url(routes::manager::JOB_DETAIL, Some(job_id))?;
        let response = send(&url, self.client.get(url.clone())).await?;
        Ok(decode(&url, response).await?)
    }

    pub async fn nodes(&self) -> Result<Vec<WorkerNode>> {
        let url = self.url(routes::manager::NODES, None)?;
        let response = send(&url, self.client.get(url.clone())).await?;
        Ok(decode(&url, response).await?)
    }
}

#[async_trait]
impl ManagerTransport for HttpManagerClient {
    async fn node_init(&self, node_url: &str) -> TransportResult<()> {
        let url = self.url(routes::manager::NODE_INIT, None)?;
        let response = send(&url, self.client.post(url.clone()).json(&node_url)).await?;
        require_success(&url, response).await?;
        Ok(())
    }

    async fn heartbeat(&self, node_url: &str) -> TransportResult<HeartbeatAck> {
        let url = self.url(routes::manager::HEARTBEAT, None)?;
        let response = send(&url, self.client.post(url.clone()).json(&node_url)).await?;
        decode(&url, response).await
    }

    async fn report(&self, node_url: &str, update: &StatusUpdate) -> TransportResult<()> {
        let (url, request) = match update {
            StatusUpdate::Done { job_id, result } => {
                let url = self.url(routes::manager::JOB_DONE, Some(*job_id))?;
                let body = DoneReport {
                    result: result.clone(),
                };
                (url.clone(), self.client.post(url).json(&body))
            }
            StatusUpdate::Failed {
                job_id,
                error,
                created,
            } => {
                let url = self.url(routes::manager::JOB_FAILED, None)?;
                let body = JobFailure {
                    job_id: *job_id,
                    error: error.clone(),
                    created: *created,
                };
                (url.clone(), self.client.post(url).json(&body))
            }
            StatusUpdate::Canceled { job_id } => {
                let url = self.url(routes::manager::JOB_CANCELED, Some(*job_id))?;
                (url.clone(), self.client.get(url))
            }
            StatusUpdate::Progress {
                job_id,
                text,
                created,
            } => {
                let url = self.url(routes::manager::JOB_PROGRESS, None)?;
                let body = JobProgress {
                    job_id: *job_id,
                    text: text.clone(),
                    created: *created,
                };
                (url.clone(), self.client.post(url).json(&body))
            }
        };

        let response = send(&url, request.header(NODE_URL_HEADER, node_url)).await?;
        require_success(&url, response).await?;
        Ok(())
    }
}
