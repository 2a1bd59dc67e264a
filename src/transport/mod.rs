//! Transport gateway between the manager and its worker nodes.
//!
//! The scheduler and agent only see the [`NodeTransport`] and
//! [`ManagerTransport`] traits. The HTTP implementations live in [`http`];
//! tests substitute in-memory fakes.

pub mod http;
pub mod retry;
pub mod routes;
pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::DispatchedJob;

pub use http::{HttpManagerClient, HttpNodeClient};
pub use wire::HeartbeatAck;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not reach {url}: {message}")]
    Connect { url: String, message: String },

    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl TransportError {
    /// Whether repeating the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Connect { .. } => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Decode { .. } | TransportError::Endpoint(_) => false,
        }
    }
}

/// How a node answered a job push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The node is already executing something.
    Busy,
    /// The node cannot process the job at all.
    Rejected(String),
    Unexpected(u16),
}

/// How a node answered a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCancelOutcome {
    Cancelling,
    /// The node is not running that job.
    NotFound,
    AlreadyCancelling,
    Unexpected(u16),
}

/// Manager-to-node calls.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn push_job(
        &self,
        node_url: &str,
        job: &DispatchedJob,
    ) -> Result<PushOutcome, TransportError>;

    async fn cancel_job(
        &self,
        node_url: &str,
        job_id: Uuid,
    ) -> Result<NodeCancelOutcome, TransportError>;
}

/// A job status change reported by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Done {
        job_id: Uuid,
        result: Option<String>,
    },
    Failed {
        job_id: Uuid,
        error: String,
        created: DateTime<Utc>,
    },
    Canceled {
        job_id: Uuid,
    },
    Progress {
        job_id: Uuid,
        text: String,
        created: DateTime<Utc>,
    },
}

impl StatusUpdate {
    pub fn job_id(&self) -> Uuid {
        match self {
            StatusUpdate::Done { job_id, .. }
            | StatusUpdate::Failed { job_id, .. }
            | StatusUpdate::Canceled { job_id }
            | StatusUpdate::Progress { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusUpdate::Done { .. } => "done",
            StatusUpdate::Failed { .. } => "failed",
            StatusUpdate::Canceled { .. } => "canceled",
            StatusUpdate::Progress { .. } => "progress",
        }
    }

    /// Terminal updates end the job on the manager side.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusUpdate::Progress { .. })
    }
}

/// Node-to-manager calls.
#[async_trait]
pub trait ManagerTransport: Send + Sync {
    async fn node_init(&self, node_url: &str) -> Result<(), TransportError>;

    async fn heartbeat(&self, node_url: &str) -> Result<HeartbeatAck, TransportError>;

    async fn report(&self, node_url: &str, update: &StatusUpdate) -> Result<(), TransportError>;
}
