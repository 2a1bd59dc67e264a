use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store rejected write: {0}")]
    Store(String),

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Claim on job {0} was lost before assignment was recorded")]
    ClaimLost(Uuid),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    #[error("No handler registered for payload type '{0}'")]
    UnknownHandler(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
