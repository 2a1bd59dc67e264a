//! Job handlers, keyed by the payload type tag carried on each job.
//!
//! A node resolves the handler for a job before accepting it, so a job with
//! an unknown tag or an unparseable payload is refused up front and the
//! manager removes it instead of retrying it forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::executor::ShellHandler;
use crate::agent::reporter::ReporterHandle;
use crate::error::{ForemanError, Result};
use crate::scheduler::job::DispatchedJob;
use crate::transport::StatusUpdate;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),

    #[error("canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a running handler can see and do.
pub struct JobContext {
    job: DispatchedJob,
    cancel: CancellationToken,
    reporter: ReporterHandle,
}

impl JobContext {
    pub fn new(job: DispatchedJob, cancel: CancellationToken, reporter: ReporterHandle) -> Self {
        Self {
            job,
            cancel,
            reporter,
        }
    }

    pub fn job(&self) -> &DispatchedJob {
        &self.job
    }

    pub fn payload(&self) -> &str {
        &self.job.serialized
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job has been asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Queue a progress note for the manager.
    pub fn progress(&self, text: impl Into<String>) {
        self.reporter.enqueue(StatusUpdate::Progress {
            job_id: self.job.id,
            text: text.into(),
            created: Utc::now(),
        });
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Reject payloads this handler can never run.
    fn validate(&self, _payload: &str) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    /// Run the job to completion. `Ok` carries an optional result text.
    async fn run(&self, ctx: JobContext) -> std::result::Result<Option<String>, HandlerError>;
}

/// Payload type tag -> handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `echo`, `sleep`, `fail` and `shell`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("echo", EchoHandler)
            .register("sleep", SleepHandler)
            .register("fail", FailHandler)
            .register("shell", ShellHandler);
        registry
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(tag.into(), Arc::new(handler));
        self
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(tag)
            .cloned()
            .ok_or_else(|| ForemanError::UnknownHandler(tag.to_string()))
    }

    /// Registered tags, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Returns its payload as the result.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, ctx: JobContext) -> std::result::Result<Option<String>, HandlerError> {
        Ok(Some(ctx.payload().to_string()))
    }
}

/// Always fails, with the payload as the error text.
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn run(&self, ctx: JobContext) -> std::result::Result<Option<String>, HandlerError> {
        let reason = ctx.payload().trim();
        Err(HandlerError::Failed(if reason.is_empty() {
            "job failed on request".to_string()
        } else {
            reason.to_string()
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SleepPayload {
    millis: u64,
}

/// Sleeps for `{"millis": N}` (or a bare `N`) milliseconds, stopping early on
/// cancel.
pub struct SleepHandler;

impl SleepHandler {
    fn duration(payload: &str) -> std::result::Result<Duration, HandlerError> {
        let payload = payload.trim();
        let millis = match payload.parse::<u64>() {
            Ok(millis) => millis,
            Err(_) => serde_json::from_str::<SleepPayload>(payload)
                .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?
                .millis,
        };
        Ok(Duration::from_millis(millis))
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    fn validate(&self, payload: &str) -> std::result::Result<(), HandlerError> {
        Self::duration(payload).map(|_| ())
    }

    async fn run(&self, ctx: JobContext) -> std::result::Result<Option<String>, HandlerError> {
        let duration = Self::duration(ctx.payload())?;
        ctx.progress(format!("Sleeping for {} ms", duration.as_millis()));
        tokio::select! {
            _ = ctx.cancelled() => Err(HandlerError::Canceled),
            _ = tokio::time::sleep(duration) => {
                Ok(Some(format!("Slept {} ms", duration.as_millis())))
            }
        }
    }
}
