//! Worker-side node agent.
//!
//! A node runs at most one job at a time. The slot moves
//! `Idle -> Executing -> (Cancelling ->) Idle`; every exit from the slot is
//! reported to the manager through the [`reporter`] queue.
//!
//! # Components
//!
//! - [`NodeAgent`]: the slot state machine behind the node's HTTP surface
//! - [`handlers`]: payload type tag -> [`JobHandler`](handlers::JobHandler)
//! - [`executor`]: the `shell` handler
//! - [`heartbeat`]: node init and keep-alive towards the manager
//! - [`reporter`]: ordered, retried delivery of status callbacks

pub mod executor;
pub mod handlers;
pub mod heartbeat;
pub mod reporter;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::DispatchedJob;
use crate::transport::wire::SlotStatus;
use crate::transport::StatusUpdate;

pub use handlers::{HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use heartbeat::HeartbeatSender;
pub use reporter::{ReporterHandle, StatusReporter};

/// Answer to a job push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another job occupies the slot.
    Busy,
    /// The job can never run here.
    Invalid(String),
}

/// Answer to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCancelOutcome {
    Cancelling,
    NotFound,
    AlreadyCancelling,
}

#[derive(Debug)]
struct Running {
    job: DispatchedJob,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Idle,
    Executing(Running),
    Cancelling(Running),
}

impl Slot {
    fn job_id(&self) -> Option<Uuid> {
        match self {
            Slot::Idle => None,
            Slot::Executing(running) | Slot::Cancelling(running) => Some(running.job.id),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Slot::Idle => "idle",
            Slot::Executing(_) => "executing",
            Slot::Cancelling(_) => "cancelling",
        }
    }
}

/// The node's single execution slot.
#[derive(Clone)]
pub struct NodeAgent {
    url: String,
    slot: Arc<Mutex<Slot>>,
    handlers: Arc<HandlerRegistry>,
    reporter: ReporterHandle,
    shutdown: CancellationToken,
}

impl NodeAgent {
    pub fn new(
        url: impl Into<String>,
        handlers: HandlerRegistry,
        reporter: ReporterHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url: url.into(),
            slot: Arc::new(Mutex::new(Slot::Idle)),
            handlers: Arc::new(handlers),
            reporter,
            shutdown,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validate `job`, and if the slot is free start it in the background.
    pub async fn start_job(&self, job: DispatchedJob) -> StartOutcome {
        if let Err(reason) = job.validate() {
            tracing::warn!(job_id = %job.id, reason = %reason, "Refusing invalid job");
            return StartOutcome::Invalid(reason);
        }
        let handler = match self.handlers.resolve(&job.payload_type) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Refusing job");
                return StartOutcome::Invalid(e.to_string());
            }
        };
        if let Err(e) = handler.validate(&job.serialized) {
            tracing::warn!(job_id = %job.id, error = %e, "Refusing job payload");
            return StartOutcome::Invalid(e.to_string());
        }

        let mut slot = self.slot.lock().await;
        if !matches!(*slot, Slot::Idle) {
            tracing::debug!(job_id = %job.id, running = ?slot.job_id(), "Slot busy");
            return StartOutcome::Busy;
        }

        let cancel = self.shutdown.child_token();
        *slot = Slot::Executing(Running {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        drop(slot);

        tracing::info!(job_id = %job.id, job_type = %job.payload_type, "Job started");
        let agent = self.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            let ctx = JobContext::new(job, cancel.clone(), agent.reporter.clone());
            let outcome = tokio::spawn(async move { handler.run(ctx).await }).await;
            let update = completion_update(job_id, outcome, &cancel);
            agent.finish(job_id).await;
            agent.reporter.enqueue(update);
        });

        StartOutcome::Started
    }

    pub async fn cancel(&self, job_id: Uuid) -> AgentCancelOutcome {
        let mut slot = self.slot.lock().await;
        match std::mem::take(&mut *slot) {
            Slot::Executing(running) if running.job.id == job_id => {
                running.cancel.cancel();
                *slot = Slot::Cancelling(running);
                tracing::info!(job_id = %job_id, "Cancelling job");
                AgentCancelOutcome::Cancelling
            }
            Slot::Cancelling(running) if running.job.id == job_id => {
                *slot = Slot::Cancelling(running);
                AgentCancelOutcome::AlreadyCancelling
            }
            other => {
                tracing::debug!(job_id = %job_id, running = ?other.job_id(), "Cancel for job not held");
                *slot = other;
                AgentCancelOutcome::NotFound
            }
        }
    }

    /// Free the slot if it still holds `job_id`.
    async fn finish(&self, job_id: Uuid) {
        let mut slot = self.slot.lock().await;
        if slot.job_id() == Some(job_id) {
            *slot = Slot::Idle;
        }
    }

    pub async fn status(&self) -> SlotStatus {
        let slot = self.slot.lock().await;
        let (job_id, job_name) = match &*slot {
            Slot::Idle => (None, None),
            Slot::Executing(running) | Slot::Cancelling(running) => {
                (Some(running.job.id), Some(running.job.name.clone()))
            }
        };
        SlotStatus {
            node: self.url.clone(),
            state: slot.name().to_string(),
            job_id,
            job_name,
        }
    }

    pub async fn is_idle(&self) -> bool {
        matches!(*self.slot.lock().await, Slot::Idle)
    }
}

/// Map how a handler task ended onto the callback the manager should get.
fn completion_update(
    job_id: Uuid,
    outcome: std::result::Result<
        std::result::Result<Option<String>, HandlerError>,
        tokio::task::JoinError,
    >,
    cancel: &CancellationToken,
) -> StatusUpdate {
    match outcome {
        Ok(Ok(result)) => {
            tracing::info!(job_id = %job_id, "Job done");
            StatusUpdate::Done { job_id, result }
        }
        Ok(Err(HandlerError::Canceled)) => {
            tracing::info!(job_id = %job_id, "Job canceled");
            StatusUpdate::Canceled { job_id }
        }
        Ok(Err(_)) if cancel.is_cancelled() => {
            tracing::info!(job_id = %job_id, "Job canceled");
            StatusUpdate::Canceled { job_id }
        }
        Ok(Err(e)) => {
            tracing::warn!(job_id = %job_id, error = %e, "Job failed");
            StatusUpdate::Failed {
                job_id,
                error: e.to_string(),
                created: Utc::now(),
            }
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Job handler panicked");
            StatusUpdate::Failed {
                job_id,
                error: format!("handler panicked: {}", e),
                created: Utc::now(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(payload_type: &str, payload: &str) -> DispatchedJob {
        DispatchedJob {
            id: Uuid::new_v4(),
            name: "unit".into(),
            serialized: payload.into(),
            payload_type: payload_type.into(),
            created_by: "tester".into(),
        }
    }

    fn agent() -> (NodeAgent, tokio::sync::mpsc::UnboundedReceiver<StatusUpdate>) {
        let (reporter, rx) = ReporterHandle::detached();
        let agent = NodeAgent::new(
            "http://node:1/",
            HandlerRegistry::with_builtins(),
            reporter,
            CancellationToken::new(),
        );
        (agent, rx)
    }

    #[tokio::test]
    async fn second_job_is_refused_while_busy() {
        let (agent, _rx) = agent();
        assert_eq!(agent.start_job(job("sleep", "60000")).await, StartOutcome::Started);
        assert_eq!(agent.start_job(job("echo", "x")).await, StartOutcome::Busy);
    }

    #[tokio::test]
    async fn invalid_jobs_are_refused() {
        let (agent, _rx) = agent();
        assert!(matches!(
            agent.start_job(job("nope", "x")).await,
            StartOutcome::Invalid(_)
        ));
        assert!(matches!(
            agent.start_job(job("sleep", "later")).await,
            StartOutcome::Invalid(_)
        ));
        assert!(agent.is_idle().await);
    }

    #[tokio::test]
    async fn cancel_transitions() {
        let (agent, mut rx) = agent();
        let running = job("sleep", "60000");
        let id = running.id;
        agent.start_job(running).await;

        assert_eq!(agent.cancel(Uuid::new_v4()).await, AgentCancelOutcome::NotFound);
        assert_eq!(agent.cancel(id).await, AgentCancelOutcome::Cancelling);

        let mut terminal = None;
        while let Some(update) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            if update.is_terminal() {
                terminal = Some(update);
                break;
            }
        }
        assert_eq!(terminal, Some(StatusUpdate::Canceled { job_id: id }));
        assert!(agent.is_idle().await);
        assert_eq!(agent.cancel(id).await, AgentCancelOutcome::NotFound);
    }
}
