use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ForemanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Started,
    Canceling,
    Done,
    Failed,
    Canceled,
    Deleted,
}

impl JobStatus {
    /// Terminal jobs leave the working queue and never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled | JobStatus::Deleted
        )
    }

    /// Whether a job in this status may move to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Queued, Deleted)
                | (Started, Queued)
                | (Started, Canceling)
                | (Started, Done)
                | (Started, Failed)
                | (Started, Canceled)
                | (Canceling, Done)
                | (Canceling, Failed)
                | (Canceling, Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::Started => write!(f, "Started"),
            JobStatus::Canceling => write!(f, "Canceling"),
            JobStatus::Done => write!(f, "Done"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Canceled => write!(f, "Canceled"),
            JobStatus::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A job as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub serialized: String,
    #[serde(rename = "type")]
    pub payload_type: String,
    #[serde(rename = "userName")]
    pub created_by: String,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        serialized: impl Into<String>,
        payload_type: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            serialized: serialized.into(),
            payload_type: payload_type.into(),
            created_by: created_by.into(),
        }
    }

    /// Reject blank required fields.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("name", &self.name),
            ("serialized", &self.serialized),
            ("type", &self.payload_type),
            ("userName", &self.created_by),
        ];
        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| *field)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Validation(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// Working-queue entry for a job that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub serialized: String,
    #[serde(rename = "type")]
    pub payload_type: String,
    pub created_by: String,
    pub assigned_node: Option<String>,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
}

impl JobDefinition {
    pub fn from_spec(id: Uuid, spec: JobSpec, created: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            serialized: spec.serialized,
            payload_type: spec.payload_type,
            created_by: spec.created_by,
            assigned_node: None,
            status: JobStatus::Queued,
            created,
        }
    }

    /// The message pushed to a node when this job is dispatched.
    pub fn to_dispatched(&self) -> DispatchedJob {
        DispatchedJob {
            id: self.id,
            name: self.name.clone(),
            serialized: self.serialized.clone(),
            payload_type: self.payload_type.clone(),
            created_by: self.created_by.clone(),
        }
    }
}

/// Job body sent from the manager to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchedJob {
    pub id: Uuid,
    pub name: String,
    pub serialized: String,
    #[serde(rename = "type")]
    pub payload_type: String,
    pub created_by: String,
}

impl DispatchedJob {
    /// Structural checks a node performs before accepting a job.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.is_nil() {
            return Err("Invalid job id value.".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("Invalid job name value.".to_string());
        }
        if self.payload_type.trim().is_empty() {
            return Err("Invalid job type value.".to_string());
        }
        if self.serialized.is_empty() {
            return Err("Invalid job serialized value.".to_string());
        }
        Ok(())
    }
}

/// Permanent audit record of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistory {
    pub id: Uuid,
    pub name: String,
    pub created_by: String,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub sent_to: Option<String>,
    pub result: Option<String>,
}

/// One progress note in a job's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryDetail {
    pub job_id: Uuid,
    pub created: DateTime<Utc>,
    pub text: String,
}
