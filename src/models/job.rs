use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an analysis job. Moves strictly forward:
/// `pending -> processing -> {completed | failed}`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// A persisted analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub status: JobStatus,
    /// Local path of an upload, or the remote locator for URL submissions
    pub input_ref: String,
    pub mime_type: Option<String>,
    pub webhook_url: Option<String>,
    /// SHA-256 of the per-request credential; the secret itself is never stored
    pub credential_hash: Option<String>,
    pub source_locator: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    /// The shape returned by status polling and POSTed to webhooks.
    pub fn view(&self) -> JobView {
        let terminal = self.status.is_terminal();
        JobView {
            job_id: self.id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            source_url: self.source_locator.clone(),
            result: if terminal { self.result.clone() } else { None },
            error: if terminal { self.error.clone() } else { None },
        }
    }
}

/// Input for creating a job. The id is fixed here so callers can attach
/// out-of-band state (the credential) before the row is visible to the worker.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub input_ref: String,
    pub mime_type: Option<String>,
    pub webhook_url: Option<String>,
    pub credential_hash: Option<String>,
    pub source_locator: Option<String>,
}

impl NewJob {
    pub fn new(input_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_ref: input_ref.into(),
            mime_type: None,
            webhook_url: None,
            credential_hash: None,
            source_locator: None,
        }
    }

    pub fn with_webhook(mut self, url: Option<String>) -> Self {
        self.webhook_url = url;
        self
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    pub fn with_credential_hash(mut self, hash: Option<String>) -> Self {
        self.credential_hash = hash;
        self
    }

    pub fn with_source_locator(mut self, locator: Option<String>) -> Self {
        self.source_locator = locator;
        self
    }
}

/// A status change requested by the scheduler.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    Processing,
    Completed(serde_json::Value),
    Failed(String),
}

impl JobUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            JobUpdate::Processing => JobStatus::Processing,
            JobUpdate::Completed(_) => JobStatus::Completed,
            JobUpdate::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Public job representation: status responses and webhook bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}
