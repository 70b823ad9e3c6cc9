use futures::FutureExt;
use serde_json::Value;
use sqlx::SqlitePool;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RetryPolicy, WorkerSettings};
use crate::db::queries::{self, StoreError};
use crate::models::job::{AnalysisJob, JobUpdate};
use crate::services::backend::ServiceError;
use crate::services::credentials::{Credential, CredentialVault, JobCredential};
use crate::services::invoker::AnalysisInvoker;
use crate::services::media::{self, MediaError};
use crate::services::prompts;
use crate::services::recovery::{self, ModelRepairer, RecoveryError};
use crate::services::webhook::WebhookQueue;

/// Why a claimed job ended up `failed`. The Display text is what the job
/// record and its webhook carry.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("The analysis service rejected the credential: {0}")]
    Auth(String),

    #[error("The analysis service is unavailable after {attempts} attempts: {detail}")]
    Unavailable { attempts: u32, detail: String },

    #[error("The analysis service failed: {0}")]
    Service(String),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("Job processing panicked: {0}")]
    Panicked(String),
}

impl JobError {
    fn from_service(error: ServiceError, attempts: u32) -> Self {
        match error {
            ServiceError::Auth(detail) => JobError::Auth(detail),
            ServiceError::Transient(detail) => JobError::Unavailable { attempts, detail },
            ServiceError::Fatal(detail) => JobError::Service(detail),
        }
    }
}

/// Backoff for writing a job's terminal state.
const TERMINAL_WRITE_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_millis(200),
};

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The single analysis worker. Jobs are claimed oldest first and each one is
/// driven to a terminal state before the next is claimed.
pub struct Scheduler {
    db: SqlitePool,
    vault: Arc<CredentialVault>,
    default_credential: Option<Credential>,
    invoker: AnalysisInvoker,
    webhooks: WebhookQueue,
    settings: WorkerSettings,
}

impl Scheduler {
    pub fn new(
        db: SqlitePool,
        vault: Arc<CredentialVault>,
        default_credential: Option<Credential>,
        invoker: AnalysisInvoker,
        webhooks: WebhookQueue,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            vault,
            default_credential,
            invoker,
            webhooks,
            settings,
        }
    }

    /// Poll until `shutdown` fires. A job already claimed when it fires still
    /// runs to its terminal state.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        while !shutdown.is_cancelled() {
            match self.process_next_job().await {
                Ok(true) => {
                    tracing::debug!("Job processed, checking for next job");
                }
                Ok(false) => {
                    tracing::trace!("No pending jobs, sleeping");
                    if !self.idle(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Job store error, will retry");
                    if !self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Sleep one poll interval. Returns false if shutdown was requested.
    pub async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }

    /// Claim and process the oldest pending job.
    /// Returns Ok(true) if a job was processed, Ok(false) if none was pending.
    pub async fn process_next_job(&self) -> Result<bool, StoreError> {
        let depth = queries::count_pending(&self.db).await?;
        metrics::gauge!("analysis_queue_depth").set(depth as f64);

        let Some(job) = queries::next_pending_job(&self.db).await? else {
            return Ok(false);
        };
        let job_id = job.id;

        let Some(job) = queries::update_job(&self.db, job_id, JobUpdate::Processing).await? else {
            tracing::warn!(job_id = %job_id, "Pending job vanished before it could be claimed");
            return Ok(true);
        };

        let credential = JobCredential::claim(&self.vault, job_id, self.default_credential.as_ref());
        tracing::info!(
            job_id = %job_id,
            input = %job.input_ref,
            credential_source = ?credential.source(),
            credential_hash = job.credential_hash.as_deref().unwrap_or("-"),
            "Processing analysis job"
        );

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.analyze(&job, &credential))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload))));
        drop(credential);

        let update = match outcome {
            Ok(result) => JobUpdate::Completed(result),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job failed");
                JobUpdate::Failed(e.to_string())
            }
        };

        let finished = self.finish(job_id, update).await;
        media::release(job_id, &job.input_ref).await;
        let finished = finished?;

        let elapsed = started.elapsed();
        metrics::histogram!("analysis_job_processing_seconds").record(elapsed.as_secs_f64());

        if let Some(finished) = finished {
            if finished.error.is_some() {
                metrics::counter!("analysis_jobs_failed_total").increment(1);
            } else {
                metrics::counter!("analysis_jobs_completed_total").increment(1);
            }
            tracing::info!(
                job_id = %job_id,
                status = %finished.status,
                duration_ms = elapsed.as_millis() as u64,
                "Job finished"
            );
            if let Some(url) = &finished.webhook_url {
                self.webhooks.enqueue(url.clone(), finished.view());
            }
        }

        Ok(true)
    }

    /// Record the terminal state. A result that cannot be stored is replaced
    /// by a failure naming the store error, so a claimed job does not stay
    /// `processing`.
    async fn finish(
        &self,
        job_id: Uuid,
        update: JobUpdate,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let completed = matches!(update, JobUpdate::Completed(_));
        match self.write_terminal(job_id, update).await {
            Err(e) if completed => {
                tracing::error!(job_id = %job_id, error = %e, "Could not store the result, recording a failure instead");
                let failure = JobUpdate::Failed(format!("The analysis result could not be stored: {}", e));
                self.write_terminal(job_id, failure).await
            }
            other => other,
        }
    }

    async fn write_terminal(
        &self,
        job_id: Uuid,
        update: JobUpdate,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let mut attempt = 1;
        loop {
            match queries::update_job(&self.db, job_id, update.clone()).await {
                Ok(job) => return Ok(job),
                Err(e @ StoreError::IllegalTransition { .. }) => return Err(e),
                Err(e) if attempt < TERMINAL_WRITE_RETRY.max_attempts => {
                    let delay = TERMINAL_WRITE_RETRY.delay_after(attempt);
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Terminal job update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn analyze(&self, job: &AnalysisJob, credential: &JobCredential) -> Result<Value, JobError> {
        let input = media::resolve(job, self.settings.max_input_bytes).await?;
        let secret = credential.credential().ok_or_else(|| {
            JobError::Auth(
                "no per-request key was supplied and no default key is configured".to_string(),
            )
        })?;

        let call_started = Instant::now();
        let raw = self
            .invoker
            .invoke(&input, secret, prompts::ANALYSIS_INSTRUCTIONS)
            .await
            .map_err(|e| JobError::from_service(e, self.invoker.policy().max_attempts))?;
        tracing::info!(
            job_id = %job.id,
            call_duration_ms = call_started.elapsed().as_millis() as u64,
            output_chars = raw.len(),
            "Analysis output received"
        );

        let repairer = ModelRepairer::new(self.invoker.backend(), secret);
        let recovered =
            recovery::recover(&raw, Some(&repairer), self.settings.repair_max_attempts).await?;

        tracing::info!(
            job_id = %job.id,
            stage = %recovered.stage,
            repair_attempts = recovered.repair_attempts,
            "Structured result recovered"
        );
        metrics::counter!("analysis_recovery_stage_total", "stage" => recovered.stage.to_string())
            .increment(1);

        Ok(recovered.value)
    }
}
