use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobStatus, JobUpdate, NewJob};

const JOB_COLUMNS: &str = "id, status, input_ref, mime_type, webhook_url, credential_hash, \
                           source_locator, result, error, created_at, updated_at";

const INTERRUPTED_MESSAGE: &str =
    "Job was interrupted by a service restart before it finished; please resubmit";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}

fn job_from_row(row: &SqliteRow) -> Result<AnalysisJob, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| StoreError::Corrupt(format!("unknown status '{}'", status_str)))?;

    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|text| serde_json::from_str(&text))
        .transpose()?;

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        status,
        input_ref: row.try_get("input_ref")?,
        mime_type: row.try_get("mime_type")?,
        webhook_url: row.try_get("webhook_url")?,
        credential_hash: row.try_get("credential_hash")?,
        source_locator: row.try_get("source_locator")?,
        result,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new pending job
pub async fn create_job(pool: &SqlitePool, new_job: &NewJob) -> Result<AnalysisJob, StoreError> {
    let now = Utc::now();
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO analysis_jobs
            (id, status, input_ref, mime_type, webhook_url, credential_hash, source_locator,
             created_at, updated_at)
        VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(new_job.id)
    .bind(&new_job.input_ref)
    .bind(&new_job.mime_type)
    .bind(&new_job.webhook_url)
    .bind(&new_job.credential_hash)
    .bind(&new_job.source_locator)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Pending jobs in creation order. The scheduler's FIFO guarantee rests on
/// this ordering, so it sorts on the insert sequence rather than timestamps.
pub async fn list_pending_jobs(pool: &SqlitePool) -> Result<Vec<AnalysisJob>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE status = 'pending' ORDER BY seq ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Oldest pending job, if any.
pub async fn next_pending_job(pool: &SqlitePool) -> Result<Option<AnalysisJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE status = 'pending' ORDER BY seq ASC LIMIT 1"
    ))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// All jobs, newest first
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<AnalysisJob>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs ORDER BY seq DESC"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn count_pending(pool: &SqlitePool) -> Result<i64, StoreError> {
    let row = sqlx::query("SELECT COUNT(*) AS pending FROM analysis_jobs WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("pending")?)
}

/// Apply a status change in one transaction.
///
/// Returns `Ok(None)` when the job does not exist. Rejects transitions the
/// lifecycle does not allow, sets exactly one of `result`/`error` on terminal
/// states and never lets `updated_at` go backwards.
pub async fn update_job(
    pool: &SqlitePool,
    job_id: Uuid,
    update: JobUpdate,
) -> Result<Option<AnalysisJob>, StoreError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut job = job_from_row(&row)?;

    let next = update.status();
    if !job.status.can_transition_to(next) {
        return Err(StoreError::IllegalTransition {
            job_id,
            from: job.status,
            to: next,
        });
    }

    match update {
        JobUpdate::Processing => {}
        JobUpdate::Completed(result) => {
            job.result = Some(result);
            job.error = None;
        }
        JobUpdate::Failed(error) => {
            job.result = None;
            job.error = Some(if error.trim().is_empty() {
                "Job failed without an error description".to_string()
            } else {
                error
            });
        }
    }
    job.status = next;
    job.updated_at = bump(job.updated_at);

    let result_text = job.result.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = ?, result = ?, error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(job.status.as_ref())
    .bind(result_text)
    .bind(&job.error)
    .bind(job.updated_at)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(job))
}

/// Fail jobs a previous process left in `processing`. Their credentials died
/// with that process, so they cannot be resumed.
pub async fn fail_interrupted_jobs(pool: &SqlitePool) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'failed', result = NULL, error = ?, updated_at = ?
        WHERE status = 'processing'
        "#,
    )
    .bind(INTERRUPTED_MESSAGE)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}
