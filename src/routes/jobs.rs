use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use reqwest::Url;
use std::path::{Path as FsPath, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::{JobView, NewJob};
use crate::models::submission::{JobListResponse, JobSummary, SubmissionFields, SubmitResponse};
use crate::routes::error::ApiError;
use crate::services::credentials::Credential;
use crate::services::downloader::is_youtube;
use crate::services::media::sanitize_file_name;

pub const GEMINI_KEY_HEADER: &str = "x-gemini-api-key";
const MIN_GEMINI_KEY_CHARS: usize = 30;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "webm", "mp3", "m4a", "wav", "aac", "ogg", "flac",
];

/// Upload written to disk, owned by the request until the job row exists.
struct StoredUpload {
    path: PathBuf,
    bytes: u64,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// Optional per-request Gemini key. Present but malformed is rejected.
fn gemini_key(headers: &HeaderMap) -> Result<Option<Credential>, ApiError> {
    let Some(value) = headers.get(GEMINI_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map(str::trim)
        .map_err(|_| ApiError::Unauthorized("Invalid Gemini API key format".to_string()))?;
    if key.chars().count() < MIN_GEMINI_KEY_CHARS {
        return Err(ApiError::Unauthorized(
            "Invalid Gemini API key format".to_string(),
        ));
    }
    Ok(Some(Credential::new(key)))
}

fn allowed_extension(file_name: &str) -> Option<String> {
    let ext = FsPath::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

async fn store_upload(
    mut field: Field<'_>,
    dir: &FsPath,
    job_id: Uuid,
    limit: u64,
) -> Result<StoredUpload, ApiError> {
    let file_name = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("The file part has no file name".to_string()))?;
    if allowed_extension(&file_name).is_none() {
        return Err(ApiError::BadRequest(format!(
            "Unsupported file type. Allowed extensions: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}_{}", job_id, sanitize_file_name(&file_name)));
    let mut file = tokio::fs::File::create(&path).await?;

    let bytes = match copy_field(&mut field, &mut file, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
    };
    if bytes == 0 {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(ApiError::BadRequest("The uploaded file is empty".to_string()));
    }

    Ok(StoredUpload { path, bytes })
}

async fn copy_field(
    field: &mut Field<'_>,
    file: &mut tokio::fs::File,
    limit: u64,
) -> Result<u64, ApiError> {
    let mut bytes: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        bytes += chunk.len() as u64;
        if bytes > limit {
            return Err(ApiError::PayloadTooLarge(format!(
                "File exceeds the {} byte upload limit",
                limit
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(bytes)
}

async fn discard_upload(upload: Option<&StoredUpload>) {
    if let Some(upload) = upload {
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            tracing::warn!(path = %upload.path.display(), error = %e, "Failed to remove rejected upload");
        }
    }
}

async fn read_submission(
    multipart: &mut Multipart,
    state: &AppState,
    job_id: Uuid,
    upload: &mut Option<StoredUpload>,
) -> Result<SubmissionFields, ApiError> {
    let mut fields = SubmissionFields::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if upload.is_some() {
                    return Err(ApiError::BadRequest("Only one file may be uploaded".to_string()));
                }
                let stored =
                    store_upload(field, &state.upload_dir, job_id, state.max_upload_bytes).await?;
                *upload = Some(stored);
            }
            "url" | "webhook_url" | "mime_type" => {
                let text = field.text().await.map_err(multipart_error)?;
                let text = text.trim();
                let value = (!text.is_empty()).then(|| text.to_string());
                match name.as_str() {
                    "url" => fields.url = value,
                    "webhook_url" => fields.webhook_url = value,
                    _ => fields.mime_type = value,
                }
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown form field");
            }
        }
    }

    fields
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;
    Ok(fields)
}

/// POST /api/v1/jobs: Submit an uploaded file or a media URL for analysis.
/// URLs other than YouTube links are downloaded before the job is created.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let credential = gemini_key(&headers)?;
    let job_id = Uuid::new_v4();

    let mut upload = None;
    let fields = match read_submission(&mut multipart, &state, job_id, &mut upload).await {
        Ok(fields) => fields,
        Err(e) => {
            discard_upload(upload.as_ref()).await;
            return Err(e);
        }
    };

    let uploaded_path = upload
        .as_ref()
        .map(|u| u.path.to_string_lossy().into_owned());
    let (input_ref, source_locator, mime_type) = match (uploaded_path, fields.url) {
        (Some(path), None) => (path, None, fields.mime_type),
        (None, Some(url)) => {
            let parsed = Url::parse(&url)
                .map_err(|e| ApiError::BadRequest(format!("Invalid url: {}", e)))?;
            if is_youtube(&parsed) {
                (url.clone(), Some(url), fields.mime_type)
            } else {
                let downloaded = state
                    .downloader
                    .fetch(&parsed, &state.upload_dir, job_id)
                    .await?;
                let input_ref = downloaded.path.to_string_lossy().into_owned();
                let mime_type = fields.mime_type.or(downloaded.mime_type);
                upload = Some(StoredUpload {
                    path: downloaded.path,
                    bytes: downloaded.bytes,
                });
                (input_ref, Some(url), mime_type)
            }
        }
        (Some(_), Some(_)) => {
            discard_upload(upload.as_ref()).await;
            return Err(ApiError::BadRequest(
                "Provide either a file or a url, not both".to_string(),
            ));
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Either a file or a url is required".to_string(),
            ))
        }
    };

    let mut new_job = NewJob::new(input_ref)
        .with_webhook(fields.webhook_url)
        .with_mime_type(mime_type)
        .with_source_locator(source_locator)
        .with_credential_hash(credential.as_ref().map(Credential::fingerprint));
    new_job.id = job_id;

    // The secret must be in the vault before the row is visible to the worker.
    let per_request = credential.is_some();
    if let Some(credential) = credential {
        state.vault.deposit(job_id, credential);
    }

    let job = match queries::create_job(&state.db, &new_job).await {
        Ok(job) => job,
        Err(e) => {
            state.vault.discard(job_id);
            discard_upload(upload.as_ref()).await;
            return Err(e.into());
        }
    };

    metrics::counter!("analysis_jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        upload_bytes = upload.as_ref().map(|u| u.bytes),
        source_url = job.source_locator.as_deref(),
        per_request_key = per_request,
        webhook = job.webhook_url.is_some(),
        "Analysis job submitted"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
            message: "Media submitted for analysis. Poll the job status for the result.".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Current state of one job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(job.view()))
}

/// GET /api/v1/jobs: All jobs, newest first.
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = queries::list_jobs(&state.db).await?;
    Ok(Json(JobListResponse {
        jobs: jobs.iter().map(JobSummary::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extension_allow_list_is_case_insensitive() {
        assert_eq!(allowed_extension("talk.MP4").as_deref(), Some("mp4"));
        assert_eq!(allowed_extension("podcast.flac").as_deref(), Some("flac"));
        assert!(allowed_extension("slides.pdf").is_none());
        assert!(allowed_extension("noextension").is_none());
    }

    #[test]
    fn test_short_gemini_key_is_rejected() {
        let mut headers = HeaderMap::new();
        assert!(gemini_key(&headers).unwrap().is_none());

        headers.insert(GEMINI_KEY_HEADER, HeaderValue::from_static("too-short"));
        assert!(matches!(gemini_key(&headers), Err(ApiError::Unauthorized(_))));

        headers.insert(
            GEMINI_KEY_HEADER,
            HeaderValue::from_static("AIzaSyA-0123456789abcdefghijklmnopqr"),
        );
        let key = gemini_key(&headers).unwrap().unwrap();
        assert_eq!(key.expose(), "AIzaSyA-0123456789abcdefghijklmnopqr");
    }
}
