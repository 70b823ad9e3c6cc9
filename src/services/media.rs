use reqwest::Url;
use std::path::{Path, PathBuf};

use crate::models::job::AnalysisJob;

/// MIME type handed to the backend for remote locators it fetches itself.
const REMOTE_MIME_TYPE: &str = "video/*";

/// Media a job points at, checked and ready for the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaInput {
    LocalFile {
        path: PathBuf,
        mime_type: String,
        size: u64,
    },
    Remote {
        uri: String,
        mime_type: String,
    },
}

impl MediaInput {
    pub fn mime_type(&self) -> &str {
        match self {
            MediaInput::LocalFile { mime_type, .. } | MediaInput::Remote { mime_type, .. } => {
                mime_type
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Input file not found at {0}")]
    NotFound(String),

    #[error("Input file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Could not determine the MIME type of {0}; resubmit with a mime_type parameter (e.g. video/mp4, audio/mpeg)")]
    UnknownMimeType(String),

    #[error("Invalid media locator '{0}': only http and https URLs are supported")]
    InvalidLocator(String),

    #[error("Failed to read input file: {0}")]
    Io(#[from] std::io::Error),
}

/// Keep only characters that are safe in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn is_remote(input_ref: &str) -> bool {
    input_ref.starts_with("http://") || input_ref.starts_with("https://")
}

/// Check the job's input before any external call is made.
pub async fn resolve(job: &AnalysisJob, max_bytes: u64) -> Result<MediaInput, MediaError> {
    if is_remote(&job.input_ref) {
        let url = Url::parse(&job.input_ref)
            .map_err(|_| MediaError::InvalidLocator(job.input_ref.clone()))?;
        if url.host_str().is_none() {
            return Err(MediaError::InvalidLocator(job.input_ref.clone()));
        }
        return Ok(MediaInput::Remote {
            uri: url.to_string(),
            mime_type: job
                .mime_type
                .clone()
                .unwrap_or_else(|| REMOTE_MIME_TYPE.to_string()),
        });
    }

    let path = PathBuf::from(&job.input_ref);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(MediaError::NotFound(job.input_ref.clone())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MediaError::NotFound(job.input_ref.clone()))
        }
        Err(e) => return Err(MediaError::Io(e)),
    };

    let size = metadata.len();
    if size > max_bytes {
        return Err(MediaError::TooLarge {
            size,
            limit: max_bytes,
        });
    }

    let mime_type = match &job.mime_type {
        Some(explicit) => explicit.clone(),
        None => mime_guess::from_path(&path)
            .first()
            .map(|m| m.essence_str().to_string())
            .ok_or_else(|| MediaError::UnknownMimeType(job.input_ref.clone()))?,
    };

    Ok(MediaInput::LocalFile {
        path,
        mime_type,
        size,
    })
}

/// Delete the job's local input once the job is terminal. Remote locators
/// own nothing locally. Failures are logged, never raised.
pub async fn release(job_id: uuid::Uuid, input_ref: &str) {
    if is_remote(input_ref) {
        return;
    }

    match tokio::fs::remove_file(Path::new(input_ref)).await {
        Ok(()) => tracing::info!(job_id = %job_id, path = %input_ref, "Input file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(job_id = %job_id, path = %input_ref, "Input file already gone during cleanup")
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, path = %input_ref, error = %e, "Failed to remove input file")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use chrono::Utc;
    use std::io::Write;
    use uuid::Uuid;

    fn job_for(input_ref: &str, mime_type: Option<&str>) -> AnalysisJob {
        let now = Utc::now();
        AnalysisJob {
            id: Uuid::new_v4(),
            status: JobStatus::Processing,
            input_ref: input_ref.to_string(),
            mime_type: mime_type.map(str::to_string),
            webhook_url: None,
            credential_hash: None,
            source_locator: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my talk (final).mp4"), "my_talk__final_.mp4");
    }

    #[tokio::test]
    async fn test_local_file_mime_is_guessed_from_extension() {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(b"not really a video").unwrap();
        let job = job_for(file.path().to_str().unwrap(), None);

        let input = resolve(&job, 1024).await.unwrap();
        assert_eq!(input.mime_type(), "video/mp4");
        assert!(matches!(input, MediaInput::LocalFile { size: 18, .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_resource_error() {
        let job = job_for("/definitely/not/here.mp3", None);
        let err = resolve(&job, 1024).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
        assert!(err.to_string().contains("/definitely/not/here.mp3"));
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let job = job_for(file.path().to_str().unwrap(), None);
        let err = resolve(&job, 10).await.unwrap_err();
        assert!(matches!(err, MediaError::TooLarge { size: 64, limit: 10 }));
    }

    #[tokio::test]
    async fn test_unknown_extension_needs_explicit_mime() {
        let file = tempfile::Builder::new().suffix(".bin9").tempfile().unwrap();
        let path = file.path().to_str().unwrap();

        let err = resolve(&job_for(path, None), 1024).await.unwrap_err();
        assert!(matches!(err, MediaError::UnknownMimeType(_)));

        let input = resolve(&job_for(path, Some("audio/mpeg")), 1024).await.unwrap();
        assert_eq!(input.mime_type(), "audio/mpeg");
    }

    #[tokio::test]
    async fn test_remote_locator_passes_through() {
        let job = job_for("https://www.youtube.com/watch?v=abc123", None);
        let input = resolve(&job, 0).await.unwrap();
        assert_eq!(
            input,
            MediaInput::Remote {
                uri: "https://www.youtube.com/watch?v=abc123".to_string(),
                mime_type: "video/*".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_release_deletes_local_file_only() {
        let file = tempfile::Builder::new().suffix(".m4a").tempfile().unwrap();
        let (_, path) = file.keep().unwrap();
        release(Uuid::new_v4(), path.to_str().unwrap()).await;
        assert!(!path.exists());

        // already gone and remote: both are no-ops
        release(Uuid::new_v4(), path.to_str().unwrap()).await;
        release(Uuid::new_v4(), "https://example.com/talk.mp4").await;
    }
}
