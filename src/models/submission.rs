use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{AnalysisJob, JobStatus};

/// Text fields of a submission form. The media itself arrives either as the
/// `file` part or as `url`.
#[derive(Debug, Default, Validate)]
pub struct SubmissionFields {
    #[garde(url, custom(http_scheme))]
    pub url: Option<String>,

    #[garde(url, custom(http_scheme))]
    pub webhook_url: Option<String>,

    #[garde(length(min = 3, max = 127), custom(mime_shape))]
    pub mime_type: Option<String>,
}

fn http_scheme(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(v) if !(v.starts_with("http://") || v.starts_with("https://")) => {
            Err(garde::Error::new("only http and https URLs are supported"))
        }
        _ => Ok(()),
    }
}

fn mime_shape(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(v) if v.split('/').count() != 2 || v.contains(char::is_whitespace) => {
            Err(garde::Error::new("expected a MIME type such as video/mp4"))
        }
        _ => Ok(()),
    }
}

/// Response after submitting media for analysis.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// One row of the job listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_url: Option<String>,
}

impl From<&AnalysisJob> for JobSummary {
    fn from(job: &AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            source_url: job.source_locator.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_accept_http_urls_and_mime() {
        let fields = SubmissionFields {
            url: Some("https://www.youtube.com/watch?v=abc".into()),
            webhook_url: Some("http://localhost:9000/hook".into()),
            mime_type: Some("video/mp4".into()),
        };
        assert!(fields.validate().is_ok());
        assert!(SubmissionFields::default().validate().is_ok());
    }

    #[test]
    fn test_fields_reject_other_schemes_and_bad_mime() {
        let ftp = SubmissionFields {
            url: Some("ftp://example.com/a.mp4".into()),
            ..Default::default()
        };
        assert!(ftp.validate().is_err());

        let garbage = SubmissionFields {
            webhook_url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(garbage.validate().is_err());

        let mime = SubmissionFields {
            mime_type: Some("video".into()),
            ..Default::default()
        };
        assert!(mime.validate().is_err());
    }
}
