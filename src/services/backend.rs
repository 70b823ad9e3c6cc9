//! Seam between the job pipeline and the generative-AI service.
//!
//! The pipeline only needs two capabilities: make media addressable by the
//! service, and turn a prompt (optionally with that media) into text. Failures
//! are classified so the invoker knows which ones are worth retrying.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::services::credentials::Credential;
use crate::services::media::MediaInput;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Failure of one call to the analysis service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// Overload or temporary unavailability. Worth retrying.
    #[error("Analysis service temporarily unavailable: {0}")]
    Transient(String),

    /// The credential was missing, malformed or rejected.
    #[error("Analysis service rejected the credential: {0}")]
    Auth(String),

    #[error("Analysis service error: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("{} - {}", status, truncate(body, MAX_ERROR_BODY_CHARS));
        match status.as_u16() {
            429 | 500 | 502 | 503 | 504 => ServiceError::Transient(detail),
            401 | 403 => ServiceError::Auth(detail),
            400 if body.contains("API_KEY_INVALID") || body.contains("API key not valid") => {
                ServiceError::Auth(detail)
            }
            _ => ServiceError::Fatal(detail),
        }
    }

    /// Classify a transport-level failure (no usable response).
    pub fn from_transport(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ServiceError::from_status(status, &err.to_string());
        }
        if err.is_timeout() || err.is_connect() {
            ServiceError::Transient(err.to_string())
        } else {
            ServiceError::Fatal(err.to_string())
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Which model a generation request is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// The primary, expensive analysis model
    Analysis,
    /// The cheaper model used to repair malformed output
    Repair,
}

/// Media the service can reference by URI.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMedia {
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub tier: ModelTier,
    pub media: Option<&'a StagedMedia>,
    pub prompt: &'a str,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Make the media addressable by the service (upload, or pass a locator through).
    async fn stage_media(
        &self,
        media: &MediaInput,
        credential: &Credential,
    ) -> Result<StagedMedia, ServiceError>;

    /// Run one generation call and return the raw text output.
    async fn generate(
        &self,
        request: GenerateRequest<'_>,
        credential: &Credential,
    ) -> Result<String, ServiceError>;
}
