use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Response};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;

use crate::services::backend::{
    AnalysisBackend, GenerateRequest, ModelTier, ServiceError, StagedMedia,
};
use crate::services::credentials::Credential;
use crate::services::media::MediaInput;

const API_KEY_HEADER: &str = "x-goog-api-key";
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const FILE_ACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the Gemini generative language API.
pub struct GeminiClient {
    http: Client,
    base_url: String,
    analysis_model: String,
    repair_model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    File { file_data: FileData },
    Text { text: String },
}

#[derive(Serialize)]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: GeminiFile,
}

#[derive(Deserialize)]
struct GeminiFile {
    name: String,
    uri: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<FileStatusError>,
}

#[derive(Deserialize)]
struct FileStatusError {
    message: Option<String>,
}

impl GeminiClient {
    pub fn new(
        base_url: &str,
        analysis_model: &str,
        repair_model: &str,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            analysis_model: analysis_model.to_string(),
            repair_model: repair_model.to_string(),
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Analysis => &self.analysis_model,
            ModelTier::Repair => &self.repair_model,
        }
    }

    /// Upload a local file through the resumable Files API, then wait until
    /// the service has finished processing it.
    async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        size: u64,
        credential: &Credential,
    ) -> Result<StagedMedia, ServiceError> {
        let display_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();

        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header(API_KEY_HEADER, credential.expose())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(ServiceError::from_transport)?;
        let start = ensure_success(start).await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Fatal("Upload session returned no upload URL".to_string()))?
            .to_string();

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ServiceError::Fatal(format!("Failed to read {}: {}", path.display(), e)))?;

        let uploaded = self
            .http
            .post(&upload_url)
            .header(CONTENT_LENGTH, size)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(ServiceError::from_transport)?;
        let envelope: FileEnvelope = ensure_success(uploaded)
            .await?
            .json()
            .await
            .map_err(ServiceError::from_transport)?;

        tracing::info!(file = %envelope.file.name, "Media uploaded, waiting for it to become active");
        let active = self.wait_for_active(envelope.file, credential).await?;

        Ok(StagedMedia {
            uri: active.uri,
            mime_type: mime_type.to_string(),
        })
    }

    async fn wait_for_active(
        &self,
        mut file: GeminiFile,
        credential: &Credential,
    ) -> Result<GeminiFile, ServiceError> {
        let started = Instant::now();
        loop {
            match file.state.as_deref() {
                Some("ACTIVE") | None => return Ok(file),
                Some("FAILED") => {
                    let reason = file
                        .error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(ServiceError::Fatal(format!("File processing failed: {}", reason)));
                }
                Some(state) => {
                    if started.elapsed() >= FILE_ACTIVE_TIMEOUT {
                        return Err(ServiceError::Fatal(format!(
                            "Timed out waiting for file {} to become active (last state {})",
                            file.name, state
                        )));
                    }
                    tracing::debug!(file = %file.name, state = %state, "File not active yet");
                }
            }

            tokio::time::sleep(FILE_POLL_INTERVAL).await;

            let response = self
                .http
                .get(format!("{}/v1beta/{}", self.base_url, file.name))
                .header(API_KEY_HEADER, credential.expose())
                .send()
                .await
                .map_err(ServiceError::from_transport)?;
            file = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(ServiceError::from_transport)?;
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::from_status(status, &body))
}

fn extract_text(response: GenerateContentResponse) -> Result<String, ServiceError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ServiceError::Fatal(format!("Prompt blocked by the service: {}", reason)));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::Fatal("No candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !p.thought)
        .filter_map(|p| p.text)
        .collect();

    if text.is_empty() {
        return Err(ServiceError::Fatal(format!(
            "Empty response (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}

#[async_trait]
impl AnalysisBackend for GeminiClient {
    async fn stage_media(
        &self,
        media: &MediaInput,
        credential: &Credential,
    ) -> Result<StagedMedia, ServiceError> {
        match media {
            MediaInput::Remote { uri, mime_type } => Ok(StagedMedia {
                uri: uri.clone(),
                mime_type: mime_type.clone(),
            }),
            MediaInput::LocalFile {
                path,
                mime_type,
                size,
            } => self.upload_file(path, mime_type, *size, credential).await,
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest<'_>,
        credential: &Credential,
    ) -> Result<String, ServiceError> {
        let model = self.model_for(request.tier);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);

        let mut parts = Vec::with_capacity(2);
        if let Some(media) = request.media {
            parts.push(Part::File {
                file_data: FileData {
                    mime_type: media.mime_type.clone(),
                    file_uri: media.uri.clone(),
                },
            });
        }
        parts.push(Part::Text {
            text: request.prompt.to_string(),
        });

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.95,
                top_k: 64,
                max_output_tokens: match request.tier {
                    ModelTier::Analysis => 65536,
                    ModelTier::Repair => 8192,
                },
                response_mime_type: "text/plain",
            },
        };

        tracing::debug!(model = %model, "Calling generateContent");
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_transport)?;

        let parsed: GenerateContentResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(ServiceError::from_transport)?;

        extract_text(parsed)
    }
}
