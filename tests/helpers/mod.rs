//! Shared fixtures for the integration tests: an in-memory job store, a
//! scripted analysis backend, a webhook sink and a fully wired scheduler.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use media_insight_jobs::config::{RetryPolicy, WebhookSettings, WorkerSettings};
use media_insight_jobs::db;
use media_insight_jobs::models::job::{AnalysisJob, JobStatus};
use media_insight_jobs::services::backend::{
    AnalysisBackend, GenerateRequest, ModelTier, ServiceError, StagedMedia,
};
use media_insight_jobs::services::credentials::{Credential, CredentialVault};
use media_insight_jobs::services::invoker::AnalysisInvoker;
use media_insight_jobs::services::media::MediaInput;
use media_insight_jobs::services::scheduler::Scheduler;
use media_insight_jobs::services::webhook::{WebhookDispatcher, WebhookNotifier};

/// Schema-valid analysis output.
pub const VALID_ANALYSIS: &str = r#"{
  "transcript": [{"speaker": "Ada", "timestamp": "00:00:01", "text": "Welcome to the show."}],
  "topics": ["Compilers", "Memory safety"],
  "summary": "Ada explains why borrow checking matters.",
  "language": "en",
  "speakers": [{"name": "Ada", "roles_affiliations": [{"role": "Host"}], "facts": ["Hosts the show"]}]
}"#;

pub const DEFAULT_KEY: &str = "env-default-gemini-key-0000000000000";
pub const PER_REQUEST_KEY: &str = "per-request-gemini-key-111111111111111";

/// Fresh in-memory store with the schema applied.
pub async fn store() -> SqlitePool {
    let pool = db::init_memory_pool().await.expect("in-memory pool");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(ServiceError),
    Panic,
}

impl Reply {
    pub fn text(s: &str) -> Self {
        Reply::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    Stage,
    Analysis,
    Repair,
}

#[derive(Debug, Clone)]
pub struct BackendCall {
    pub kind: CallKind,
    pub credential: String,
    /// Staged media URI for stage/analysis calls
    pub media: Option<String>,
}

/// Backend that replays scripted replies and records every call.
#[derive(Default)]
pub struct FakeBackend {
    analysis: Mutex<VecDeque<Reply>>,
    repair: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<BackendCall>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis(self, replies: Vec<Reply>) -> Self {
        *self.analysis.lock().unwrap() = replies.into();
        self
    }

    pub fn with_repairs(self, replies: Vec<Reply>) -> Self {
        *self.repair.lock().unwrap() = replies.into();
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls().iter().filter(|c| c.kind == kind).count()
    }

    fn record(&self, kind: CallKind, credential: &Credential, media: Option<String>) {
        self.calls.lock().unwrap().push(BackendCall {
            kind,
            credential: credential.expose().to_string(),
            media,
        });
    }

    fn play(reply: Reply) -> Result<String, ServiceError> {
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Error(e) => Err(e),
            Reply::Panic => panic!("scripted backend panic"),
        }
    }
}

#[async_trait]
impl AnalysisBackend for FakeBackend {
    async fn stage_media(
        &self,
        media: &MediaInput,
        credential: &Credential,
    ) -> Result<StagedMedia, ServiceError> {
        let uri = match media {
            MediaInput::LocalFile { path, .. } => format!("files/{}", path.display()),
            MediaInput::Remote { uri, .. } => uri.clone(),
        };
        self.record(CallKind::Stage, credential, Some(uri.clone()));
        Ok(StagedMedia {
            uri,
            mime_type: media.mime_type().to_string(),
        })
    }

    async fn generate(
        &self,
        request: GenerateRequest<'_>,
        credential: &Credential,
    ) -> Result<String, ServiceError> {
        match request.tier {
            ModelTier::Analysis => {
                self.record(
                    CallKind::Analysis,
                    credential,
                    request.media.map(|m| m.uri.clone()),
                );
                let reply = self.analysis.lock().unwrap().pop_front();
                Self::play(reply.unwrap_or_else(|| Reply::text(VALID_ANALYSIS)))
            }
            ModelTier::Repair => {
                self.record(CallKind::Repair, credential, None);
                let reply = self.repair.lock().unwrap().pop_front();
                Self::play(reply.unwrap_or_else(|| Reply::text("still not json {")))
            }
        }
    }
}

/// Local HTTP endpoint that answers every webhook with a fixed status and
/// keeps the bodies it received.
pub struct WebhookSink {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl WebhookSink {
    pub async fn start(status: StatusCode) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        received.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind webhook sink");
        let addr = listener.local_addr().expect("sink address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("webhook sink");
        });

        Self {
            url: format!("http://{}/hook", addr),
            received,
        }
    }

    pub fn hits(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

pub struct HarnessOptions {
    pub default_key: Option<&'static str>,
    pub poll_interval: Duration,
    pub service_max_attempts: u32,
    pub repair_max_attempts: u32,
    pub webhook_max_attempts: u32,
    pub max_input_bytes: u64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            default_key: Some(DEFAULT_KEY),
            poll_interval: Duration::from_millis(50),
            service_max_attempts: 3,
            repair_max_attempts: 3,
            webhook_max_attempts: 3,
            max_input_bytes: 1024 * 1024,
        }
    }
}

/// A scheduler wired to a fake backend, an in-memory store and a live
/// webhook dispatcher.
pub struct Harness {
    pub db: SqlitePool,
    pub vault: Arc<CredentialVault>,
    pub backend: Arc<FakeBackend>,
    pub scheduler: Scheduler,
    pub dispatcher: JoinHandle<()>,
}

impl Harness {
    pub async fn new(backend: FakeBackend) -> Self {
        Self::with_options(backend, HarnessOptions::default()).await
    }

    pub async fn with_options(backend: FakeBackend, options: HarnessOptions) -> Self {
        let db = store().await;
        let vault = Arc::new(CredentialVault::new());
        let backend = Arc::new(backend);

        let notifier = WebhookNotifier::new(WebhookSettings {
            max_attempts: options.webhook_max_attempts,
            retry_delay: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        })
        .expect("webhook client");
        let (webhooks, dispatcher) = WebhookDispatcher::spawn(notifier);

        let invoker = AnalysisInvoker::new(
            backend.clone(),
            RetryPolicy {
                max_attempts: options.service_max_attempts,
                base_delay: Duration::from_millis(5),
            },
        );

        let scheduler = Scheduler::new(
            db.clone(),
            vault.clone(),
            options.default_key.map(Credential::new),
            invoker,
            webhooks,
            WorkerSettings {
                poll_interval: options.poll_interval,
                max_input_bytes: options.max_input_bytes,
                repair_max_attempts: options.repair_max_attempts,
            },
        );

        Self {
            db,
            vault,
            backend,
            scheduler,
            dispatcher,
        }
    }

    /// Stop accepting webhook work and wait for queued deliveries to finish.
    pub async fn drain_webhooks(self) -> (SqlitePool, Arc<FakeBackend>) {
        let Harness {
            db,
            backend,
            scheduler,
            dispatcher,
            ..
        } = self;
        drop(scheduler);
        dispatcher.await.expect("dispatcher task");
        (db, backend)
    }
}

/// Write a small media file with the given extension.
pub fn media_file(extension: &str) -> tempfile::TempPath {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .suffix(&format!(".{}", extension))
        .tempfile()
        .expect("temp media file");
    file.write_all(b"\x00\x00\x00\x18ftypmp42 fake media")
        .expect("write media");
    file.into_temp_path()
}

/// Poll the store until the job is terminal.
pub async fn wait_for_terminal(db: &SqlitePool, job_id: Uuid, timeout: Duration) -> AnalysisJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = media_insight_jobs::db::queries::get_job(db, job_id)
            .await
            .expect("get job")
            .expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} still {} after {:?}",
            job_id,
            job.status,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_terminal_invariant(job: &AnalysisJob) {
    match job.status {
        JobStatus::Completed => {
            assert!(job.result.is_some(), "completed job without result");
            assert!(job.error.is_none(), "completed job with error");
        }
        JobStatus::Failed => {
            assert!(job.result.is_none(), "failed job with result");
            assert!(
                job.error.as_deref().is_some_and(|e| !e.is_empty()),
                "failed job without error"
            );
        }
        other => panic!("job is not terminal: {}", other),
    }
}
