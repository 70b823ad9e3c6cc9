use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:5000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string for the job store
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Directory uploaded media is written to until its job finishes
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Upper bound for request bodies and for input files handed to the backend
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Process-wide Gemini credential used when a job brought none of its own
    #[serde(default)]
    pub gemini_api_key: Option<String>,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    /// Model used for the analysis call
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,

    /// Cheaper model used only to repair malformed JSON
    #[serde(default = "default_repair_model")]
    pub repair_model: String,

    /// Per-attempt timeout for backend HTTP calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Seconds between checks of an empty queue
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Attempt cap for transient backend failures
    #[serde(default = "default_service_max_attempts")]
    pub service_max_attempts: u32,

    /// First backoff delay; doubles on every further attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Attempt cap for AI-assisted JSON repair
    #[serde(default = "default_repair_max_attempts")]
    pub repair_max_attempts: u32,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    #[serde(default = "default_webhook_retry_delay_secs")]
    pub webhook_retry_delay_secs: u64,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Allow-list for the X-API-Key header. Empty disables the check.
    #[serde(default)]
    pub api_tokens: Vec<String>,

    /// Requests allowed per token inside one window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

/// Knobs the scheduler loop needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_input_bytes: u64,
    pub repair_max_attempts: u32,
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_database_url() -> String {
    "sqlite://jobs.db?mode=rwc".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_max_upload_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_analysis_model() -> String {
    "gemini-2.0-flash-thinking-exp-01-21".to_string()
}

fn default_repair_model() -> String {
    "gemini-2.0-flash-lite".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_service_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_repair_max_attempts() -> u32 {
    3
}

fn default_webhook_max_attempts() -> u32 {
    3
}

fn default_webhook_retry_delay_secs() -> u64 {
    60
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_rate_limit() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<Self>().map(Self::normalized)
    }

    /// Drop empty list entries and blank keys that envy passes through verbatim.
    fn normalized(mut self) -> Self {
        self.api_tokens.retain(|t| !t.trim().is_empty());
        self.gemini_api_key = self.gemini_api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_input_bytes: self.max_upload_bytes,
            repair_max_attempts: self.repair_max_attempts.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.service_max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            max_attempts: self.webhook_max_attempts.max(1),
            retry_delay: Duration::from_secs(self.webhook_retry_delay_secs),
            timeout: Duration::from_secs(self.webhook_timeout_secs),
        }
    }
}
