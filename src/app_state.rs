use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::auth::AccessControl;
use crate::services::credentials::CredentialVault;
use crate::services::downloader::MediaDownloader;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub vault: Arc<CredentialVault>,
    pub access: Arc<AccessControl>,
    pub downloader: Arc<MediaDownloader>,
    pub upload_dir: Arc<PathBuf>,
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn new(db: SqlitePool, vault: Arc<CredentialVault>, config: &AppConfig) -> Self {
        let access = AccessControl::new(
            &config.api_tokens,
            config.rate_limit,
            std::time::Duration::from_secs(config.rate_limit_window_secs),
        );
        let downloader = MediaDownloader::new(
            config.max_upload_bytes,
            std::time::Duration::from_secs(config.request_timeout_secs),
        );
        Self {
            db,
            vault,
            access: Arc::new(access),
            downloader: Arc::new(downloader),
            upload_dir: Arc::new(PathBuf::from(&config.upload_dir)),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}
