use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use media_insight_jobs::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries},
    routes,
    services::{
        credentials::{Credential, CredentialVault},
        gemini::GeminiClient,
        invoker::AnalysisInvoker,
        scheduler::Scheduler,
        webhook::{WebhookDispatcher, WebhookNotifier},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing media-insight-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Opening job store");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to open job store");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    match queries::fail_interrupted_jobs(&db_pool).await {
        Ok(0) => {}
        Ok(count) => tracing::warn!(count = count, "Failed jobs interrupted by a previous shutdown"),
        Err(e) => tracing::error!(error = %e, "Could not fail interrupted jobs"),
    }

    if config.gemini_api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY is not set; only jobs submitted with X-Gemini-API-Key can run");
    }
    if config.api_tokens.is_empty() {
        tracing::warn!("API_TOKENS is empty; the job API is open to anyone who can reach it");
    }

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .expect("Failed to create upload directory");

    tracing::info!(
        analysis_model = %config.analysis_model,
        repair_model = %config.repair_model,
        "Initializing Gemini client"
    );
    let gemini = GeminiClient::new(
        &config.gemini_base_url,
        &config.analysis_model,
        &config.repair_model,
        Duration::from_secs(config.request_timeout_secs),
    )
    .expect("Failed to initialize Gemini client");

    let notifier =
        WebhookNotifier::new(config.webhook_settings()).expect("Failed to initialize webhook client");
    let (webhooks, dispatcher) = WebhookDispatcher::spawn(notifier);

    let vault = Arc::new(CredentialVault::new());
    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        db_pool.clone(),
        Arc::clone(&vault),
        config.gemini_api_key.clone().map(Credential::new),
        AnalysisInvoker::new(Arc::new(gemini), config.retry_policy()),
        webhooks,
        config.worker_settings(),
    );
    let scheduler = tokio::spawn(scheduler.run(shutdown.clone()));

    let state = AppState::new(db_pool, vault, &config);
    let app = routes::build_router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .expect("Server error");

    // The scheduler owns the last queue handle; once it exits the dispatcher
    // drains what is left and stops.
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Webhook dispatcher ended abnormally");
    }
    tracing::info!("Shutdown complete");
}
