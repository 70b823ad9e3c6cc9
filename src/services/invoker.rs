use std::future::Future;
use std::sync::Arc;

use crate::config::RetryPolicy;
use crate::services::backend::{AnalysisBackend, GenerateRequest, ModelTier, ServiceError};
use crate::services::credentials::Credential;
use crate::services::media::MediaInput;

/// Runs analysis calls against the backend with bounded exponential backoff.
///
/// Only `ServiceError::Transient` is retried. Auth and fatal errors, and the
/// error of the final attempt, are returned as-is.
#[derive(Clone)]
pub struct AnalysisInvoker {
    backend: Arc<dyn AnalysisBackend>,
    policy: RetryPolicy,
}

impl AnalysisInvoker {
    pub fn new(backend: Arc<dyn AnalysisBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &dyn AnalysisBackend {
        self.backend.as_ref()
    }

    /// Stage the media and run the analysis prompt over it. Each step gets
    /// its own retry budget, so a generation retry never re-uploads.
    pub async fn invoke(
        &self,
        media: &MediaInput,
        credential: &Credential,
        instructions: &str,
    ) -> Result<String, ServiceError> {
        let staged = self
            .with_retry("stage_media", || self.backend.stage_media(media, credential))
            .await?;

        self.with_retry("generate", || {
            self.backend.generate(
                GenerateRequest {
                    tier: ModelTier::Analysis,
                    media: Some(&staged),
                    prompt: instructions,
                },
                credential,
            )
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient analysis service error, backing off"
                    );
                    metrics::counter!("analysis_service_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Analysis service call failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::StagedMedia;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        stage: Mutex<VecDeque<Result<StagedMedia, ServiceError>>>,
        generate: Mutex<VecDeque<Result<String, ServiceError>>>,
        stage_calls: Mutex<u32>,
        generate_calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(
            stage: Vec<Result<StagedMedia, ServiceError>>,
            generate: Vec<Result<String, ServiceError>>,
        ) -> Self {
            Self {
                stage: Mutex::new(stage.into()),
                generate: Mutex::new(generate.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl AnalysisBackend for Scripted {
        async fn stage_media(
            &self,
            _media: &MediaInput,
            _credential: &Credential,
        ) -> Result<StagedMedia, ServiceError> {
            *self.stage_calls.lock().unwrap() += 1;
            self.stage.lock().unwrap().pop_front().unwrap_or_else(|| Ok(staged()))
        }

        async fn generate(
            &self,
            _request: GenerateRequest<'_>,
            _credential: &Credential,
        ) -> Result<String, ServiceError> {
            *self.generate_calls.lock().unwrap() += 1;
            self.generate
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Fatal("script exhausted".into())))
        }
    }

    fn staged() -> StagedMedia {
        StagedMedia {
            uri: "files/abc".into(),
            mime_type: "video/mp4".into(),
        }
    }

    fn media() -> MediaInput {
        MediaInput::Remote {
            uri: "https://example.com/a.mp4".into(),
            mime_type: "video/mp4".into(),
        }
    }

    fn invoker(backend: Arc<Scripted>, max_attempts: u32) -> AnalysisInvoker {
        AnalysisInvoker::new(
            backend,
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(100),
            },
        )
    }

    fn busy() -> ServiceError {
        ServiceError::Transient("503 overloaded".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_with_doubling_backoff() {
        let backend = Arc::new(Scripted::new(vec![], vec![Err(busy()), Err(busy()), Ok("{}".into())]));
        let started = tokio::time::Instant::now();

        let text = invoker(backend.clone(), 3)
            .invoke(&media(), &Credential::new("k"), "analyze")
            .await
            .unwrap();

        assert_eq!(text, "{}");
        assert_eq!(*backend.generate_calls.lock().unwrap(), 3);
        // 100ms after the first failure, 200ms after the second
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_transient_error_propagates_at_cap() {
        let backend = Arc::new(Scripted::new(vec![], vec![Err(busy()), Err(busy()), Err(busy()), Ok("{}".into())]));
        let err = invoker(backend.clone(), 3)
            .invoke(&media(), &Credential::new("k"), "analyze")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(*backend.generate_calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let backend = Arc::new(Scripted::new(
            vec![],
            vec![Err(ServiceError::Auth("401".into())), Ok("{}".into())],
        ));
        let started = tokio::time::Instant::now();
        let err = invoker(backend.clone(), 5)
            .invoke(&media(), &Credential::new("k"), "analyze")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Auth(_)));
        assert_eq!(*backend.generate_calls.lock().unwrap(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_retry_does_not_restage() {
        let backend = Arc::new(Scripted::new(
            vec![Err(busy()), Ok(staged())],
            vec![Err(busy()), Ok("done".into())],
        ));
        invoker(backend.clone(), 3)
            .invoke(&media(), &Credential::new("k"), "analyze")
            .await
            .unwrap();
        assert_eq!(*backend.stage_calls.lock().unwrap(), 2);
        assert_eq!(*backend.generate_calls.lock().unwrap(), 2);
    }
}
