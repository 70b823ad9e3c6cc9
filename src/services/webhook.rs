use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::WebhookSettings;
use crate::models::job::JobView;

/// Best-effort delivery of terminal job records to caller callbacks.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    settings: WebhookSettings,
}

impl WebhookNotifier {
    pub fn new(settings: WebhookSettings) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { http, settings })
    }

    /// POST the record, retrying non-2xx responses and network errors after a
    /// fixed delay. Returns whether any attempt was accepted.
    pub async fn notify(&self, url: &str, record: &JobView) -> bool {
        let max_attempts = self.settings.max_attempts;
        for attempt in 1..=max_attempts {
            let outcome = self.http.post(url).json(record).send().await;
            match outcome {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        job_id = %record.job_id,
                        attempt = attempt,
                        status = response.status().as_u16(),
                        "Webhook delivered"
                    );
                    metrics::counter!("webhook_deliveries_total", "outcome" => "delivered").increment(1);
                    return true;
                }
                Ok(response) => tracing::warn!(
                    job_id = %record.job_id,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    status = response.status().as_u16(),
                    "Webhook endpoint rejected delivery"
                ),
                Err(e) => tracing::warn!(
                    job_id = %record.job_id,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Webhook delivery failed"
                ),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        tracing::error!(job_id = %record.job_id, url = %url, "Webhook not delivered, attempts exhausted");
        metrics::counter!("webhook_deliveries_total", "outcome" => "exhausted").increment(1);
        false
    }
}

#[derive(Debug)]
struct Delivery {
    url: String,
    record: JobView,
}

/// Handle for queueing deliveries onto the dispatcher task.
#[derive(Clone, Debug)]
pub struct WebhookQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl WebhookQueue {
    pub fn enqueue(&self, url: String, record: JobView) {
        let job_id = record.job_id;
        if self.tx.send(Delivery { url, record }).is_err() {
            tracing::error!(job_id = %job_id, "Webhook dispatcher is gone, delivery dropped");
        }
    }
}

/// Single task delivering webhooks in the order jobs finished, off the
/// scheduler's critical path.
pub struct WebhookDispatcher;

impl WebhookDispatcher {
    /// Start the dispatcher. It runs until every `WebhookQueue` clone is
    /// dropped, then drains what is already queued and exits.
    pub fn spawn(notifier: WebhookNotifier) -> (WebhookQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handle = tokio::spawn(async move {
            tracing::info!("Webhook dispatcher started");
            while let Some(delivery) = rx.recv().await {
                notifier.notify(&delivery.url, &delivery.record).await;
            }
            tracing::info!("Webhook dispatcher stopped");
        });
        (WebhookQueue { tx }, handle)
    }
}
