//! "Tell a human" sinks.
//!
//! Sends are fire-and-forget: failures are logged, never returned. Duplicate
//! suppression by key and TTL is the sink's business.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// `dedupe_key` identifies the event; the sink may drop repeats within `ttl_secs`.
    async fn notify(&self, dedupe_key: &str, ttl_secs: u64, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, dedupe_key: &str, ttl_secs: u64, message: &str) {
        info!(key = dedupe_key, ttl_secs, "notify: {message}");
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    key: &'a str,
    ttl_secs: u64,
    text: &'a str,
}

/// Posts notifications as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, dedupe_key: &str, ttl_secs: u64, message: &str) {
        let payload = WebhookPayload {
            key: dedupe_key,
            ttl_secs,
            text: message,
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(key = dedupe_key, "webhook notification sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(key = dedupe_key, %status, %body, "webhook notification rejected");
            }
            Err(e) => warn!(key = dedupe_key, error = %e, "webhook notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "key": "finalize:7", "ttl_secs": 3600, "text": "AAPL closed"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
        notifier.notify("finalize:7", 3600, "AAPL closed").await;
    }

    #[tokio::test]
    async fn webhook_failure_does_not_panic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        notifier.notify("k", 60, "boom").await;
    }
}
