//! Generic HTTP webhook — POST `{ "to", "text" }` as JSON with custom headers.

use async_trait::async_trait;
use nudge_core::config::WebhookSettings;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{NotificationChannel, SendOutcome};

use crate::http::classify;

pub struct WebhookChannel {
    settings: WebhookSettings,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(settings: WebhookSettings) -> Result<Self> {
        if !settings.url.starts_with("http://") && !settings.url.starts_with("https://") {
            return Err(NudgeError::Config(format!(
                "webhook url must be http(s): '{}'",
                settings.url
            )));
        }
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome {
        let mut request = self.client.post(&self.settings.url).json(&serde_json::json!({
            "to": channel_address,
            "text": text,
        }));
        for (key, value) in &self.settings.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => classify("webhook", response, &[]).await,
            Err(e) => SendOutcome::Error(format!("Webhook request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/nudge"))
            .and(header("X-Api-Key", "s3cret"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(WebhookSettings {
            url: format!("{}/hooks/nudge", server.uri()),
            headers: BTreeMap::from([("X-Api-Key".to_string(), "s3cret".to_string())]),
        })
        .unwrap();
        assert_eq!(channel.send("u1", "hi").await, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_retry_after_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(WebhookSettings {
            url: server.uri(),
            headers: BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(
            channel.send("u1", "hi").await,
            SendOutcome::RateLimited { retry_after_secs: Some(30) }
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        let settings = WebhookSettings {
            url: "ftp://example.com".into(),
            headers: BTreeMap::new(),
        };
        assert!(WebhookChannel::new(settings).is_err());
    }
}
