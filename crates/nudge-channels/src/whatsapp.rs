//! WhatsApp Business Cloud API channel.
//!
//! Sends plain text through the Graph API `/{phone_number_id}/messages`
//! endpoint. Requires an access token and a phone number ID from Meta
//! Business Suite.

use async_trait::async_trait;
use nudge_core::config::WhatsAppSettings;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{NotificationChannel, SendOutcome};

use crate::http::classify;

/// Graph API error codes for rate and spam limits.
const THROTTLE_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

pub struct WhatsAppChannel {
    settings: WhatsAppSettings,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(settings: WhatsAppSettings) -> Result<Self> {
        if settings.access_token.is_empty() {
            return Err(NudgeError::Config("WhatsApp access_token not configured".into()));
        }
        if settings.phone_number_id.is_empty() {
            return Err(NudgeError::Config("WhatsApp phone_number_id not configured".into()));
        }
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.phone_number_id
        )
    }
}

#[async_trait]
impl NotificationChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome {
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": channel_address,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text
            }
        });

        let response = match self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.settings.access_token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendOutcome::Error(format!("WhatsApp API request failed: {e}")),
        };

        let outcome = classify("whatsapp", response, THROTTLE_CODES).await;
        if outcome == SendOutcome::Delivered {
            tracing::debug!("WhatsApp message sent → {}", channel_address);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(server: &MockServer) -> WhatsAppChannel {
        WhatsAppChannel::new(WhatsAppSettings {
            access_token: "EAAG-token".into(),
            phone_number_id: "1055".into(),
            api_base: server.uri(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_sends_text_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/1055/messages"))
            .and(header("Authorization", "Bearer EAAG-token"))
            .and(body_partial_json(serde_json::json!({
                "to": "84901234567",
                "text": { "body": "Still interested?" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{ "id": "wamid.1" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = channel(&server).send("84901234567", "Still interested?").await;
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_graph_throttle_code_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 131056, "message": "pair rate limit hit" }
            })))
            .mount(&server)
            .await;

        let outcome = channel(&server).send("84901234567", "hi").await;
        assert_eq!(outcome, SendOutcome::RateLimited { retry_after_secs: None });
    }

    #[tokio::test]
    async fn test_other_errors_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 100, "message": "invalid parameter" }
            })))
            .mount(&server)
            .await;

        let outcome = channel(&server).send("bad", "hi").await;
        assert!(matches!(outcome, SendOutcome::Error(ref e) if e.contains("400")));
    }

    #[test]
    fn test_requires_credentials() {
        assert!(WhatsAppChannel::new(WhatsAppSettings::default()).is_err());
    }
}
