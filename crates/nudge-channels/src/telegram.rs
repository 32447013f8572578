//! Telegram Bot channel — sends via Bot API `sendMessage`.
//! The channel address is the chat id.

use async_trait::async_trait;
use nudge_core::config::TelegramSettings;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{NotificationChannel, SendOutcome};

use crate::http::classify;

pub struct TelegramChannel {
    settings: TelegramSettings,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(settings: TelegramSettings) -> Result<Self> {
        if settings.bot_token.is_empty() {
            return Err(NudgeError::Config("Telegram bot_token not configured".into()));
        }
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token,
            method
        )
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome {
        // Numeric ids go out as numbers; @channel usernames as strings.
        let chat_id = channel_address
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(channel_address));
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let response = match self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendOutcome::Error(format!("sendMessage failed: {e}")),
        };

        let outcome = classify("telegram", response, &[]).await;
        if outcome == SendOutcome::Delivered {
            tracing::debug!("Telegram message sent → chat {}", channel_address);
        }
        outcome
    }
}
