//! # Nudge Channels
//!
//! Transports that deliver follow-up text to end users.
//!
//! ```text
//! Dispatcher → NotificationChannel::send(address, text)
//!                ├── WhatsApp Cloud API (Graph /messages)
//!                ├── Telegram Bot API (sendMessage)
//!                ├── HTTP webhook (POST JSON)
//!                └── Console (log only)
//! ```
//! Every transport maps throttling (HTTP 429 and provider-specific codes) to
//! `SendOutcome::RateLimited`, so the dispatcher can back off separately from
//! the per-user daily cap.

pub mod console;
mod http;
pub mod telegram;
pub mod webhook;
pub mod whatsapp;

use std::sync::Arc;

use nudge_core::config::ChannelConfig;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::NotificationChannel;

pub use console::ConsoleChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;
pub use whatsapp::WhatsAppChannel;

/// Build the configured transport.
pub fn build_channel(config: &ChannelConfig) -> Result<Arc<dyn NotificationChannel>> {
    let channel: Arc<dyn NotificationChannel> = match config.kind.as_str() {
        "console" => Arc::new(ConsoleChannel::new()),
        "whatsapp" => {
            let settings = config
                .whatsapp
                .clone()
                .ok_or_else(|| NudgeError::Config("[channel.whatsapp] section missing".into()))?;
            Arc::new(WhatsAppChannel::new(settings)?)
        }
        "telegram" => {
            let settings = config
                .telegram
                .clone()
                .ok_or_else(|| NudgeError::Config("[channel.telegram] section missing".into()))?;
            Arc::new(TelegramChannel::new(settings)?)
        }
        "webhook" => {
            let settings = config
                .webhook
                .clone()
                .ok_or_else(|| NudgeError::Config("[channel.webhook] section missing".into()))?;
            Arc::new(WebhookChannel::new(settings)?)
        }
        other => {
            return Err(NudgeError::Config(format!(
                "unknown channel kind '{other}' (expected console, whatsapp, telegram or webhook)"
            )));
        }
    };
    tracing::info!("📡 Notification channel: {}", channel.name());
    Ok(channel)
}
