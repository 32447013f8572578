//! Console channel — logs instead of delivering. For dry runs and local testing.

use async_trait::async_trait;
use nudge_core::traits::{NotificationChannel, SendOutcome};

#[derive(Debug, Default)]
pub struct ConsoleChannel;

impl ConsoleChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome {
        tracing::info!("💬 [console] → {}: {}", channel_address, text);
        SendOutcome::Delivered
    }
}
