//! Seams to the external collaborators: message text generation and transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Stage;

/// Input to a composer for one follow-up message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub user_id: String,
    pub stage: Stage,
    pub context_snapshot: serde_json::Value,
    pub last_user_message: Option<String>,
}

/// Composed follow-up text plus the template/prompt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub text: String,
    pub template: String,
}

/// Generates follow-up text. Failures are retried by the dispatcher, not here.
#[async_trait]
pub trait MessageComposer: Send + Sync {
    fn name(&self) -> &str;

    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage>;
}

/// Result of handing a message to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Transport throttling, distinct from the per-user daily cap.
    RateLimited { retry_after_secs: Option<u64> },
    Error(String),
}

/// Delivers text to an end user.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome;
}
