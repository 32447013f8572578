//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use nudge_core::traits::{ComposeRequest, ComposedMessage, MessageComposer, NotificationChannel, SendOutcome};
use nudge_core::{NudgeConfig, Result};
use nudge_scheduler::{CampaignEngine, Database};

/// Composer that names the stage in the text.
pub struct StageComposer;

#[async_trait]
impl MessageComposer for StageComposer {
    fn name(&self) -> &str {
        "stage"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
        Ok(ComposedMessage {
            text: format!("[{}] still thinking about it, {}?", request.stage, request.user_id),
            template: request.stage.to_string(),
        })
    }
}

/// Channel that records every delivery, optionally after a delay.
#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl RecordingChannel {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, channel_address: &str, text: &str) -> SendOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel_address.to_string(), text.to_string()));
        SendOutcome::Delivered
    }
}

/// Unique database path under the system temp dir.
pub fn temp_db(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("nudge-it-{}-{}", name, uuid::Uuid::new_v4()))
        .join("campaign.db")
}

pub fn cleanup(path: &std::path::Path) {
    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir).ok();
    }
}

/// UTC, 09:00–21:00, Monday–Saturday, standard stage table.
pub fn config() -> NudgeConfig {
    NudgeConfig::default()
}

/// An engine with its own connection to the database file at `path`.
pub fn engine_at(path: &std::path::Path, channel: Arc<RecordingChannel>) -> CampaignEngine {
    engine_with(path, channel, &config())
}

pub fn engine_with(path: &std::path::Path, channel: Arc<RecordingChannel>, config: &NudgeConfig) -> CampaignEngine {
    let db = Database::open(path, Duration::from_secs(5)).unwrap();
    CampaignEngine::with_database(Arc::new(db), config, Arc::new(StageComposer), channel).unwrap()
}

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}
