//! Composer failover — try primary → fallback₁ → fallback₂.
//! A composer that keeps failing is skipped until its cooldown passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{ComposeRequest, ComposedMessage, MessageComposer};

const MAX_FAILURES: u32 = 3;
const COOLDOWN_SECS: u64 = 60;

/// Per-composer health tracking.
struct ComposerSlot {
    composer: Arc<dyn MessageComposer>,
    /// Consecutive failure count.
    failures: AtomicU32,
    /// Unix secs of the last failure, 0 = never.
    last_failure: AtomicU64,
}

impl ComposerSlot {
    fn new(composer: Arc<dyn MessageComposer>) -> Self {
        Self {
            composer,
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
        }
    }

    fn is_healthy(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < MAX_FAILURES {
            return true;
        }
        unix_now().saturating_sub(self.last_failure.load(Ordering::Relaxed)) > COOLDOWN_SECS
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(unix_now(), Ordering::Relaxed);
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct FailoverComposer {
    slots: Vec<ComposerSlot>,
}

impl FailoverComposer {
    /// First composer is primary, the rest are fallbacks in order.
    pub fn new(composers: Vec<Arc<dyn MessageComposer>>) -> Result<Self> {
        if composers.is_empty() {
            return Err(NudgeError::Config("failover chain needs at least one composer".into()));
        }
        Ok(Self {
            slots: composers.into_iter().map(ComposerSlot::new).collect(),
        })
    }

    pub fn chain_len(&self) -> usize {
        self.slots.len()
    }

    /// (name, healthy, consecutive failures) per composer.
    pub fn health_status(&self) -> Vec<(&str, bool, u32)> {
        self.slots
            .iter()
            .map(|s| {
                (
                    s.composer.name(),
                    s.is_healthy(),
                    s.failures.load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

#[async_trait]
impl MessageComposer for FailoverComposer {
    fn name(&self) -> &str {
        self.slots
            .first()
            .map(|s| s.composer.name())
            .unwrap_or("failover")
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
        let mut last_error = None;

        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.is_healthy() {
                tracing::debug!(
                    "⏭️ Skipping unhealthy composer: {} ({} failures)",
                    slot.composer.name(),
                    slot.failures.load(Ordering::Relaxed)
                );
                continue;
            }

            match slot.composer.compose(request).await {
                Ok(message) => {
                    if idx > 0 {
                        tracing::info!(
                            "🔄 Failover: {} → {} (success)",
                            self.slots[0].composer.name(),
                            slot.composer.name()
                        );
                    }
                    slot.record_success();
                    return Ok(message);
                }
                Err(e) => {
                    slot.record_failure();
                    tracing::warn!(
                        "⚠️ Composer {} failed ({} in a row): {}",
                        slot.composer.name(),
                        slot.failures.load(Ordering::Relaxed),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NudgeError::Compose("all composers unhealthy".into())))
    }
}
