//! Campaign engine — wires the store, state machine, detector and dispatcher
//! together and runs them as background loops on `tokio::time::interval`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use nudge_core::NudgeConfig;
use nudge_core::error::Result;
use nudge_core::traits::{MessageComposer, NotificationChannel};
use nudge_core::types::{CampaignJob, LockKind};

use crate::business_hours::BusinessHours;
use crate::campaign::{CampaignState, CampaignStateMachine, Transition};
use crate::db::Database;
use crate::detector::{InactivityDetector, ScanReport};
use crate::dispatch::{DispatchSettings, Dispatcher, TickReport};
use crate::lock::RecoveryLockManager;
use crate::stages::StageConfig;
use crate::store::JobStore;
use crate::tracker::{FunnelStep, HourStats, StageStats, Tracker};

/// Sends needed in an hour bucket before it can win "best send hour".
const BEST_HOUR_MIN_SAMPLES: u64 = 5;

/// What handling an inbound message did.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyOutcome {
    pub cancelled: usize,
    /// Ledger entry the reply was attributed to.
    pub attributed_record: Option<i64>,
    /// New stage-0 job, unless the user is blacklisted or another worker holds the lock.
    pub restarted: Option<CampaignJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pending: u64,
    pub failed: u64,
    pub blacklisted: u64,
    pub next_scheduled: Option<DateTime<Utc>>,
    pub response_rates: Vec<StageStats>,
    pub funnel: Vec<FunnelStep>,
    pub best_send_hour: Option<HourStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// Pending jobs past due by more than one dispatcher interval.
    pub overdue: Vec<CampaignJob>,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub jobs_deleted: usize,
    pub locks_purged: usize,
}

pub struct CampaignEngine {
    store: JobStore,
    machine: Arc<CampaignStateMachine>,
    locks: Arc<RecoveryLockManager>,
    detector: InactivityDetector,
    dispatcher: Dispatcher,
    tick_interval: std::time::Duration,
    scan_interval: std::time::Duration,
    reply_lock_ttl: Duration,
    retention: Duration,
}

impl CampaignEngine {
    /// Open the configured database and build the engine.
    pub fn from_config(
        config: &NudgeConfig,
        composer: Arc<dyn MessageComposer>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self> {
        let db = Database::open(
            &config.database_path(),
            std::time::Duration::from_millis(config.database.busy_timeout_ms),
        )?;
        Self::with_database(Arc::new(db), config, composer, channel)
    }

    pub fn open(
        path: &Path,
        config: &NudgeConfig,
        composer: Arc<dyn MessageComposer>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self> {
        let db = Database::open(
            path,
            std::time::Duration::from_millis(config.database.busy_timeout_ms),
        )?;
        Self::with_database(Arc::new(db), config, composer, channel)
    }

    pub fn with_database(
        db: Arc<Database>,
        config: &NudgeConfig,
        composer: Arc<dyn MessageComposer>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let store = JobStore::new(db.clone());
        let tracker = Tracker::new(db);
        let hours = BusinessHours::from_config(&config.business_hours)?;
        let stages = StageConfig::from_config(&config.campaign)?;
        let machine = Arc::new(CampaignStateMachine::new(
            store.clone(),
            tracker,
            stages,
            hours,
            config.campaign.max_attempts,
        ));
        let locks = Arc::new(RecoveryLockManager::new(store.clone()));
        let detector = InactivityDetector::new(
            store.clone(),
            machine.clone(),
            locks.clone(),
            Duration::seconds(config.campaign.inactivity_threshold_secs as i64),
            Duration::seconds(config.detector.lock_ttl_secs as i64),
            config.detector.batch_size,
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            machine.clone(),
            locks.clone(),
            composer.clone(),
            channel.clone(),
            DispatchSettings::from_config(&config.dispatcher, &config.campaign),
        );
        tracing::info!(
            "🚀 Campaign engine ready: {} stage(s), composer={}, channel={}, worker={}",
            machine.stages().len(),
            composer.name(),
            channel.name(),
            locks.holder()
        );
        Ok(Self {
            store,
            machine,
            locks,
            detector,
            dispatcher,
            tick_interval: std::time::Duration::from_secs(config.dispatcher.tick_secs.max(1)),
            scan_interval: std::time::Duration::from_secs(config.detector.scan_interval_secs.max(1)),
            reply_lock_ttl: Duration::seconds(config.detector.lock_ttl_secs as i64),
            retention: Duration::days(config.campaign.retention_days as i64),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn machine(&self) -> &CampaignStateMachine {
        &self.machine
    }

    pub fn tracker(&self) -> &Tracker {
        self.machine.tracker()
    }

    // ─── Signals ──────────────────────────────────────

    /// Inbound message from a user: remember it, attribute it to the last
    /// follow-up, and restart the sequence from stage zero.
    pub fn on_user_message(
        &self,
        user_id: &str,
        channel_address: &str,
        text: &str,
        at: DateTime<Utc>,
        context: Option<&serde_json::Value>,
    ) -> Result<ReplyOutcome> {
        self.store
            .record_inbound(user_id, channel_address, text, at, context)?;
        let attributed = self.tracker().record_response(user_id, text, at)?;

        // Suppress what is queued even if another worker owns the user right now.
        let cancelled = self.store.cancel_all_pending(user_id, at)?;

        let mut restarted = None;
        if let Some(lock) = self.locks.acquire(user_id, LockKind::Reply, self.reply_lock_ttl, at)? {
            let result = self.machine.on_reply(user_id, at);
            self.locks.release(&lock)?;
            if let Transition::Scheduled(job) | Transition::Rescheduled(job) = result? {
                restarted = Some(job);
            }
        } else {
            tracing::debug!("{} busy elsewhere; the next scan restarts the campaign", user_id);
        }

        Ok(ReplyOutcome {
            cancelled,
            attributed_record: attributed.map(|r| r.id),
            restarted,
        })
    }

    pub fn on_blacklist(&self, user_id: &str, reason: &str, at: DateTime<Utc>) -> Result<usize> {
        self.machine.on_blacklist(user_id, reason, at)
    }

    pub fn campaign_state(&self, user_id: &str) -> Result<CampaignState> {
        self.machine.campaign_state(user_id)
    }

    // ─── Passes ──────────────────────────────────────

    pub fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        self.detector.scan(now)
    }

    pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.dispatcher.tick(now).await
    }

    /// Delete terminal jobs past retention and expired locks.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = SweepReport {
            jobs_deleted: self.store.sweep_terminal(now - self.retention)?,
            locks_purged: self.store.purge_expired_locks(now)?,
        };
        if report.jobs_deleted > 0 || report.locks_purged > 0 {
            tracing::info!(
                "🧹 Sweep: {} job(s) past retention, {} expired lock(s)",
                report.jobs_deleted,
                report.locks_purged
            );
        }
        Ok(report)
    }

    // ─── Admin ──────────────────────────────────────

    pub fn stats(&self) -> Result<EngineStats> {
        let tracker = self.tracker();
        Ok(EngineStats {
            pending: self.store.pending_count()?,
            failed: self.store.failed_count()?,
            blacklisted: self.store.blacklist_size()?,
            next_scheduled: self.store.next_scheduled()?,
            response_rates: tracker.response_rates()?,
            funnel: tracker.funnel(&self.machine.stages().numbered())?,
            best_send_hour: tracker
                .best_send_hour(self.machine.hours().timezone(), BEST_HOUR_MIN_SAMPLES)?,
        })
    }

    pub fn health(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let grace = Duration::from_std(self.tick_interval).unwrap_or_else(|_| Duration::minutes(1));
        let overdue = self.store.overdue_pending(now - grace)?;
        let failed = self.store.failed_count()?;
        for job in &overdue {
            tracing::error!(
                "🚨 Job {} for {} stuck pending since {}",
                job.id,
                job.user_id,
                job.scheduled_for
            );
        }
        Ok(HealthReport {
            healthy: overdue.is_empty(),
            overdue,
            failed,
        })
    }
}

// ─── Background loops ──────────────────────────────────────

/// Run the inactivity scan forever. Store work runs on the blocking pool.
pub async fn spawn_detector(engine: Arc<CampaignEngine>) {
    tracing::info!("🔍 Inactivity detector started (every {:?})", engine.scan_interval);
    let mut interval = tokio::time::interval(engine.scan_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let worker = engine.clone();
        let scan = tokio::task::spawn_blocking(move || worker.scan(Utc::now()));
        match tokio::time::timeout(engine.scan_interval, scan).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => tracing::warn!("⚠️ Inactivity scan failed: {e}"),
            Ok(Err(e)) => tracing::error!("❌ Inactivity scan panicked: {e}"),
            Err(_) => tracing::warn!("⏱️ Inactivity scan exceeded {:?}", engine.scan_interval),
        }
    }
}

/// Run dispatcher ticks forever, plus an hourly retention sweep.
pub async fn spawn_dispatcher(engine: Arc<CampaignEngine>) {
    tracing::info!(
        "📤 Dispatcher started (tick every {:?}, {} workers)",
        engine.tick_interval,
        engine.dispatcher.settings().worker_count
    );
    let mut interval = tokio::time::interval(engine.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_sweep: Option<DateTime<Utc>> = None;

    loop {
        interval.tick().await;
        let now = Utc::now();
        if let Err(e) = engine.dispatch(now).await {
            tracing::warn!("⚠️ Dispatch tick failed: {e}");
        }

        if last_sweep.is_none_or(|t| now - t >= Duration::hours(1)) {
            last_sweep = Some(now);
            if let Err(e) = engine.sweep(now) {
                tracing::warn!("⚠️ Sweep failed: {e}");
            }
            if let Err(e) = engine.health(now) {
                tracing::warn!("⚠️ Health check failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use nudge_core::traits::{ComposeRequest, ComposedMessage, SendOutcome};
    use nudge_core::types::Stage;

    struct Echo;

    #[async_trait]
    impl MessageComposer for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn compose(&self, request: &ComposeRequest) -> Result<ComposedMessage> {
            Ok(ComposedMessage {
                text: format!("{} for {}", request.stage, request.user_id),
                template: "echo".into(),
            })
        }
    }

    struct Sink;

    #[async_trait]
    impl NotificationChannel for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        async fn send(&self, _address: &str, _text: &str) -> SendOutcome {
            SendOutcome::Delivered
        }
    }

    fn engine() -> CampaignEngine {
        let db = Arc::new(Database::open_in_memory().unwrap());
        CampaignEngine::with_database(db, &NudgeConfig::default(), Arc::new(Echo), Arc::new(Sink))
            .unwrap()
    }

    fn wed(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_reply_attributes_and_restarts() {
        let engine = engine();
        engine.on_user_message("u1", "+8490", "hello", wed(9, 0), None).unwrap();
        engine.scan(wed(10, 30)).unwrap();
        assert_eq!(engine.dispatch(wed(11, 30)).await.unwrap().sent, 1);

        let outcome = engine.on_user_message("u1", "+8490", "tell me more", wed(12, 0), None).unwrap();
        assert_eq!(outcome.cancelled, 1);
        assert!(outcome.attributed_record.is_some());
        let restarted = outcome.restarted.unwrap();
        assert_eq!(restarted.stage, Stage::Numbered(0));
        assert_eq!(restarted.scheduled_for, wed(13, 0));

        let records = engine.tracker().records_for("u1").unwrap();
        assert!(records[0].user_responded);
        assert_eq!(records[0].effectiveness_score, Some(1.0));
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let engine = engine();
        engine.on_user_message("u1", "+1", "hi", wed(9, 0), None).unwrap();
        engine.on_user_message("u2", "+2", "hi", wed(9, 0), None).unwrap();
        engine.on_blacklist("u2", "STOP", wed(9, 1)).unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.blacklisted, 1);
        assert_eq!(stats.next_scheduled, Some(wed(10, 0)));

        assert!(engine.health(wed(10, 0)).unwrap().healthy);
        let stuck = engine.health(wed(11, 0)).unwrap();
        assert!(!stuck.healthy);
        assert_eq!(stuck.overdue.len(), 1);
        assert_eq!(engine.campaign_state("u2").unwrap(), CampaignState::Blacklisted);
    }

    #[tokio::test]
    async fn test_sweep_respects_retention() {
        let engine = engine();
        engine.on_user_message("u1", "+1", "hi", wed(9, 0), None).unwrap();
        engine.dispatch(wed(10, 0)).await.unwrap();

        assert_eq!(engine.sweep(wed(12, 0)).unwrap().jobs_deleted, 0);
        let later = wed(12, 0) + Duration::days(31);
        assert_eq!(engine.sweep(later).unwrap().jobs_deleted, 1);
    }
}
