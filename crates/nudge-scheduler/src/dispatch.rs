//! Dispatcher — sends due follow-ups.
//!
//! Per job, inside a Dispatch lock:
//! re-read (still pending?) → blacklist → stale reply → still inactive? →
//! compose → daily cap → send → `mark_sent` + advance, or retry with backoff.
//! Jobs in a tick run concurrently, bounded by `worker_count`; jobs not
//! started before the tick deadline stay pending for the next tick.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;

use nudge_core::config::{CampaignConfig, DispatcherConfig, outbound_backoff};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{
    ComposeRequest, ComposedMessage, MessageComposer, NotificationChannel, SendOutcome,
};
use nudge_core::types::{CampaignJob, JobStatus, LockKind};

use crate::campaign::CampaignStateMachine;
use crate::lock::RecoveryLockManager;
use crate::rate_limit::RateLimiter;
use crate::store::{FailureKind, JobStore, RetryOutcome};

/// Tuning knobs, resolved from `[dispatcher]` and `[campaign]`.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub worker_count: usize,
    pub tick_deadline: std::time::Duration,
    pub lock_ttl: Duration,
    pub compose_timeout: std::time::Duration,
    pub send_timeout: std::time::Duration,
    pub outbound_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub throttle_backoff: Duration,
    pub daily_cap: u32,
    /// Silence required before any follow-up goes out.
    pub inactivity_threshold: Duration,
}

impl DispatchSettings {
    pub fn from_config(dispatcher: &DispatcherConfig, campaign: &CampaignConfig) -> Self {
        Self {
            batch_size: dispatcher.batch_size,
            worker_count: dispatcher.worker_count.max(1),
            tick_deadline: std::time::Duration::from_secs(dispatcher.tick_deadline_secs),
            lock_ttl: Duration::seconds(dispatcher.lock_ttl_secs as i64),
            compose_timeout: std::time::Duration::from_secs(dispatcher.compose_timeout_secs),
            send_timeout: std::time::Duration::from_secs(dispatcher.send_timeout_secs),
            outbound_retries: dispatcher.outbound_retries,
            backoff_base: Duration::seconds(dispatcher.backoff_base_secs as i64),
            backoff_cap: Duration::seconds(dispatcher.backoff_cap_secs as i64),
            throttle_backoff: Duration::seconds(dispatcher.throttle_backoff_secs as i64),
            daily_cap: campaign.daily_cap,
            inactivity_threshold: Duration::seconds(campaign.inactivity_threshold_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Sent,
    Retried,
    Failed,
    /// Daily cap reached, or the user is still talking; moved later
    /// without charging an attempt.
    Deferred,
    Cancelled,
    /// Locked elsewhere, or no longer pending.
    Skipped,
    PastDeadline,
    Error,
}

/// Counters for one dispatcher tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub past_deadline: usize,
    pub errors: usize,
}

impl TickReport {
    fn count(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Sent => self.sent += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Deferred => self.deferred += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::PastDeadline => self.past_deadline += 1,
            JobOutcome::Error => self.errors += 1,
        }
    }
}

pub struct Dispatcher {
    store: JobStore,
    machine: Arc<CampaignStateMachine>,
    limiter: RateLimiter,
    locks: Arc<RecoveryLockManager>,
    composer: Arc<dyn MessageComposer>,
    channel: Arc<dyn NotificationChannel>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        machine: Arc<CampaignStateMachine>,
        locks: Arc<RecoveryLockManager>,
        composer: Arc<dyn MessageComposer>,
        channel: Arc<dyn NotificationChannel>,
        settings: DispatchSettings,
    ) -> Self {
        let limiter = RateLimiter::new(store.clone(), machine.hours().timezone());
        Self {
            store,
            machine,
            limiter,
            locks,
            composer,
            channel,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Process every job due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let jobs = self.store.due_jobs(now, self.settings.batch_size)?;
        let mut report = TickReport {
            due: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let started = Instant::now();
        let deadline = started + self.settings.tick_deadline;
        let outcomes: Vec<JobOutcome> = futures::stream::iter(jobs)
            .map(|job| self.process(job, now, started, deadline))
            .buffer_unordered(self.settings.worker_count)
            .collect()
            .await;
        for outcome in outcomes {
            report.count(outcome);
        }

        tracing::info!(
            "📤 Dispatch tick: {} due, {} sent, {} retried, {} failed, {} deferred, {} cancelled",
            report.due,
            report.sent,
            report.retried,
            report.failed,
            report.deferred,
            report.cancelled
        );
        if report.past_deadline > 0 {
            tracing::warn!(
                "⏱️ Tick deadline reached, {} job(s) left for the next tick",
                report.past_deadline
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        job: CampaignJob,
        now: DateTime<Utc>,
        started: Instant,
        deadline: Instant,
    ) -> JobOutcome {
        if Instant::now() >= deadline {
            return JobOutcome::PastDeadline;
        }
        let at = wall_clock(now, started);
        let lock = match self.locks.acquire(&job.user_id, LockKind::Dispatch, self.settings.lock_ttl, at) {
            Ok(Some(lock)) => lock,
            Ok(None) => return JobOutcome::Skipped,
            Err(e) => {
                tracing::warn!("⚠️ Lock error for job {}: {}", job.id, e);
                return JobOutcome::Error;
            }
        };

        let outcome = match self.deliver(job.id, now, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("⚠️ Job {} ({}) errored: {}", job.id, job.user_id, e);
                JobOutcome::Error
            }
        };

        if let Err(e) = self.locks.release(&lock) {
            tracing::warn!("⚠️ Failed to release lock for {}: {}", job.user_id, e);
        }
        outcome
    }

    /// The critical section. Caller holds the user's lock.
    async fn deliver(&self, job_id: i64, now: DateTime<Utc>, started: Instant) -> Result<JobOutcome> {
        // The due list was read before the lock; another worker may have finished it.
        let Some(job) = self
            .store
            .get_job(job_id)?
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_for <= now)
        else {
            tracing::debug!("Job {} no longer pending, skipping", job_id);
            return Ok(JobOutcome::Skipped);
        };
        let at = wall_clock(now, started);

        if self.store.is_blacklisted(&job.user_id)? {
            self.store.cancel_job(job.id, "user blacklisted", at)?;
            return Ok(JobOutcome::Cancelled);
        }

        let last_inbound = self.store.conversation(&job.user_id)?.map(|c| c.last_inbound_at);
        if last_inbound.is_some_and(|t| t > job.created_at) {
            self.store.cancel_job(job.id, "superseded by user reply", at)?;
            tracing::info!("↩️ Job {} for {} superseded by a reply", job.id, job.user_id);
            return Ok(JobOutcome::Cancelled);
        }

        // A job scheduled right after a reply may come due while the user is still talking.
        if let Some(quiet_at) = last_inbound
            .map(|t| t + self.settings.inactivity_threshold)
            .filter(|quiet_at| *quiet_at > at)
        {
            let resume = self.machine.hours().adjust(quiet_at);
            self.store.reschedule(job.id, resume)?;
            tracing::debug!("💤 {} still active, {} moved to {}", job.user_id, job.stage, resume);
            return Ok(JobOutcome::Deferred);
        }

        let composed = match self.compose(&job).await {
            Ok(composed) => composed,
            Err(e) => {
                let at = wall_clock(now, started);
                let retry_at = at + self.backoff(job.attempts);
                return self.fail_attempt(&job, FailureKind::Compose, &e.to_string(), retry_at, at);
            }
        };

        // The daily cap is the last gate, charged only when a send is about to happen.
        let at = wall_clock(now, started);
        if !self.limiter.try_consume(&job.user_id, self.settings.daily_cap, at)? {
            let opening = self.machine.hours().next_day_opening(at);
            self.store.reschedule(job.id, opening)?;
            tracing::info!("🚦 {} at daily cap, {} deferred to {}", job.user_id, job.stage, opening);
            return Ok(JobOutcome::Deferred);
        }

        let outcome = self.send(&job, &composed.text).await;
        let at = wall_clock(now, started);
        match outcome {
            SendOutcome::Delivered => {
                if self.store.mark_sent(job.id, at)? {
                    tracing::info!("✅ {} sent to {} ({})", job.stage, job.user_id, self.channel.name());
                    self.machine.on_sent(&job, &composed.text, &composed.template, at)?;
                    Ok(JobOutcome::Sent)
                } else {
                    // Cancelled mid-send by a reply or opt-out: ledger the send, do not advance.
                    self.machine
                        .tracker()
                        .record_sent(Some(job.id), &job.user_id, job.stage, &composed.text, &composed.template, at)?;
                    tracing::warn!("⚠️ Job {} was cancelled while in flight; delivery recorded", job.id);
                    Ok(JobOutcome::Sent)
                }
            }
            SendOutcome::RateLimited { retry_after_secs } => {
                let wait = retry_after_secs
                    .map(|s| Duration::seconds(s as i64))
                    .unwrap_or(self.settings.throttle_backoff);
                self.fail_attempt(&job, FailureKind::Transport, "transport rate limited", at + wait, at)
            }
            SendOutcome::Error(e) => {
                let retry_at = at + self.backoff(job.attempts);
                self.fail_attempt(&job, FailureKind::Transport, &e, retry_at, at)
            }
        }
    }

    async fn compose(&self, job: &CampaignJob) -> Result<ComposedMessage> {
        let request = ComposeRequest {
            user_id: job.user_id.clone(),
            stage: job.stage,
            context_snapshot: job.context_snapshot.clone(),
            last_user_message: job.last_user_message.clone(),
        };
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.settings.compose_timeout, self.composer.compose(&request)).await {
                Ok(result) => result,
                Err(_) => Err(NudgeError::Timeout(format!(
                    "{} did not answer within {:?}",
                    self.composer.name(),
                    self.settings.compose_timeout
                ))),
            };
            match result {
                Ok(composed) if composed.text.trim().is_empty() => {
                    return Err(NudgeError::Compose(format!("{} returned empty text", self.composer.name())));
                }
                Ok(composed) => return Ok(composed),
                Err(e) if e.is_retryable() && attempt < self.settings.outbound_retries => {
                    tracing::debug!("Compose retry {} for job {}: {}", attempt + 1, job.id, e);
                    tokio::time::sleep(outbound_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, job: &CampaignJob, text: &str) -> SendOutcome {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(
                self.settings.send_timeout,
                self.channel.send(&job.channel_address, text),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => SendOutcome::Error(format!(
                    "{} send timed out after {:?}",
                    self.channel.name(),
                    self.settings.send_timeout
                )),
            };
            match outcome {
                SendOutcome::Error(e) if attempt < self.settings.outbound_retries => {
                    tracing::debug!("Send retry {} for job {}: {}", attempt + 1, job.id, e);
                    tokio::time::sleep(outbound_backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn fail_attempt(
        &self,
        job: &CampaignJob,
        kind: FailureKind,
        error: &str,
        retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let retry_at = self.machine.hours().adjust(retry_at);
        match self.store.schedule_retry(job.id, retry_at, kind, error, at)? {
            RetryOutcome::Rescheduled => {
                tracing::warn!(
                    "⚠️ {:?} failure for job {} ({}), attempt {}/{}, retry at {}: {}",
                    kind,
                    job.id,
                    job.user_id,
                    job.attempts + 1,
                    job.max_attempts,
                    retry_at,
                    error
                );
                Ok(JobOutcome::Retried)
            }
            RetryOutcome::Exhausted => {
                self.machine.on_failed(job, error, at)?;
                Ok(JobOutcome::Failed)
            }
            RetryOutcome::NotPending => Ok(JobOutcome::Skipped),
        }
    }

    /// `base * 2^attempts`, capped, plus up to 10% jitter.
    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.settings.backoff_base.num_seconds().max(1);
        let cap = self.settings.backoff_cap.num_seconds().max(base);
        let delay = base.saturating_mul(2_i64.saturating_pow(attempts.min(30))).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=delay / 10);
        Duration::seconds(delay + jitter)
    }
}

/// `now` advanced by the time spent in this tick so far.
fn wall_clock(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    now + Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero())
}
