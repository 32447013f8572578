//! Inactivity detector — finds users who went quiet and puts them on (or back
//! on) their follow-up sequence. Safe to run more often than needed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use nudge_core::error::Result;
use nudge_core::types::LockKind;

use crate::campaign::{CampaignStateMachine, Transition};
use crate::lock::RecoveryLockManager;
use crate::store::JobStore;

/// Counters for one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub candidates: usize,
    pub scheduled: usize,
    pub already_pending: usize,
    pub locked: usize,
    pub blacklisted: usize,
    pub errors: usize,
}

pub struct InactivityDetector {
    store: JobStore,
    machine: Arc<CampaignStateMachine>,
    locks: Arc<RecoveryLockManager>,
    threshold: Duration,
    lock_ttl: Duration,
    batch_size: usize,
}

impl InactivityDetector {
    pub fn new(
        store: JobStore,
        machine: Arc<CampaignStateMachine>,
        locks: Arc<RecoveryLockManager>,
        threshold: Duration,
        lock_ttl: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            machine,
            locks,
            threshold,
            lock_ttl,
            batch_size,
        }
    }

    pub fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let cutoff = now - self.threshold;
        let candidates = self.store.inactive_candidates(cutoff, self.batch_size)?;
        let mut report = ScanReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let user_id = candidate.user_id.as_str();
            let Some(lock) = self.locks.acquire(user_id, LockKind::Schedule, self.lock_ttl, now)? else {
                report.locked += 1;
                continue;
            };
            let outcome = self.schedule_locked(user_id, cutoff, now);
            if let Err(e) = self.locks.release(&lock) {
                tracing::warn!("⚠️ Failed to release lock for {}: {}", user_id, e);
            }
            match outcome {
                Ok(Some(Transition::Scheduled(_) | Transition::Rescheduled(_))) => report.scheduled += 1,
                Ok(Some(Transition::AlreadyPending)) | Ok(None) => report.already_pending += 1,
                Ok(Some(Transition::Blacklisted)) => report.blacklisted += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Inactivity scan failed for {}: {}", user_id, e);
                    report.errors += 1;
                }
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                "🔍 Inactivity scan: {} candidate(s), {} scheduled, {} locked elsewhere",
                report.candidates,
                report.scheduled,
                report.locked
            );
        }
        Ok(report)
    }

    /// Re-check under the lock: the candidate list was read before it was taken.
    fn schedule_locked(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        let Some(conversation) = self.store.conversation(user_id)? else {
            return Ok(None);
        };
        if conversation.last_inbound_at > cutoff || !self.store.pending_jobs_for(user_id)?.is_empty() {
            return Ok(None);
        }
        self.machine.start_or_continue(&conversation, now).map(Some)
    }
}
