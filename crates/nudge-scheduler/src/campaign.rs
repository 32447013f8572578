//! Campaign state machine — stage transitions for one user's follow-up sequence.
//!
//! ```text
//! NONE → STAGE[0] pending → sent → STAGE[1] pending → ... → MAINTENANCE (recurs)
//!   any inbound reply: cancel pending, restart at STAGE[0] from now
//!   blacklist: cancel pending, absorbing
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{CampaignJob, ConversationState, JobStatus, Stage};

use crate::business_hours::BusinessHours;
use crate::stages::StageConfig;
use crate::store::{JobStore, NewJob};
use crate::tracker::Tracker;

/// What a scheduling call did.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A new pending job was created.
    Scheduled(CampaignJob),
    /// The existing pending job for that stage got a new time and context.
    Rescheduled(CampaignJob),
    /// Another worker already created the pending job; nothing to do.
    AlreadyPending,
    /// The user opted out; nothing will be scheduled.
    Blacklisted,
}

impl Transition {
    pub fn job(&self) -> Option<&CampaignJob> {
        match self {
            Transition::Scheduled(job) | Transition::Rescheduled(job) => Some(job),
            _ => None,
        }
    }
}

/// Where a user currently is in the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum CampaignState {
    None,
    Pending(Stage),
    Sent(Stage),
    Failed(Stage),
    Blacklisted,
}

pub struct CampaignStateMachine {
    store: JobStore,
    tracker: Tracker,
    stages: StageConfig,
    hours: BusinessHours,
    max_attempts: u32,
}

impl CampaignStateMachine {
    pub fn new(
        store: JobStore,
        tracker: Tracker,
        stages: StageConfig,
        hours: BusinessHours,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            tracker,
            stages,
            hours,
            max_attempts,
        }
    }

    pub fn stages(&self) -> &StageConfig {
        &self.stages
    }

    pub fn hours(&self) -> &BusinessHours {
        &self.hours
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Schedule the first stage at `adjust(now + delay(first))`, replacing any
    /// pending first-stage job.
    pub fn start(&self, conversation: &ConversationState, now: DateTime<Utc>) -> Result<Transition> {
        if self.store.is_blacklisted(&conversation.user_id)? {
            return Ok(Transition::Blacklisted);
        }
        let stage = self.stages.first();
        let at = self.schedule_time(&conversation.user_id, stage, now)?;
        let upserted = self.store.upsert_pending(&self.new_job(conversation, stage, at), now)?;
        tracing::info!(
            "📅 {} campaign {} at {} ({})",
            conversation.user_id,
            if upserted.created { "started" } else { "refreshed" },
            upserted.job.scheduled_for,
            stage
        );
        Ok(if upserted.created {
            Transition::Scheduled(upserted.job)
        } else {
            Transition::Rescheduled(upserted.job)
        })
    }

    /// Resume after the most recent processed job since the user's last
    /// message, or start fresh if there is none. Used by the inactivity scan.
    pub fn start_or_continue(
        &self,
        conversation: &ConversationState,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if self.store.is_blacklisted(&conversation.user_id)? {
            return Ok(Transition::Blacklisted);
        }
        let Some(last) = self
            .store
            .last_processed_since(&conversation.user_id, conversation.last_inbound_at)?
        else {
            return self.start(conversation, now);
        };

        let next = self.stages.next_stage(last.stage);
        let base = last.processed_at.unwrap_or(now);
        let at = self.schedule_time(&conversation.user_id, next, base)?.max(self.hours.adjust(now));
        let upserted = self.store.upsert_pending(&self.new_job(conversation, next, at), now)?;
        tracing::info!(
            "🔁 {} campaign continued after {} → {} at {}",
            conversation.user_id,
            last.stage,
            next,
            upserted.job.scheduled_for
        );
        Ok(if upserted.created {
            Transition::Scheduled(upserted.job)
        } else {
            Transition::Rescheduled(upserted.job)
        })
    }

    /// Ledger the send and schedule the following stage relative to `sent_at`.
    pub fn on_sent(
        &self,
        job: &CampaignJob,
        message: &str,
        template: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Transition> {
        self.tracker
            .record_sent(Some(job.id), &job.user_id, job.stage, message, template, sent_at)?;

        if self.store.is_blacklisted(&job.user_id)? {
            return Ok(Transition::Blacklisted);
        }

        let next = self.stages.next_stage(job.stage);
        let at = self.schedule_time(&job.user_id, next, sent_at)?;
        let conversation = self
            .store
            .conversation(&job.user_id)?
            .unwrap_or_else(|| ConversationState {
                user_id: job.user_id.clone(),
                channel_address: job.channel_address.clone(),
                last_inbound_at: job.created_at,
                last_user_message: job.last_user_message.clone(),
                context: job.context_snapshot.clone(),
            });

        match self.store.insert_pending(&self.new_job(&conversation, next, at), sent_at) {
            Ok(created) => {
                tracing::info!(
                    "➡️ {} advanced {} → {} at {}",
                    job.user_id,
                    job.stage,
                    next,
                    created.scheduled_for
                );
                Ok(Transition::Scheduled(created))
            }
            Err(NudgeError::Conflict(_)) => {
                tracing::debug!("{} already has a pending {} job", job.user_id, next);
                Ok(Transition::AlreadyPending)
            }
            Err(e) => Err(e),
        }
    }

    /// Ledger a job that exhausted its attempts. The next inactivity scan
    /// continues the campaign after it.
    pub fn on_failed(&self, job: &CampaignJob, error: &str, at: DateTime<Utc>) -> Result<()> {
        self.tracker
            .record_failed(job.id, &job.user_id, job.stage, error, at)?;
        tracing::error!(
            "❌ {} {} failed after {} attempts: {}",
            job.user_id,
            job.stage,
            job.max_attempts,
            error
        );
        Ok(())
    }

    /// Any inbound reply restarts the sequence from stage zero.
    pub fn on_reply(&self, user_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let cancelled = self.store.cancel_all_pending(user_id, now)?;
        if cancelled > 0 {
            tracing::info!("↩️ {} replied — cancelled {} pending follow-up(s)", user_id, cancelled);
        }
        let conversation = self
            .store
            .conversation(user_id)?
            .ok_or_else(|| NudgeError::NotFound(format!("conversation for {user_id}")))?;
        self.start(&conversation, now)
    }

    /// Opt-out: record it and cancel everything pending. Absorbing.
    pub fn on_blacklist(&self, user_id: &str, reason: &str, now: DateTime<Utc>) -> Result<usize> {
        self.store.add_to_blacklist(user_id, reason, now)?;
        let cancelled = self.store.cancel_all_pending(user_id, now)?;
        tracing::info!("⛔ {} blacklisted ({}), cancelled {} job(s)", user_id, reason, cancelled);
        Ok(cancelled)
    }

    pub fn campaign_state(&self, user_id: &str) -> Result<CampaignState> {
        if self.store.is_blacklisted(user_id)? {
            return Ok(CampaignState::Blacklisted);
        }
        let jobs = self.store.jobs_for(user_id)?;
        if let Some(pending) = jobs.iter().find(|j| j.status == JobStatus::Pending) {
            return Ok(CampaignState::Pending(pending.stage));
        }
        let last = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Sent | JobStatus::Failed))
            .max_by_key(|j| (j.processed_at, j.id));
        Ok(match last {
            Some(job) if job.status == JobStatus::Sent => CampaignState::Sent(job.stage),
            Some(job) => CampaignState::Failed(job.stage),
            None => CampaignState::None,
        })
    }

    /// `adjust(base + delay(stage))`, pushed past the cooldown since the last send.
    fn schedule_time(&self, user_id: &str, stage: Stage, base: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut at = base + self.stages.delay_for(stage);
        if let Some(last_sent) = self.store.last_sent_at(user_id)? {
            at = at.max(last_sent + self.stages.cooldown());
        }
        Ok(self.hours.adjust(at))
    }

    fn new_job(&self, conversation: &ConversationState, stage: Stage, at: DateTime<Utc>) -> NewJob {
        NewJob {
            user_id: conversation.user_id.clone(),
            channel_address: conversation.channel_address.clone(),
            stage,
            scheduled_for: at,
            context_snapshot: conversation.context.clone(),
            last_user_message: conversation.last_user_message.clone(),
            max_attempts: self.max_attempts,
        }
    }
}
