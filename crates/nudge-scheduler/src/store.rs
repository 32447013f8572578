//! Job store — durable CRUD for campaign jobs, plus the rate-limit, lock,
//! blacklist and conversation rows the engine reads and writes.
//!
//! Every state transition is one conditional SQL statement guarded by
//! `status = 'pending'`, so two workers racing on the same job cannot both
//! win. The partial unique index on `(user_id, stage) WHERE status = 'pending'`
//! is the correctness backstop for job creation.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::sync::Arc;

use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{BlacklistEntry, CampaignJob, ConversationState, JobStatus, LockKind, Stage};

use crate::db::{Database, conversion_error, parse_opt_ts, parse_ts, ts};

const JOB_COLUMNS: &str = "id, user_id, channel_address, stage, scheduled_for, status, attempts, \
     max_attempts, compose_failures, transport_failures, context_snapshot, last_user_message, \
     last_error, created_at, processed_at, next_retry_at, revision";

/// Data for a job about to be created or refreshed.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub channel_address: String,
    pub stage: Stage,
    pub scheduled_for: DateTime<Utc>,
    pub context_snapshot: serde_json::Value,
    pub last_user_message: Option<String>,
    pub max_attempts: u32,
}

/// Result of [`JobStore::upsert_pending`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub job: CampaignJob,
    /// False when an existing pending job was refreshed in place.
    pub created: bool,
}

/// Which collaborator a failed attempt is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Compose,
    Transport,
}

/// Result of [`JobStore::schedule_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled,
    /// Attempt budget spent; the job is now failed.
    Exhausted,
    /// Another worker already moved the job out of pending.
    NotPending,
}

/// SQLite-backed store for campaign state.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ─── Campaign Jobs ──────────────────────────────────────

    /// Insert a pending job, or replace schedule and context of the existing
    /// pending job for the same (user, stage). One atomic statement.
    pub fn upsert_pending(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Upserted> {
        let sql = format!(
            "INSERT INTO campaign_jobs
                (user_id, channel_address, stage, scheduled_for, status, max_attempts,
                 context_snapshot, last_user_message, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, stage) WHERE status = 'pending' DO UPDATE SET
                channel_address = excluded.channel_address,
                scheduled_for = excluded.scheduled_for,
                context_snapshot = excluded.context_snapshot,
                last_user_message = excluded.last_user_message,
                max_attempts = excluded.max_attempts,
                revision = revision + 1
             RETURNING {JOB_COLUMNS}"
        );
        let (job, revision) = self.db.with_conn("Upsert job", |conn| {
            conn.query_row(
                &sql,
                params![
                    job.user_id,
                    job.channel_address,
                    job.stage.key(),
                    ts(&job.scheduled_for),
                    job.max_attempts,
                    job.context_snapshot.to_string(),
                    job.last_user_message,
                    ts(&now),
                ],
                |row| Ok((row_to_job(row)?, row.get::<_, i64>(16)?)),
            )
        })?;
        Ok(Upserted {
            job,
            created: revision == 0,
        })
    }

    /// Plain insert. A second pending job for the same (user, stage) fails
    /// fast with [`NudgeError::Conflict`].
    pub fn insert_pending(&self, job: &NewJob, now: DateTime<Utc>) -> Result<CampaignJob> {
        let sql = format!(
            "INSERT INTO campaign_jobs
                (user_id, channel_address, stage, scheduled_for, status, max_attempts,
                 context_snapshot, last_user_message, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)
             RETURNING {JOB_COLUMNS}"
        );
        self.db.with_conn("Insert job", |conn| {
            conn.query_row(
                &sql,
                params![
                    job.user_id,
                    job.channel_address,
                    job.stage.key(),
                    ts(&job.scheduled_for),
                    job.max_attempts,
                    job.context_snapshot.to_string(),
                    job.last_user_message,
                    ts(&now),
                ],
                row_to_job,
            )
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<CampaignJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM campaign_jobs WHERE id = ?1");
        self.db.with_conn("Get job", |conn| {
            conn.query_row(&sql, [id], row_to_job).optional()
        })
    }

    /// Pending jobs due at or before `before`, oldest first. Blacklisted users
    /// are excluded even if a pending row still exists for them.
    pub fn due_jobs(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<CampaignJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM campaign_jobs j
             WHERE j.status = 'pending' AND j.scheduled_for <= ?1
               AND NOT EXISTS (SELECT 1 FROM blacklist b WHERE b.user_id = j.user_id)
             ORDER BY j.scheduled_for, j.id
             LIMIT ?2"
        );
        self.db.with_conn("Due jobs", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![ts(&before), limit as i64], row_to_job)?;
            rows.collect()
        })
    }

    /// pending → sent. Returns false if the job was not pending.
    pub fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "Mark sent",
            "UPDATE campaign_jobs SET status = 'sent', processed_at = ?2, next_retry_at = NULL
             WHERE id = ?1 AND status = 'pending'",
            params![id, ts(&at)],
        )
    }

    /// pending → failed. Returns false if the job was not pending.
    pub fn mark_failed(&self, id: i64, error: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "Mark failed",
            "UPDATE campaign_jobs SET status = 'failed', last_error = ?2, processed_at = ?3,
                 next_retry_at = NULL
             WHERE id = ?1 AND status = 'pending'",
            params![id, error, ts(&at)],
        )
    }

    /// pending → cancelled for a single job.
    pub fn cancel_job(&self, id: i64, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "Cancel job",
            "UPDATE campaign_jobs SET status = 'cancelled', last_error = ?2, processed_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, reason, ts(&at)],
        )
    }

    /// Cancel every pending job of a user. Jobs already mid-send are untouched.
    pub fn cancel_all_pending(&self, user_id: &str, at: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn("Cancel pending", |conn| {
            conn.execute(
                "UPDATE campaign_jobs SET status = 'cancelled', processed_at = ?2
                 WHERE user_id = ?1 AND status = 'pending'",
                params![user_id, ts(&at)],
            )
        })
    }

    /// Count a failed attempt. Reschedules to `next_retry_at` (already
    /// business-hours adjusted) or fails the job once `max_attempts` is reached.
    pub fn schedule_retry(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        kind: FailureKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        let (compose, transport) = match kind {
            FailureKind::Compose => (1, 0),
            FailureKind::Transport => (0, 1),
        };
        let status: Option<String> = self.db.with_conn("Schedule retry", |conn| {
            conn.query_row(
                "UPDATE campaign_jobs SET
                    attempts = attempts + 1,
                    compose_failures = compose_failures + ?2,
                    transport_failures = transport_failures + ?3,
                    last_error = ?4,
                    status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                    processed_at = CASE WHEN attempts + 1 >= max_attempts THEN ?5 ELSE processed_at END,
                    next_retry_at = CASE WHEN attempts + 1 >= max_attempts THEN NULL ELSE ?6 END,
                    scheduled_for = CASE WHEN attempts + 1 >= max_attempts THEN scheduled_for ELSE ?6 END
                 WHERE id = ?1 AND status = 'pending'
                 RETURNING status",
                params![id, compose, transport, error, ts(&now), ts(&next_retry_at)],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(match status.as_deref() {
            None => RetryOutcome::NotPending,
            Some("failed") => RetryOutcome::Exhausted,
            Some(_) => RetryOutcome::Rescheduled,
        })
    }

    /// Move a pending job to a new time without charging an attempt.
    pub fn reschedule(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "Reschedule",
            "UPDATE campaign_jobs SET scheduled_for = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, ts(&at)],
        )
    }

    pub fn pending_jobs_for(&self, user_id: &str) -> Result<Vec<CampaignJob>> {
        self.jobs_where("Pending for user", "user_id = ?1 AND status = 'pending'", user_id)
    }

    pub fn jobs_for(&self, user_id: &str) -> Result<Vec<CampaignJob>> {
        self.jobs_where("Jobs for user", "user_id = ?1", user_id)
    }

    /// Most recent processed (sent or failed) job created at or after `since`.
    pub fn last_processed_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CampaignJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM campaign_jobs
             WHERE user_id = ?1 AND created_at >= ?2 AND status IN ('sent', 'failed')
             ORDER BY processed_at DESC, id DESC LIMIT 1"
        );
        self.db.with_conn("Last processed", |conn| {
            conn.query_row(&sql, params![user_id, ts(&since)], row_to_job).optional()
        })
    }

    /// Time of the user's most recent successful follow-up.
    pub fn last_sent_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.db.with_conn("Last sent", |conn| {
            conn.query_row(
                "SELECT MAX(processed_at) FROM campaign_jobs WHERE user_id = ?1 AND status = 'sent'",
                [user_id],
                |row| row.get(0),
            )
        })?;
        raw.map(|s| parse_ts(0, &s).map_err(|e| NudgeError::Database(e.to_string())))
            .transpose()
    }

    fn jobs_where(&self, context: &str, clause: &str, user_id: &str) -> Result<Vec<CampaignJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM campaign_jobs WHERE {clause} ORDER BY id");
        self.db.with_conn(context, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([user_id], row_to_job)?;
            rows.collect()
        })
    }

    fn transition(&self, context: &str, sql: &str, params: impl rusqlite::Params) -> Result<bool> {
        let changed = self
            .db
            .with_conn(context, |conn| conn.execute(sql, params))?;
        Ok(changed == 1)
    }

    // ─── Rate Limits ──────────────────────────────────────

    /// Atomically take one unit of the user's daily quota for `today`.
    /// The counter resets when its stored date differs from `today`.
    pub fn consume_daily_quota(&self, user_id: &str, today: NaiveDate, cap: u32) -> Result<bool> {
        if cap == 0 {
            return Ok(false);
        }
        let today = today.format("%Y-%m-%d").to_string();
        let count: Option<i64> = self.db.with_conn("Consume quota", |conn| {
            conn.query_row(
                "INSERT INTO rate_limits (user_id, daily_count, reset_date) VALUES (?1, 1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                    daily_count = CASE WHEN rate_limits.reset_date = excluded.reset_date
                                       THEN rate_limits.daily_count + 1 ELSE 1 END,
                    reset_date = excluded.reset_date
                 WHERE rate_limits.reset_date <> excluded.reset_date
                    OR rate_limits.daily_count < ?3
                 RETURNING daily_count",
                params![user_id, today, cap],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(count.is_some())
    }

    /// Current (count, date) for a user.
    pub fn daily_count(&self, user_id: &str) -> Result<Option<(u32, String)>> {
        self.db.with_conn("Daily count", |conn| {
            conn.query_row(
                "SELECT daily_count, reset_date FROM rate_limits WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    // ─── Recovery Locks ──────────────────────────────────────

    /// Take the user's lock if it is free or expired.
    pub fn try_lock(
        &self,
        user_id: &str,
        kind: LockKind,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.db.with_conn("Acquire lock", |conn| {
            conn.execute(
                "INSERT INTO recovery_locks (user_id, lock_kind, holder, locked_until)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    lock_kind = excluded.lock_kind,
                    holder = excluded.holder,
                    locked_until = excluded.locked_until
                 WHERE recovery_locks.locked_until <= ?5",
                params![user_id, kind.as_str(), holder, ts(&until), ts(&now)],
            )
        })?;
        Ok(changed == 1)
    }

    /// Release the user's lock if `holder` still owns it.
    pub fn unlock(&self, user_id: &str, holder: &str) -> Result<bool> {
        self.transition(
            "Release lock",
            "DELETE FROM recovery_locks WHERE user_id = ?1 AND holder = ?2",
            params![user_id, holder],
        )
    }

    pub fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn("Purge locks", |conn| {
            conn.execute(
                "DELETE FROM recovery_locks WHERE locked_until <= ?1",
                [ts(&now)],
            )
        })
    }

    // ─── Blacklist ──────────────────────────────────────

    /// Record an opt-out. Re-adding keeps the original entry.
    pub fn add_to_blacklist(&self, user_id: &str, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "Blacklist",
            "INSERT OR IGNORE INTO blacklist (user_id, reason, added_at) VALUES (?1, ?2, ?3)",
            params![user_id, reason, ts(&at)],
        )
    }

    pub fn is_blacklisted(&self, user_id: &str) -> Result<bool> {
        self.db.with_conn("Is blacklisted", |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM blacklist WHERE user_id = ?1)",
                [user_id],
                |row| row.get(0),
            )
        })
    }

    pub fn blacklist_entry(&self, user_id: &str) -> Result<Option<BlacklistEntry>> {
        self.db.with_conn("Blacklist entry", |conn| {
            conn.query_row(
                "SELECT user_id, reason, added_at FROM blacklist WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(BlacklistEntry {
                        user_id: row.get(0)?,
                        reason: row.get(1)?,
                        added_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn blacklist_size(&self) -> Result<u64> {
        self.count("Blacklist size", "SELECT COUNT(*) FROM blacklist")
    }

    // ─── Conversations ──────────────────────────────────────

    /// Record an inbound user message. `last_inbound_at` only moves forward.
    pub fn record_inbound(
        &self,
        user_id: &str,
        channel_address: &str,
        text: &str,
        at: DateTime<Utc>,
        context: Option<&serde_json::Value>,
    ) -> Result<()> {
        let context = context.map(|c| c.to_string());
        self.db.with_conn("Record inbound", |conn| {
            conn.execute(
                "INSERT INTO conversations (user_id, channel_address, last_inbound_at, last_user_message, context)
                 VALUES (?1, ?2, ?3, ?4, COALESCE(?5, '{}'))
                 ON CONFLICT(user_id) DO UPDATE SET
                    channel_address = excluded.channel_address,
                    last_user_message = CASE WHEN excluded.last_inbound_at >= conversations.last_inbound_at
                                             THEN excluded.last_user_message ELSE conversations.last_user_message END,
                    last_inbound_at = MAX(conversations.last_inbound_at, excluded.last_inbound_at),
                    context = COALESCE(?5, conversations.context)",
                params![user_id, channel_address, ts(&at), text, context],
            )
        })?;
        Ok(())
    }

    pub fn conversation(&self, user_id: &str) -> Result<Option<ConversationState>> {
        self.db.with_conn("Conversation", |conn| {
            conn.query_row(
                "SELECT user_id, channel_address, last_inbound_at, last_user_message, context
                 FROM conversations WHERE user_id = ?1",
                [user_id],
                row_to_conversation,
            )
            .optional()
        })
    }

    /// Users silent since `cutoff`, not blacklisted, with no pending job.
    pub fn inactive_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConversationState>> {
        self.db.with_conn("Inactive candidates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.user_id, c.channel_address, c.last_inbound_at, c.last_user_message, c.context
                 FROM conversations c
                 WHERE c.last_inbound_at <= ?1
                   AND NOT EXISTS (SELECT 1 FROM blacklist b WHERE b.user_id = c.user_id)
                   AND NOT EXISTS (SELECT 1 FROM campaign_jobs j
                                   WHERE j.user_id = c.user_id AND j.status = 'pending')
                 ORDER BY c.last_inbound_at
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![ts(&cutoff), limit as i64], row_to_conversation)?;
            rows.collect()
        })
    }

    // ─── Admin / Maintenance ──────────────────────────────────────

    pub fn pending_count(&self) -> Result<u64> {
        self.count(
            "Pending count",
            "SELECT COUNT(*) FROM campaign_jobs WHERE status = 'pending'",
        )
    }

    pub fn failed_count(&self) -> Result<u64> {
        self.count(
            "Failed count",
            "SELECT COUNT(*) FROM campaign_jobs WHERE status = 'failed'",
        )
    }

    /// Earliest pending `scheduled_for`.
    pub fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.db.with_conn("Next scheduled", |conn| {
            conn.query_row(
                "SELECT MIN(scheduled_for) FROM campaign_jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
        })?;
        raw.map(|s| parse_ts(0, &s).map_err(|e| NudgeError::Database(e.to_string())))
            .transpose()
    }

    /// Pending jobs whose time passed before `cutoff` (health signal).
    pub fn overdue_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<CampaignJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM campaign_jobs j
             WHERE j.status = 'pending' AND j.scheduled_for < ?1
               AND NOT EXISTS (SELECT 1 FROM blacklist b WHERE b.user_id = j.user_id)
             ORDER BY j.scheduled_for"
        );
        self.db.with_conn("Overdue jobs", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([ts(&cutoff)], row_to_job)?;
            rows.collect()
        })
    }

    /// Delete terminal jobs processed before `before`.
    pub fn sweep_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn("Sweep jobs", |conn| {
            conn.execute(
                "DELETE FROM campaign_jobs
                 WHERE status IN ('sent', 'failed', 'cancelled')
                   AND COALESCE(processed_at, created_at) < ?1",
                [ts(&before)],
            )
        })
    }

    fn count(&self, context: &str, sql: &str) -> Result<u64> {
        let n: i64 = self
            .db
            .with_conn(context, |conn| conn.query_row(sql, [], |row| row.get(0)))?;
        Ok(n.max(0) as u64)
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<CampaignJob> {
    let stage: String = row.get(3)?;
    let status: String = row.get(5)?;
    let context: String = row.get(10)?;
    Ok(CampaignJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel_address: row.get(2)?,
        stage: stage.parse::<Stage>().map_err(|e| conversion_error(3, e))?,
        scheduled_for: parse_ts(4, &row.get::<_, String>(4)?)?,
        status: status.parse::<JobStatus>().map_err(|e| conversion_error(5, e))?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        compose_failures: row.get(8)?,
        transport_failures: row.get(9)?,
        context_snapshot: serde_json::from_str(&context).unwrap_or_default(),
        last_user_message: row.get(11)?,
        last_error: row.get(12)?,
        created_at: parse_ts(13, &row.get::<_, String>(13)?)?,
        processed_at: parse_opt_ts(14, row.get(14)?)?,
        next_retry_at: parse_opt_ts(15, row.get(15)?)?,
    })
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationState> {
    let context: String = row.get(4)?;
    Ok(ConversationState {
        user_id: row.get(0)?,
        channel_address: row.get(1)?,
        last_inbound_at: parse_ts(2, &row.get::<_, String>(2)?)?,
        last_user_message: row.get(3)?,
        context: serde_json::from_str(&context).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> JobStore {
        JobStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap()
    }

    fn new_job(user: &str, stage: Stage, at: DateTime<Utc>) -> NewJob {
        NewJob {
            user_id: user.into(),
            channel_address: format!("+84{user}"),
            stage,
            scheduled_for: at,
            context_snapshot: serde_json::json!({"cart": ["sku-1"]}),
            last_user_message: Some("how much?".into()),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_upsert_creates_then_replaces() {
        let store = store();
        let first = store.upsert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        assert!(first.created);

        let later = t0() + Duration::hours(2);
        let second = store
            .upsert_pending(&new_job("u1", Stage::Numbered(0), later), t0())
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(second.job.scheduled_for, later);
        assert_eq!(store.pending_jobs_for("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_insert_duplicate_pending_conflicts() {
        let store = store();
        store.insert_pending(&new_job("u1", Stage::Numbered(1), t0()), t0()).unwrap();
        let err = store
            .insert_pending(&new_job("u1", Stage::Numbered(1), t0()), t0())
            .unwrap_err();
        assert!(matches!(err, NudgeError::Conflict(_)));
        // A different stage, or the same stage after the first is terminal, is fine.
        store.insert_pending(&new_job("u1", Stage::Numbered(2), t0()), t0()).unwrap();
    }

    #[test]
    fn test_terminal_job_frees_the_slot() {
        let store = store();
        let job = store.insert_pending(&new_job("u1", Stage::Maintenance, t0()), t0()).unwrap();
        assert!(store.mark_sent(job.id, t0()).unwrap());
        let again = store.insert_pending(&new_job("u1", Stage::Maintenance, t0()), t0()).unwrap();
        assert_ne!(again.id, job.id);
    }

    #[test]
    fn test_due_jobs_ordered_and_bounded() {
        let store = store();
        store.upsert_pending(&new_job("late", Stage::Numbered(0), t0() + Duration::minutes(5)), t0()).unwrap();
        store.upsert_pending(&new_job("early", Stage::Numbered(0), t0() - Duration::minutes(5)), t0()).unwrap();
        store.upsert_pending(&new_job("future", Stage::Numbered(0), t0() + Duration::hours(5)), t0()).unwrap();

        let due = store.due_jobs(t0() + Duration::minutes(10), 10).unwrap();
        let users: Vec<_> = due.iter().map(|j| j.user_id.as_str()).collect();
        assert_eq!(users, vec!["early", "late"]);
        assert_eq!(store.due_jobs(t0() + Duration::minutes(10), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_transitions_guarded_by_pending() {
        let store = store();
        let job = store.insert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        assert!(store.mark_sent(job.id, t0()).unwrap());
        assert!(!store.mark_sent(job.id, t0()).unwrap());
        assert!(!store.mark_failed(job.id, "late", t0()).unwrap());
        assert!(!store.cancel_job(job.id, "reply", t0()).unwrap());
        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Sent);
        assert_eq!(loaded.processed_at, Some(t0()));
    }

    #[test]
    fn test_schedule_retry_until_exhausted() {
        let store = store();
        let job = store.insert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        let retry_at = t0() + Duration::minutes(5);

        let outcome = store
            .schedule_retry(job.id, retry_at, FailureKind::Compose, "llm timeout", t0())
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Rescheduled);
        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.compose_failures, 1);
        assert_eq!(loaded.scheduled_for, retry_at);
        assert_eq!(loaded.next_retry_at, Some(retry_at));

        store.schedule_retry(job.id, retry_at, FailureKind::Transport, "502", t0()).unwrap();
        let outcome = store
            .schedule_retry(job.id, retry_at, FailureKind::Transport, "502", t0())
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted);
        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.attempts, 3);
        assert_eq!(loaded.transport_failures, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("502"));

        let outcome = store
            .schedule_retry(job.id, retry_at, FailureKind::Transport, "502", t0())
            .unwrap();
        assert_eq!(outcome, RetryOutcome::NotPending);
    }

    #[test]
    fn test_cancel_all_pending_only_touches_pending() {
        let store = store();
        let sent = store.insert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        store.mark_sent(sent.id, t0()).unwrap();
        store.insert_pending(&new_job("u1", Stage::Numbered(1), t0()), t0()).unwrap();
        store.insert_pending(&new_job("u2", Stage::Numbered(1), t0()), t0()).unwrap();

        assert_eq!(store.cancel_all_pending("u1", t0()).unwrap(), 1);
        assert_eq!(store.get_job(sent.id).unwrap().unwrap().status, JobStatus::Sent);
        assert_eq!(store.pending_jobs_for("u2").unwrap().len(), 1);
    }

    #[test]
    fn test_daily_quota_resets_on_new_date() {
        let store = store();
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let day2 = day1.succ_opt().unwrap();
        assert!(store.consume_daily_quota("u1", day1, 2).unwrap());
        assert!(store.consume_daily_quota("u1", day1, 2).unwrap());
        assert!(!store.consume_daily_quota("u1", day1, 2).unwrap());
        assert_eq!(store.daily_count("u1").unwrap(), Some((2, "2026-03-04".into())));
        assert!(store.consume_daily_quota("u1", day2, 2).unwrap());
        assert_eq!(store.daily_count("u1").unwrap(), Some((1, "2026-03-05".into())));
        assert!(!store.consume_daily_quota("u2", day1, 0).unwrap());
    }

    #[test]
    fn test_lock_exclusive_until_expiry() {
        let store = store();
        let until = t0() + Duration::seconds(30);
        assert!(store.try_lock("u1", LockKind::Schedule, "a", until, t0()).unwrap());
        assert!(!store.try_lock("u1", LockKind::Dispatch, "b", until, t0()).unwrap());
        // Expired locks can be taken over.
        let later = t0() + Duration::seconds(31);
        assert!(store.try_lock("u1", LockKind::Dispatch, "b", later + Duration::seconds(30), later).unwrap());
        // The old holder cannot release the new holder's lock.
        assert!(!store.unlock("u1", "a").unwrap());
        assert!(store.unlock("u1", "b").unwrap());
    }

    #[test]
    fn test_inactive_candidates_filters() {
        let store = store();
        let old = t0() - Duration::hours(3);
        store.record_inbound("quiet", "+1", "hi", old, None).unwrap();
        store.record_inbound("banned", "+2", "stop", old, None).unwrap();
        store.record_inbound("scheduled", "+3", "hi", old, None).unwrap();
        store.record_inbound("chatty", "+4", "hi", t0(), None).unwrap();
        store.add_to_blacklist("banned", "opt-out", t0()).unwrap();
        store.insert_pending(&new_job("scheduled", Stage::Numbered(0), t0()), t0()).unwrap();

        let candidates = store.inactive_candidates(t0() - Duration::hours(1), 10).unwrap();
        let users: Vec<_> = candidates.iter().map(|c| c.user_id.as_str()).collect();
        assert_eq!(users, vec!["quiet"]);
    }

    #[test]
    fn test_record_inbound_keeps_latest() {
        let store = store();
        store.record_inbound("u1", "+1", "newer", t0(), Some(&serde_json::json!({"lead": "hot"}))).unwrap();
        store.record_inbound("u1", "+1", "older", t0() - Duration::hours(1), None).unwrap();
        let conv = store.conversation("u1").unwrap().unwrap();
        assert_eq!(conv.last_inbound_at, t0());
        assert_eq!(conv.last_user_message.as_deref(), Some("newer"));
        assert_eq!(conv.context["lead"], "hot");
    }

    #[test]
    fn test_blacklisted_jobs_never_due() {
        let store = store();
        store.insert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        store.add_to_blacklist("u1", "opt-out", t0()).unwrap();
        assert!(store.due_jobs(t0() + Duration::hours(1), 10).unwrap().is_empty());
        assert_eq!(store.blacklist_size().unwrap(), 1);
        assert!(!store.add_to_blacklist("u1", "again", t0()).unwrap());
        assert_eq!(store.blacklist_entry("u1").unwrap().unwrap().reason, "opt-out");
    }

    #[test]
    fn test_sweep_terminal_and_admin_counts() {
        let store = store();
        let a = store.insert_pending(&new_job("u1", Stage::Numbered(0), t0()), t0()).unwrap();
        store.insert_pending(&new_job("u2", Stage::Numbered(0), t0() + Duration::hours(1)), t0()).unwrap();
        store.mark_failed(a.id, "boom", t0()).unwrap();

        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(store.failed_count().unwrap(), 1);
        assert_eq!(store.next_scheduled().unwrap(), Some(t0() + Duration::hours(1)));
        assert_eq!(store.sweep_terminal(t0() + Duration::days(1)).unwrap(), 1);
        assert!(store.get_job(a.id).unwrap().is_none());
        assert_eq!(store.pending_count().unwrap(), 1);
    }
}
