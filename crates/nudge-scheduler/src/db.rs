//! SQLite database shared by the job store and the delivery tracker.
//! Several worker processes may open the same file; every cross-process
//! guarantee rests on single-statement writes and the schema's unique indexes.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use nudge_core::error::{NudgeError, Result};

/// One connection to the campaign database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file and run migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| NudgeError::Database(format!("DB open: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| NudgeError::Database(format!("busy_timeout: {e}")))?;
        // WAL lets scanners read while a dispatcher writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database (single connection; tests and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NudgeError::Database(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run `f` with exclusive use of the connection.
    pub(crate) fn with_conn<T>(
        &self,
        context: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| NudgeError::Database(format!("Lock: {e}")))?;
        f(&mut conn).map_err(|e| map_sqlite_error(context, e))
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn("Migration", |conn| {
            conn.execute_batch(
                "
            -- One row per (user, stage) attempt
            CREATE TABLE IF NOT EXISTS campaign_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                channel_address TEXT NOT NULL,
                stage TEXT NOT NULL,               -- stage number or 'maintenance'
                scheduled_for TEXT NOT NULL,       -- UTC, always inside business hours
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                compose_failures INTEGER NOT NULL DEFAULT 0,
                transport_failures INTEGER NOT NULL DEFAULT 0,
                context_snapshot TEXT NOT NULL DEFAULT '{}',
                last_user_message TEXT,
                last_error TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                processed_at TEXT,
                next_retry_at TEXT
            );

            -- At most one pending job per (user, stage). Never deferred.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_pending
                ON campaign_jobs(user_id, stage) WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON campaign_jobs(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_jobs_user ON campaign_jobs(user_id, created_at);

            -- Append-only delivery ledger
            CREATE TABLE IF NOT EXISTS delivery_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER,
                user_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'sent',   -- sent, failed
                message_sent TEXT NOT NULL,
                template_used TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                user_responded INTEGER NOT NULL DEFAULT 0,
                responded_at TEXT,
                response_latency INTEGER,               -- seconds
                effectiveness_score REAL
            );
            -- A job produces at most one ledger entry.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_job
                ON delivery_records(job_id) WHERE job_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_delivery_user ON delivery_records(user_id, sent_at);

            -- Per-user daily send counter
            CREATE TABLE IF NOT EXISTS rate_limits (
                user_id TEXT PRIMARY KEY,
                daily_count INTEGER NOT NULL,
                reset_date TEXT NOT NULL               -- local date in the canonical timezone
            );

            -- Short-TTL per-user critical sections
            CREATE TABLE IF NOT EXISTS recovery_locks (
                user_id TEXT PRIMARY KEY,
                lock_kind TEXT NOT NULL,
                holder TEXT NOT NULL,
                locked_until TEXT NOT NULL
            );

            -- Opt-outs (written by the opt-out handler)
            CREATE TABLE IF NOT EXISTS blacklist (
                user_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                added_at TEXT NOT NULL
            );

            -- Last inbound activity per user
            CREATE TABLE IF NOT EXISTS conversations (
                user_id TEXT PRIMARY KEY,
                channel_address TEXT NOT NULL,
                last_inbound_at TEXT NOT NULL,
                last_user_message TEXT,
                context TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_inbound ON conversations(last_inbound_at);
         ",
            )
        })
    }
}

fn map_sqlite_error(context: &str, e: rusqlite::Error) -> NudgeError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            NudgeError::Conflict(format!("{context}: {e}"))
        }
        _ => NudgeError::Database(format!("{context}: {e}")),
    }
}

/// Canonical storage form: UTC, millisecond precision, `Z` suffix.
/// Fixed width, so text comparison in SQL orders instants correctly.
pub fn ts(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, mapping failures into a column conversion error.
pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn conversion_error(idx: usize, e: nudge_core::NudgeError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_and_migrate_twice() {
        let dir = std::env::temp_dir().join(format!("nudge-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("campaign.db");
        Database::open(&path, Duration::from_secs(1)).unwrap();
        // Migrations are idempotent.
        Database::open(&path, Duration::from_secs(1)).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_timestamp_text_orders_like_instants() {
        let a = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(ts(&a), "2026-03-04T09:00:00.000Z");
        assert_eq!(parse_ts(0, &ts(&b)).unwrap(), b);
    }
}
