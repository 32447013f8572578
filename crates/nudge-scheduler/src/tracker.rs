//! Delivery tracker — append-only ledger of follow-up sends and the
//! response analytics computed from it.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use nudge_core::error::Result;
use nudge_core::types::{DeliveryOutcome, DeliveryRecord, Stage};

use crate::db::{Database, conversion_error, parse_opt_ts, parse_ts, ts};

const RECORD_COLUMNS: &str = "id, job_id, user_id, stage, outcome, message_sent, template_used, \
     sent_at, user_responded, responded_at, response_latency, effectiveness_score";

/// Response rate for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: Stage,
    pub sent: u64,
    pub responded: u64,
    pub response_rate: f64,
}

/// Response rate for sends in one local hour of day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourStats {
    pub hour: u32,
    pub sent: u64,
    pub responded: u64,
    pub response_rate: f64,
}

/// Users reached at a stage, and the share lost since the previous stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStep {
    pub stage: Stage,
    pub users: u64,
    pub drop_off: f64,
}

/// Sole writer of `delivery_records`.
#[derive(Clone)]
pub struct Tracker {
    db: Arc<Database>,
}

impl Tracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a successful send. Returns `None` if this job already has an entry.
    pub fn record_sent(
        &self,
        job_id: Option<i64>,
        user_id: &str,
        stage: Stage,
        message: &str,
        template: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        self.append(job_id, user_id, stage, DeliveryOutcome::Sent, message, template, sent_at)
    }

    /// Append a send that exhausted its attempts.
    pub fn record_failed(
        &self,
        job_id: i64,
        user_id: &str,
        stage: Stage,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        self.append(Some(job_id), user_id, stage, DeliveryOutcome::Failed, "", error, at)
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        job_id: Option<i64>,
        user_id: &str,
        stage: Stage,
        outcome: DeliveryOutcome,
        message: &str,
        template: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        self.db.with_conn("Record delivery", |conn| {
            conn.query_row(
                "INSERT INTO delivery_records
                    (job_id, user_id, stage, outcome, message_sent, template_used, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) WHERE job_id IS NOT NULL DO NOTHING
                 RETURNING id",
                params![job_id, user_id, stage.key(), outcome.as_str(), message, template, ts(&at)],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Attribute an inbound message to the user's latest send, if that send
    /// is still unanswered. Later messages in the same exchange are not
    /// credited to older sends.
    pub fn record_response(
        &self,
        user_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records
             WHERE user_id = ?1 AND outcome = 'sent' AND sent_at <= ?2
             ORDER BY sent_at DESC, id DESC LIMIT 1"
        );
        self.db.with_conn("Record response", |conn| {
            let Some(mut record) = conn
                .query_row(&sql, params![user_id, ts(&at)], row_to_record)
                .optional()?
            else {
                return Ok(None);
            };
            if record.user_responded {
                return Ok(None);
            }
            let latency = (at - record.sent_at).num_seconds().max(0);
            let score = effectiveness_score(Duration::seconds(latency));
            let changed = conn.execute(
                "UPDATE delivery_records SET user_responded = 1, responded_at = ?2,
                    response_latency = ?3, effectiveness_score = ?4
                 WHERE id = ?1 AND user_responded = 0",
                params![record.id, ts(&at), latency, score],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            tracing::debug!(
                "💬 {} replied to {} after {}s ({} chars)",
                user_id,
                record.stage,
                latency,
                message.chars().count()
            );
            record.user_responded = true;
            record.responded_at = Some(at);
            record.response_latency = Some(latency);
            record.effectiveness_score = Some(score);
            Ok(Some(record))
        })
    }

    pub fn records_for(&self, user_id: &str) -> Result<Vec<DeliveryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM delivery_records WHERE user_id = ?1 ORDER BY id");
        self.db.with_conn("Records for user", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([user_id], row_to_record)?;
            rows.collect()
        })
    }

    /// Response rate per stage; numbered stages ascending, maintenance last.
    pub fn response_rates(&self) -> Result<Vec<StageStats>> {
        let rows: Vec<(String, i64, i64)> = self.db.with_conn("Response rates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT stage, COUNT(*), SUM(user_responded) FROM delivery_records
                 WHERE outcome = 'sent' GROUP BY stage",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect()
        })?;
        let mut stats: Vec<StageStats> = rows
            .into_iter()
            .filter_map(|(stage, sent, responded)| {
                let stage = stage.parse::<Stage>().ok()?;
                Some(StageStats {
                    stage,
                    sent: sent as u64,
                    responded: responded as u64,
                    response_rate: ratio(responded as u64, sent as u64),
                })
            })
            .collect();
        stats.sort_by_key(|s| stage_order(s.stage));
        Ok(stats)
    }

    /// Local hour whose sends drew the best response rate, among hours with
    /// at least `min_samples` sends.
    pub fn best_send_hour(&self, tz: Tz, min_samples: u64) -> Result<Option<HourStats>> {
        let rows: Vec<(String, bool)> = self.db.with_conn("Send hours", |conn| {
            let mut stmt = conn.prepare(
                "SELECT sent_at, user_responded FROM delivery_records WHERE outcome = 'sent'",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;

        let mut by_hour: BTreeMap<u32, (u64, u64)> = BTreeMap::new();
        for (sent_at, responded) in rows {
            let Ok(sent_at) = parse_ts(0, &sent_at) else {
                continue;
            };
            let hour = chrono::Timelike::hour(&sent_at.with_timezone(&tz));
            let entry = by_hour.entry(hour).or_default();
            entry.0 += 1;
            entry.1 += responded as u64;
        }

        Ok(by_hour
            .into_iter()
            .filter(|(_, (sent, _))| *sent >= min_samples.max(1))
            .map(|(hour, (sent, responded))| HourStats {
                hour,
                sent,
                responded,
                response_rate: ratio(responded, sent),
            })
            .max_by(|a, b| {
                a.response_rate
                    .partial_cmp(&b.response_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.hour.cmp(&a.hour))
            }))
    }

    /// Distinct users reached at each stage of `stages`, in that order, with
    /// the drop-off relative to the preceding stage.
    pub fn funnel(&self, stages: &[Stage]) -> Result<Vec<FunnelStep>> {
        let rows: Vec<(String, i64)> = self.db.with_conn("Funnel", |conn| {
            let mut stmt = conn.prepare(
                "SELECT stage, COUNT(DISTINCT user_id) FROM delivery_records
                 WHERE outcome = 'sent' GROUP BY stage",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        let reached: HashMap<String, u64> = rows.into_iter().map(|(s, n)| (s, n as u64)).collect();

        let mut previous: Option<u64> = None;
        Ok(stages
            .iter()
            .map(|stage| {
                let users = reached.get(&stage.key()).copied().unwrap_or(0);
                let drop_off = match previous {
                    Some(prev) if prev > 0 => 1.0 - ratio(users.min(prev), prev),
                    _ => 0.0,
                };
                previous = Some(users);
                FunnelStep {
                    stage: *stage,
                    users,
                    drop_off,
                }
            })
            .collect())
    }
}

/// Faster replies score higher.
pub fn effectiveness_score(latency: Duration) -> f64 {
    if latency <= Duration::hours(1) {
        1.0
    } else if latency <= Duration::hours(6) {
        0.8
    } else if latency <= Duration::hours(24) {
        0.5
    } else if latency <= Duration::hours(72) {
        0.3
    } else {
        0.1
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn stage_order(stage: Stage) -> u64 {
    match stage {
        Stage::Numbered(n) => n as u64,
        Stage::Maintenance => u64::MAX,
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let stage: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    Ok(DeliveryRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        user_id: row.get(2)?,
        stage: stage.parse::<Stage>().map_err(|e| conversion_error(3, e))?,
        outcome: if outcome == "failed" {
            DeliveryOutcome::Failed
        } else {
            DeliveryOutcome::Sent
        },
        message_sent: row.get(5)?,
        template_used: row.get(6)?,
        sent_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        user_responded: row.get(8)?,
        responded_at: parse_opt_ts(9, row.get(9)?)?,
        response_latency: row.get(10)?,
        effectiveness_score: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker() -> Tracker {
        Tracker::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_one_entry_per_job() {
        let tracker = tracker();
        assert!(tracker.record_sent(Some(7), "u1", Stage::Numbered(0), "hi", "t0", t0()).unwrap().is_some());
        assert!(tracker.record_sent(Some(7), "u1", Stage::Numbered(0), "hi", "t0", t0()).unwrap().is_none());
        assert_eq!(tracker.records_for("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_response_fills_latest_unanswered() {
        let tracker = tracker();
        tracker.record_sent(Some(1), "u1", Stage::Numbered(0), "a", "t", t0()).unwrap();
        tracker
            .record_sent(Some(2), "u1", Stage::Numbered(1), "b", "t", t0() + Duration::hours(6))
            .unwrap();

        let reply_at = t0() + Duration::hours(6) + Duration::minutes(30);
        let record = tracker.record_response("u1", "yes please", reply_at).unwrap().unwrap();
        assert_eq!(record.stage, Stage::Numbered(1));
        assert_eq!(record.response_latency, Some(1800));
        assert_eq!(record.effectiveness_score, Some(1.0));

        // Further messages in the same exchange leave older sends alone.
        assert!(tracker.record_response("u1", "again", reply_at + Duration::minutes(1)).unwrap().is_none());
        let records = tracker.records_for("u1").unwrap();
        assert!(!records[0].user_responded);
        assert_eq!(records[0].response_latency, None);
    }

    #[test]
    fn test_follow_up_messages_do_not_credit_older_stages() {
        let tracker = tracker();
        let monday = t0() - Duration::days(2);
        tracker.record_sent(Some(1), "u1", Stage::Numbered(0), "a", "t", monday).unwrap();
        tracker.record_sent(Some(2), "u1", Stage::Numbered(1), "b", "t", t0()).unwrap();

        let first = tracker.record_response("u1", "hi", t0() + Duration::minutes(5)).unwrap().unwrap();
        assert_eq!(first.stage, Stage::Numbered(1));
        assert!(tracker.record_response("u1", "one more thing", t0() + Duration::minutes(6)).unwrap().is_none());

        let rates = tracker.response_rates().unwrap();
        assert_eq!(rates[0].stage, Stage::Numbered(0));
        assert_eq!(rates[0].responded, 0);
        assert_eq!(rates[1].responded, 1);

        // A new send opens a new window for attribution.
        tracker.record_sent(Some(3), "u1", Stage::Numbered(0), "c", "t", t0() + Duration::days(1)).unwrap();
        let next = tracker
            .record_response("u1", "back", t0() + Duration::days(1) + Duration::hours(2))
            .unwrap()
            .unwrap();
        assert_eq!(next.job_id, Some(3));
    }

    #[test]
    fn test_failed_records_excluded_from_rates() {
        let tracker = tracker();
        tracker.record_sent(Some(1), "u1", Stage::Numbered(0), "a", "t", t0()).unwrap();
        tracker.record_sent(Some(2), "u2", Stage::Numbered(0), "a", "t", t0()).unwrap();
        tracker.record_failed(3, "u3", Stage::Numbered(0), "502", t0()).unwrap();
        tracker.record_sent(Some(4), "u1", Stage::Maintenance, "m", "t", t0()).unwrap();
        tracker.record_response("u2", "ok", t0() + Duration::hours(2)).unwrap();

        let rates = tracker.response_rates().unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].stage, Stage::Numbered(0));
        assert_eq!(rates[0].sent, 2);
        assert_eq!(rates[0].responded, 1);
        assert!((rates[0].response_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(rates[1].stage, Stage::Maintenance);
    }

    #[test]
    fn test_best_send_hour() {
        let tracker = tracker();
        let ten = t0();
        let fifteen = t0() + Duration::hours(5);
        tracker.record_sent(Some(1), "a", Stage::Numbered(0), "x", "t", ten).unwrap();
        tracker.record_sent(Some(2), "b", Stage::Numbered(0), "x", "t", ten).unwrap();
        tracker.record_sent(Some(3), "c", Stage::Numbered(0), "x", "t", fifteen).unwrap();
        tracker.record_sent(Some(4), "d", Stage::Numbered(0), "x", "t", fifteen).unwrap();
        tracker.record_response("c", "hi", fifteen + Duration::minutes(1)).unwrap();

        let best = tracker.best_send_hour(chrono_tz::UTC, 2).unwrap().unwrap();
        assert_eq!(best.hour, 15);
        assert_eq!(best.responded, 1);
        assert!(tracker.best_send_hour(chrono_tz::UTC, 3).unwrap().is_none());
    }

    #[test]
    fn test_funnel_drop_off() {
        let tracker = tracker();
        for (job, user) in ["a", "b", "c", "d"].iter().enumerate() {
            tracker.record_sent(Some(job as i64), user, Stage::Numbered(0), "x", "t", t0()).unwrap();
        }
        tracker.record_sent(Some(10), "a", Stage::Numbered(1), "x", "t", t0()).unwrap();

        let funnel = tracker
            .funnel(&[Stage::Numbered(0), Stage::Numbered(1), Stage::Numbered(2)])
            .unwrap();
        assert_eq!(funnel[0].users, 4);
        assert_eq!(funnel[0].drop_off, 0.0);
        assert_eq!(funnel[1].users, 1);
        assert!((funnel[1].drop_off - 0.75).abs() < 1e-9);
        assert_eq!(funnel[2].users, 0);
        assert_eq!(funnel[2].drop_off, 1.0);
    }

    #[test]
    fn test_effectiveness_bands() {
        assert_eq!(effectiveness_score(Duration::minutes(59)), 1.0);
        assert_eq!(effectiveness_score(Duration::hours(5)), 0.8);
        assert_eq!(effectiveness_score(Duration::hours(20)), 0.5);
        assert_eq!(effectiveness_score(Duration::hours(48)), 0.3);
        assert_eq!(effectiveness_score(Duration::days(10)), 0.1);
    }
}
