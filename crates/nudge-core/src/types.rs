//! Shared data model for follow-up campaigns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NudgeError;

/// One step of a user's outreach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "number", rename_all = "snake_case")]
pub enum Stage {
    /// A stage from the configured table. Numbers need not be contiguous.
    Numbered(u32),
    /// Recurring light-touch stage after the table is exhausted.
    Maintenance,
}

impl Stage {
    /// Stable storage key: the stage number, or `"maintenance"`.
    pub fn key(&self) -> String {
        match self {
            Stage::Numbered(n) => n.to_string(),
            Stage::Maintenance => "maintenance".to_string(),
        }
    }

    pub fn is_maintenance(&self) -> bool {
        matches!(self, Stage::Maintenance)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Numbered(n) => write!(f, "stage-{n}"),
            Stage::Maintenance => write!(f, "maintenance"),
        }
    }
}

impl FromStr for Stage {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maintenance" => Ok(Stage::Maintenance),
            other => other
                .parse::<u32>()
                .map(Stage::Numbered)
                .map_err(|_| NudgeError::Other(format!("invalid stage key '{other}'"))),
        }
    }
}

/// Lifecycle of a campaign job. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl FromStr for JobStatus {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(NudgeError::Other(format!("invalid job status '{other}'"))),
        }
    }
}

/// One row per (user, stage) attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJob {
    pub id: i64,
    pub user_id: String,
    /// Phone number, chat id or handle the transport delivers to.
    pub channel_address: String,
    pub stage: Stage,
    /// Always inside business hours at write time.
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub compose_failures: u32,
    pub transport_failures: u32,
    /// Opaque data the composer needs (cart, products viewed, ...).
    pub context_snapshot: serde_json::Value,
    pub last_user_message: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome recorded in the delivery ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    /// The job exhausted its attempt budget.
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

/// Append-only ledger entry for an attempted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub job_id: Option<i64>,
    pub user_id: String,
    pub stage: Stage,
    pub outcome: DeliveryOutcome,
    pub message_sent: String,
    pub template_used: String,
    pub sent_at: DateTime<Utc>,
    pub user_responded: bool,
    pub responded_at: Option<DateTime<Utc>>,
    /// Seconds between send and reply.
    pub response_latency: Option<i64>,
    pub effectiveness_score: Option<f64>,
}

/// Opt-out record. Presence is absorbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub user_id: String,
    pub reason: String,
    pub added_at: DateTime<Utc>,
}

/// Last known conversation state for a user, maintained from inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub channel_address: String,
    pub last_inbound_at: DateTime<Utc>,
    pub last_user_message: Option<String>,
    pub context: serde_json::Value,
}

/// Kind of critical section a recovery lock guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Schedule,
    Dispatch,
    Reply,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Schedule => "schedule",
            LockKind::Dispatch => "dispatch",
            LockKind::Reply => "reply",
        }
    }
}
