//! # Nudge Scheduler
//!
//! Follow-up campaign engine: re-engages users who went quiet with a bounded,
//! time-delayed sequence of messages, without duplicates and without
//! contacting opted-out users.
//!
//! ## Design Principles
//! - One shared SQLite file, many stateless workers
//! - Unique partial index: at most one pending job per (user, stage)
//! - Short-TTL per-user locks around every decide-and-write section
//! - Every instant stored in UTC; business hours decided in one timezone
//!
//! ## Architecture
//! ```text
//! InactivityDetector (tokio interval)
//!   └── quiet users → lock → CampaignStateMachine.start_or_continue → upsert
//!
//! Dispatcher (tokio interval, bounded concurrency)
//!   └── due jobs → lock → blacklist / reply / daily cap
//!                      → MessageComposer → NotificationChannel
//!                      → mark_sent → Tracker ledger → next stage
//!
//! Inbound reply → cancel pending → stage 0 from now
//! Opt-out       → cancel pending → blacklisted forever
//! ```

pub mod business_hours;
pub mod campaign;
pub mod db;
pub mod detector;
pub mod dispatch;
pub mod engine;
pub mod lock;
pub mod rate_limit;
pub mod stages;
pub mod store;
pub mod tracker;

pub use business_hours::BusinessHours;
pub use campaign::{CampaignState, CampaignStateMachine, Transition};
pub use db::Database;
pub use detector::{InactivityDetector, ScanReport};
pub use dispatch::{DispatchSettings, Dispatcher, TickReport};
pub use engine::{
    CampaignEngine, EngineStats, HealthReport, ReplyOutcome, SweepReport, spawn_detector,
    spawn_dispatcher,
};
pub use lock::{LockToken, RecoveryLockManager};
pub use rate_limit::RateLimiter;
pub use stages::StageConfig;
pub use store::{FailureKind, JobStore, NewJob, RetryOutcome, Upserted};
pub use tracker::{FunnelStep, HourStats, StageStats, Tracker, effectiveness_score};
