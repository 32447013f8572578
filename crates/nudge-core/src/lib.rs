//! # Nudge Core
//! Shared configuration, error type, data model and collaborator traits.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NudgeConfig;
pub use error::{NudgeError, Result};
pub use traits::{ComposeRequest, ComposedMessage, MessageComposer, NotificationChannel, SendOutcome};
pub use types::{
    BlacklistEntry, CampaignJob, ConversationState, DeliveryOutcome, DeliveryRecord, JobStatus,
    LockKind, Stage,
};
