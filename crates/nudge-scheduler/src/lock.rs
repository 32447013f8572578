//! Recovery locks — short-TTL per-user mutual exclusion across worker processes.
//! A crashed holder's lock simply expires. Failing to acquire means another
//! instance is handling the user; callers skip, they never spin.

use chrono::{DateTime, Duration, Utc};

use nudge_core::error::Result;
use nudge_core::types::LockKind;

use crate::store::JobStore;

pub struct RecoveryLockManager {
    store: JobStore,
    /// Identifies this worker process in lock rows.
    holder: String,
}

/// Proof of one successful acquire. Every acquire gets a fresh token, so a
/// task can only release the lock it took, even within one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    user_id: String,
    token: String,
}

impl LockToken {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl RecoveryLockManager {
    pub fn new(store: JobStore) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".into());
        let holder = format!("{}-{}", host, std::process::id());
        Self::with_holder(store, holder)
    }

    pub fn with_holder(store: JobStore, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// A token only if no live lock exists for the user (or the existing one expired).
    pub fn acquire(
        &self,
        user_id: &str,
        kind: LockKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LockToken>> {
        let token = format!("{}:{}", self.holder, uuid::Uuid::new_v4().simple());
        if self.store.try_lock(user_id, kind, &token, now + ttl, now)? {
            Ok(Some(LockToken {
                user_id: user_id.to_string(),
                token,
            }))
        } else {
            tracing::debug!("🔒 {} lock for {} held elsewhere — skipping", kind.as_str(), user_id);
            Ok(None)
        }
    }

    pub fn release(&self, lock: &LockToken) -> Result<()> {
        if !self.store.unlock(&lock.user_id, &lock.token)? {
            // Expired and taken over, or already released.
            tracing::warn!("⚠️ Lock for {} was no longer ours at release", lock.user_id);
        }
        Ok(())
    }
}
