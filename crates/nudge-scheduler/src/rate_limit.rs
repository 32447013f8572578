//! Per-user daily send cap, counted in the canonical timezone's calendar days.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use nudge_core::error::Result;

use crate::store::JobStore;

pub struct RateLimiter {
    store: JobStore,
    tz: Tz,
}

impl RateLimiter {
    pub fn new(store: JobStore, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// Take one send from the user's quota for the local date of `now`.
    /// Must be called inside the dispatch critical section, right before the send.
    pub fn try_consume(&self, user_id: &str, daily_cap: u32, now: DateTime<Utc>) -> Result<bool> {
        let today = now.with_timezone(&self.tz).date_naive();
        let allowed = self.store.consume_daily_quota(user_id, today, daily_cap)?;
        if !allowed {
            tracing::debug!("🚦 Daily cap {} reached for {}", daily_cap, user_id);
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    #[test]
    fn test_cap_one_denies_second_same_day() {
        let store = JobStore::new(Arc::new(Database::open_in_memory().unwrap()));
        let limiter = RateLimiter::new(store, chrono_tz::UTC);
        let morning = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();

        assert!(limiter.try_consume("u1", 1, morning).unwrap());
        assert!(!limiter.try_consume("u1", 1, morning + Duration::hours(10)).unwrap());
        // Next local date: allowed again.
        assert!(limiter.try_consume("u1", 1, morning + Duration::days(1)).unwrap());
    }

    #[test]
    fn test_local_date_not_utc_date() {
        let store = JobStore::new(Arc::new(Database::open_in_memory().unwrap()));
        let limiter = RateLimiter::new(store, chrono_tz::Asia::Ho_Chi_Minh);
        // 16:30 UTC and 17:30 UTC fall on different local dates in UTC+7.
        let before_midnight = Utc.with_ymd_and_hms(2026, 3, 4, 16, 30, 0).unwrap();
        let after_midnight = Utc.with_ymd_and_hms(2026, 3, 4, 17, 30, 0).unwrap();

        assert!(limiter.try_consume("u1", 1, before_midnight).unwrap());
        assert!(limiter.try_consume("u1", 1, after_midnight).unwrap());
    }
}
