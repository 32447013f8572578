//! Business-hours calculator.
//! Maps any instant to the next instant inside the allowed weekday/hour window.
//! All local-hour decisions happen in one canonical timezone; inputs carrying
//! other offsets are normalized to UTC on entry.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use nudge_core::config::BusinessHoursConfig;
use nudge_core::error::Result;

/// Weekday/hour window in a canonical timezone.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
    /// Indexed by `Weekday::num_days_from_monday`.
    allowed: [bool; 7],
}

impl BusinessHours {
    pub fn new(tz: Tz, start_hour: u32, end_hour: u32, weekdays: &[Weekday]) -> Self {
        let mut allowed = [false; 7];
        for day in weekdays {
            allowed[day.num_days_from_monday() as usize] = true;
        }
        Self {
            tz,
            start_hour,
            end_hour,
            allowed,
        }
    }

    pub fn from_config(config: &BusinessHoursConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            config.tz()?,
            config.start_hour,
            config.end_hour,
            &config.allowed_weekdays()?,
        ))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Earliest instant `>= instant` inside the window. Idempotent.
    pub fn adjust<T: TimeZone>(&self, instant: DateTime<T>) -> DateTime<Utc> {
        let instant = instant.with_timezone(&Utc);
        let local = instant.with_timezone(&self.tz);
        let hour = local.hour();

        let mut candidate = if hour < self.start_hour {
            self.local_start(local.date_naive())
        } else if hour >= self.end_hour {
            self.local_start(next_date(local.date_naive()))
        } else {
            instant
        };

        // A window always exists within a week, so this loop is bounded.
        for _ in 0..8 {
            let local = candidate.with_timezone(&self.tz);
            if self.is_allowed_day(local.weekday()) {
                break;
            }
            candidate = self.local_start(next_date(local.date_naive()));
        }
        candidate
    }

    /// Window predicate: allowed weekday and local hour in `[start, end)`.
    pub fn contains<T: TimeZone>(&self, instant: DateTime<T>) -> bool {
        let local = instant.with_timezone(&self.tz);
        self.is_allowed_day(local.weekday())
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }

    /// Opening of the first business window on a later local day.
    pub fn next_day_opening<T: TimeZone>(&self, instant: DateTime<T>) -> DateTime<Utc> {
        let local = instant.with_timezone(&self.tz);
        self.adjust(self.local_start(next_date(local.date_naive())))
    }

    /// Calendar date of `instant` in the canonical timezone.
    pub fn local_date<T: TimeZone>(&self, instant: DateTime<T>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Hour of day of `instant` in the canonical timezone.
    pub fn local_hour<T: TimeZone>(&self, instant: DateTime<T>) -> u32 {
        instant.with_timezone(&self.tz).hour()
    }

    fn is_allowed_day(&self, day: Weekday) -> bool {
        self.allowed[day.num_days_from_monday() as usize]
    }

    /// `start_hour:00` local on `date`, shifted past a DST gap if needed.
    fn local_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let mut naive = date.and_hms_opt(self.start_hour, 0, 0).unwrap_or_default();
        for _ in 0..3 {
            if let Some(dt) = self.tz.from_local_datetime(&naive).earliest() {
                return dt.with_timezone(&Utc);
            }
            naive += Duration::hours(1);
        }
        Utc.from_utc_datetime(&naive)
    }
}

fn next_date(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use proptest::prelude::*;

    fn mon_sat() -> BusinessHours {
        BusinessHours::new(
            chrono_tz::UTC,
            9,
            21,
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri, Weekday::Sat],
        )
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_inside_window_unchanged() {
        let bh = mon_sat();
        // 2026-03-04 is a Wednesday.
        let t = utc(2026, 3, 4, 10, 30);
        assert_eq!(bh.adjust(t), t);
        assert!(bh.contains(t));
    }

    #[test]
    fn test_before_start_clamps_same_day() {
        let bh = mon_sat();
        assert_eq!(bh.adjust(utc(2026, 3, 4, 7, 15)), utc(2026, 3, 4, 9, 0));
    }

    #[test]
    fn test_after_end_moves_to_next_morning() {
        let bh = mon_sat();
        assert_eq!(bh.adjust(utc(2026, 3, 4, 23, 0)), utc(2026, 3, 5, 9, 0));
        assert_eq!(bh.adjust(utc(2026, 3, 4, 21, 0)), utc(2026, 3, 5, 9, 0));
    }

    #[test]
    fn test_skips_disallowed_weekday() {
        let bh = mon_sat();
        // Saturday 22:00 -> Sunday is closed -> Monday 09:00.
        assert_eq!(bh.adjust(utc(2026, 3, 7, 22, 0)), utc(2026, 3, 9, 9, 0));
        // Sunday midday -> Monday 09:00.
        assert_eq!(bh.adjust(utc(2026, 3, 8, 12, 0)), utc(2026, 3, 9, 9, 0));
    }

    #[test]
    fn test_foreign_offset_is_normalized() {
        let bh = BusinessHours::new(chrono_tz::Asia::Ho_Chi_Minh, 9, 21, &[Weekday::Wed]);
        // 02:00 UTC Wednesday == 09:00 in UTC+7.
        let input = FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 3, 21, 0, 0)
            .unwrap();
        assert_eq!(bh.adjust(input), utc(2026, 3, 4, 2, 0));
    }

    #[test]
    fn test_next_day_opening() {
        let bh = mon_sat();
        assert_eq!(bh.next_day_opening(utc(2026, 3, 4, 10, 0)), utc(2026, 3, 5, 9, 0));
        assert_eq!(bh.next_day_opening(utc(2026, 3, 7, 10, 0)), utc(2026, 3, 9, 9, 0));
    }

    #[test]
    fn test_dst_gap_start_hour() {
        // America/New_York springs forward at 02:00 on 2026-03-08.
        let bh = BusinessHours::new(chrono_tz::America::New_York, 2, 21, &[Weekday::Sun]);
        let adjusted = bh.adjust(utc(2026, 3, 8, 5, 0));
        assert!(bh.contains(adjusted));
        assert_eq!(bh.adjust(adjusted), adjusted);
    }

    proptest! {
        #[test]
        fn prop_adjust_is_closed_and_idempotent(secs in 1_600_000_000i64..2_000_000_000i64) {
            let bh = BusinessHours::new(
                chrono_tz::Europe::Berlin,
                9,
                21,
                &[Weekday::Mon, Weekday::Wed, Weekday::Sat],
            );
            let x = Utc.timestamp_opt(secs, 0).unwrap();
            let once = bh.adjust(x);
            prop_assert!(once >= x);
            prop_assert!(bh.contains(once));
            prop_assert_eq!(bh.adjust(once), once);
        }
    }
}
