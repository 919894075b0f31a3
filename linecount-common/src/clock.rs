//! Clock abstraction and working-day calendar
//!
//! All time-dependent logic (match windows, cleanup horizon, offline window,
//! inactivity pause, closure checkpoints) reads time through [`Clock`] so tests
//! can drive it with [`ManualClock`].

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use std::sync::Mutex;

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as epoch milliseconds (storage representation)
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut current) = self.current.lock() {
            *current = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Maps instants to the plant's local working day
///
/// The plant runs on a fixed UTC offset; the working date is the local
/// calendar date and closure checkpoints are local wall-clock times.
#[derive(Debug, Clone, Copy)]
pub struct WorkCalendar {
    offset: FixedOffset,
}

impl WorkCalendar {
    /// Build from an offset in minutes east of UTC (Monterrey is -360).
    pub fn from_offset_minutes(minutes: i32) -> crate::Result<Self> {
        FixedOffset::east_opt(minutes * 60)
            .map(|offset| Self { offset })
            .ok_or_else(|| crate::Error::Config(format!("invalid UTC offset: {} minutes", minutes)))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local working date for an instant
    pub fn work_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Working date formatted the way both stores key their rows (YYYY-MM-DD)
    pub fn work_date_key(&self, at: DateTime<Utc>) -> String {
        self.work_date(at).format("%Y-%m-%d").to_string()
    }

    /// UTC instant of a local wall-clock time on the given working date
    pub fn instant_of(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        (local - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }

    /// Checkpoints crossed in the half-open interval (since, until]
    ///
    /// Walks every working date touched by the interval so a checkpoint is
    /// reported once even when the poll straddles midnight.
    pub fn checkpoints_crossed(
        &self,
        checkpoints: &[NaiveTime],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut crossed = Vec::new();
        if until <= since {
            return crossed;
        }

        let mut date = self.work_date(since);
        let last = self.work_date(until);
        while date <= last {
            for checkpoint in checkpoints {
                let at = self.instant_of(date, *checkpoint);
                if at > since && at <= until {
                    crossed.push(at);
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        crossed.sort();
        crossed
    }
}

impl Default for WorkCalendar {
    fn default() -> Self {
        let offset = FixedOffset::west_opt(6 * 3600).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar() -> WorkCalendar {
        WorkCalendar::from_offset_minutes(-360).unwrap()
    }

    #[test]
    fn test_work_date_uses_local_offset() {
        // 03:00 UTC is still the previous evening at UTC-6
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 3, 0, 0).unwrap();
        assert_eq!(calendar().work_date_key(at), "2025-03-09");
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(130));
        assert_eq!(clock.now(), start + Duration::seconds(130));
    }

    #[test]
    fn test_checkpoint_crossed_once() {
        let cal = calendar();
        let checkpoint = NaiveTime::from_hms_opt(23, 59, 0).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let at = cal.instant_of(date, checkpoint);

        let before = at - Duration::seconds(30);
        let after = at + Duration::seconds(30);
        assert_eq!(cal.checkpoints_crossed(&[checkpoint], before, after), vec![at]);
        assert!(cal.checkpoints_crossed(&[checkpoint], after, after + Duration::seconds(60)).is_empty());
    }

    #[test]
    fn test_invalid_offset_rejected() {
        assert!(WorkCalendar::from_offset_minutes(24 * 60).is_err());
    }
}
