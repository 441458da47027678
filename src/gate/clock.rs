use chrono::{DateTime, Local, NaiveDate, Utc};

/// Wall-clock source for the gate
///
/// Expiry and quota rollover are decided from absolute wall-clock time, so
/// everything that needs "now" goes through this trait instead of calling
/// `Utc::now()` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Calendar day (local time) a timestamp falls on
pub fn day_of(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use test_clocks::{InstantClock, ManualClock};


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 11, 16, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance_ms(1500);
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn day_changes_after_24_hours() {
        let start = Utc.with_ymd_and_hms(2025, 11, 16, 12, 0, 0).unwrap();
        let next = start + chrono::Duration::hours(24);
        assert_eq!(day_of(next), day_of(start).succ_opt().unwrap());
    }
}
