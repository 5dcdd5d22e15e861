use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::{AppError, AppResult};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn to_opt_date(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(to_date)
}

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parses a stored `YYYY-MM-DD` column value.
pub fn parse_stored_date(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|err| {
        AppError::new("INTERNAL/DATE_DECODE", err.to_string()).with_context("value", raw)
    })
}

/// Resolves an IANA timezone name. Unknown names fall back to UTC.
pub fn family_tz(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or(Tz::UTC)
}

/// Calendar date of `instant` in the given timezone.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Source of "now" for every time-dependent transition.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.ms.store(instant.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<dyn Clock>,
}

impl ClockHandle {
    pub fn system() -> Self {
        Self {
            inner: Arc::new(SystemClock),
        }
    }

    pub fn manual(clock: Arc<ManualClock>) -> Self {
        Self { inner: clock }
    }

    pub fn now_ms(&self) -> i64 {
        self.inner.now_ms()
    }

    pub fn now(&self) -> DateTime<Utc> {
        to_date(self.now_ms())
    }
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle")
            .field("now_ms", &self.now_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn now_ms_is_reasonable() {
        let a = now_ms();
        assert!(a > 1_500_000_000_000); // after 2017
        assert!(a < 4_100_000_000_000); // before year ~2100
    }

    #[test]
    fn to_date_epoch() {
        let d = to_date(0);
        assert_eq!(d.timestamp_millis(), 0);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 7, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let handle = ClockHandle::manual(clock.clone());
        assert_eq!(handle.now(), start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(handle.now(), start + chrono::Duration::minutes(5));
    }

    #[test]
    fn local_date_follows_family_timezone() {
        // 23:30 UTC is already the next day in Auckland.
        let instant = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        assert_eq!(
            local_date(instant, family_tz("Pacific/Auckland")),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
        assert_eq!(
            local_date(instant, family_tz("not/a-zone")),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
    }

    #[test]
    fn stored_dates_parse() {
        let date = parse_stored_date("2026-02-28").unwrap();
        assert_eq!(format_date(date), "2026-02-28");
        assert!(parse_stored_date("28/02/2026").is_err());
    }
}
