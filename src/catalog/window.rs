use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use super::Routine;

/// Where "now" falls relative to a routine's daily window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Availability {
    /// No window configured.
    Always,
    #[serde(rename_all = "camelCase")]
    Upcoming { starts_at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Active { ends_at: Option<DateTime<Utc>> },
    Ended,
}

/// Resolves a family-local wall clock time to an instant. Times inside a DST
/// gap resolve to the first valid instant after it.
fn resolve_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(time);
    let mut probe = naive;
    for _ in 0..=4 {
        if let Some(instant) = tz.from_local_datetime(&probe).earliest() {
            return instant.with_timezone(&Utc);
        }
        probe += chrono::Duration::minutes(30);
    }
    Utc.from_utc_datetime(&naive)
}

pub fn availability(routine: &Routine, now: DateTime<Utc>, tz: Tz) -> Availability {
    if routine.start_time.is_none() && routine.end_time.is_none() {
        return Availability::Always;
    }
    let local = now.with_timezone(&tz);
    let today = local.date_naive();
    let time = local.time();

    if let Some(start) = routine.start_time {
        if time < start {
            return Availability::Upcoming {
                starts_at: resolve_local(today, start, tz),
            };
        }
    }
    match routine.end_time {
        Some(end) if time >= end => Availability::Ended,
        Some(end) => Availability::Active {
            ends_at: Some(resolve_local(today, end, tz)),
        },
        None => Availability::Active { ends_at: None },
    }
}
