//! Civil-day time model.
//!
//! Daily counters roll over at midnight in a fixed UTC+3 offset, regardless of
//! the server's local time zone. There is no daylight saving adjustment.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Offset from UTC, in hours, of the civil day used for daily resets.
pub const CIVIL_DAY_OFFSET_HOURS: i64 = 3;

/// Calendar date of `now` shifted into the fixed UTC+3 offset.
pub fn civil_day(now: DateTime<Utc>) -> NaiveDate {
    (now + Duration::hours(CIVIL_DAY_OFFSET_HOURS)).date_naive()
}
