//! Pure clock helpers for quota days and rate-limit minute windows.
//!
//! The quota day rolls over at midnight in a configurable fixed UTC offset.
//! The minute window is the request time truncated to the minute; both are
//! deterministic functions of `now` so callers (and tests) pass time in
//! explicitly.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct QuotaWindowConfig {
    /// Offset from UTC, in minutes, in which the quota day is computed.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// The quota day a request falls into, plus when that day's quota resets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaWindow {
    pub day: NaiveDate,
    pub resets_at: DateTime<Utc>,
    pub retry_after_seconds: u64,
}

impl QuotaWindowConfig {
    fn offset(&self) -> FixedOffset {
        // Offsets beyond +/-14h are invalid; fall back to UTC rather than erroring
        FixedOffset::east_opt(self.utc_offset_minutes.clamp(-14 * 60, 14 * 60) * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn compute(&self, now: DateTime<Utc>) -> QuotaWindow {
        let offset = self.offset();
        let local = now.with_timezone(&offset);
        let day = local.date_naive();
        let resets_at = day
            .succ_opt()
            .map(|next_day| next_day.and_time(NaiveTime::MIN))
            .and_then(|midnight| offset.from_local_datetime(&midnight).single())
            .map(|midnight| midnight.with_timezone(&Utc))
            // Unreachable for any date Postgres can store; degrade to an immediate reset
            .unwrap_or(now);
        let retry_after_seconds = (resets_at - now).num_seconds().max(0) as u64;
        QuotaWindow {
            day,
            resets_at,
            retry_after_seconds,
        }
    }
}

/// Truncates `now` to the start of its minute.
pub fn minute_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// Seconds until the next minute boundary, used as the rate-limit retry hint.
pub fn seconds_until_next_minute(now: DateTime<Utc>) -> u64 {
    let next_window = minute_window_start(now) + chrono::Duration::minutes(1);
    (next_window - now).num_seconds().max(0) as u64
}
