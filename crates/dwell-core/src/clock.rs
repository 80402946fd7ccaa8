//! Wall-clock and timezone sources.
//!
//! Everything that reads time goes through [`Clock`] so tests can drive the
//! engine with a [`ManualClock`] instead of sleeping.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A source of the current instant and of the timezone to attribute new
/// sessions to.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn timezone(&self) -> TimezoneContext;
}

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Timezone captured when a session is created.
///
/// The offset is frozen at capture time, so a DST change during a session does
/// not move it to a different day bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimezoneContext {
    /// IANA zone name (e.g. `Europe/Berlin`), informational only.
    pub timezone: String,
    /// Offset from UTC in minutes at capture time.
    pub utc_offset_minutes: i32,
}

impl TimezoneContext {
    /// The UTC context.
    pub fn utc() -> Self {
        Self {
            timezone: "UTC".to_string(),
            utc_offset_minutes: 0,
        }
    }

    /// Creates a fixed-offset context.
    pub fn fixed(timezone: impl Into<String>, utc_offset_minutes: i32) -> Self {
        Self {
            timezone: timezone.into(),
            utc_offset_minutes,
        }
    }

    /// Whether the offset is strictly within one day of UTC.
    pub const fn has_valid_offset(&self) -> bool {
        self.utc_offset_minutes.unsigned_abs() < MINUTES_PER_DAY
    }

    /// Returns the captured offset, falling back to UTC when out of range.
    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Returns the calendar date of `instant` in this context.
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset()).date_naive()
    }

    /// Returns the first local midnight strictly after `instant`, as UTC.
    pub fn next_midnight_after(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.offset();
        let local = instant.with_timezone(&offset);
        let next_day = local.date_naive() + Duration::days(1);
        next_day
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| offset.from_local_datetime(&midnight).single())
            .map_or_else(
                || instant + Duration::days(1),
                |midnight| midnight.with_timezone(&Utc),
            )
    }
}

/// Formats a date as a day bucket key (`YYYY-MM-DD`).
pub fn day_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

/// The real system clock, attributing sessions to the host's local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> TimezoneContext {
        let timezone = iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string());
        let utc_offset_minutes = Local::now().offset().local_minus_utc() / 60;
        TimezoneContext {
            timezone,
            utc_offset_minutes,
        }
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    timezone: TimezoneContext,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_timezone(start, TimezoneContext::utc())
    }

    pub fn with_timezone(start: DateTime<Utc>, timezone: TimezoneContext) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            timezone,
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timezone(&self) -> TimezoneContext {
        self.timezone.clone()
    }
}
