//! Activity session records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{TimezoneContext, day_key};
use crate::types::{ActivityKey, SessionId};

/// Lifecycle status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    /// Returns the string representation for SQL storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("invalid session status: {s}")),
        }
    }
}

/// A closed interval of idle time excluded from a session's active time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PausedInterval {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds().max(0)
    }
}

/// One contiguous (possibly paused) engagement with an activity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySession {
    pub id: SessionId,
    pub activity_key: ActivityKey,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Active time in milliseconds.
    pub accumulated_ms: i64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub timezone_context: TimezoneContext,
    #[serde(default)]
    pub paused_intervals: Vec<PausedInterval>,
    /// Set once the host acknowledged the finalized record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Why a stored record failed its invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    NegativeDuration(i64),
    MissingEndTime,
    EndBeforeStart,
    HeartbeatBeforeStart,
    InvalidPause,
    OffsetOutOfRange(i32),
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeDuration(ms) => write!(f, "negative accumulated duration ({ms}ms)"),
            Self::MissingEndTime => f.write_str("completed session has no end time"),
            Self::EndBeforeStart => f.write_str("end time precedes start time"),
            Self::HeartbeatBeforeStart => f.write_str("last heartbeat precedes start time"),
            Self::InvalidPause => f.write_str("paused interval ends before it starts"),
            Self::OffsetOutOfRange(minutes) => write!(f, "utc offset out of range ({minutes} minutes)"),
        }
    }
}

impl ActivitySession {
    /// Opens a new active session.
    pub fn open(activity_key: ActivityKey, at: DateTime<Utc>, timezone_context: TimezoneContext) -> Self {
        Self {
            id: SessionId::generate(),
            activity_key,
            status: SessionStatus::Active,
            start_time: at,
            end_time: None,
            accumulated_ms: 0,
            last_heartbeat_at: at,
            timezone_context,
            paused_intervals: Vec::new(),
            synced_at: None,
        }
    }

    /// The day bucket this session belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timezone_context.day_of(self.start_time)
    }

    pub fn day_key(&self) -> String {
        day_key(self.day())
    }

    pub const fn accumulated_seconds(&self) -> i64 {
        self.accumulated_ms / 1000
    }

    pub fn paused_ms(&self) -> i64 {
        self.paused_intervals
            .iter()
            .map(PausedInterval::duration_ms)
            .sum()
    }

    /// Wall-clock active time up to `until`: elapsed minus recorded pauses.
    pub fn wall_clock_active_ms(&self, until: DateTime<Utc>) -> i64 {
        ((until - self.start_time).num_milliseconds() - self.paused_ms()).max(0)
    }

    pub const fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Whether the fields frozen at completion are equal.
    pub fn same_core(&self, other: &Self) -> bool {
        self.activity_key == other.activity_key
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.accumulated_ms == other.accumulated_ms
    }

    /// Checks the invariants every stored record must satisfy.
    pub fn check(&self) -> Result<(), Corruption> {
        if self.accumulated_ms < 0 {
            return Err(Corruption::NegativeDuration(self.accumulated_ms));
        }
        if self.last_heartbeat_at < self.start_time {
            return Err(Corruption::HeartbeatBeforeStart);
        }
        match (self.status, self.end_time) {
            (SessionStatus::Completed, None) => return Err(Corruption::MissingEndTime),
            (_, Some(end)) if end < self.start_time => return Err(Corruption::EndBeforeStart),
            _ => {}
        }
        if self.paused_intervals.iter().any(|pause| pause.end < pause.start) {
            return Err(Corruption::InvalidPause);
        }
        if !self.timezone_context.has_valid_offset() {
            return Err(Corruption::OffsetOutOfRange(self.timezone_context.utc_offset_minutes));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn session() -> ActivitySession {
        ActivitySession::open(
            ActivityKey::new("example.com").unwrap(),
            t0(),
            TimezoneContext::utc(),
        )
    }

    #[test]
    fn open_session_is_active_with_zero_time() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.accumulated_ms, 0);
        assert_eq!(s.last_heartbeat_at, t0());
        assert_eq!(s.day_key(), "2025-06-01");
        assert!(s.check().is_ok());
    }

    #[test]
    fn wall_clock_active_excludes_pauses() {
        let mut s = session();
        s.paused_intervals.push(PausedInterval {
            start: t0() + Duration::seconds(10),
            end: t0() + Duration::seconds(25),
        });
        assert_eq!(s.wall_clock_active_ms(t0() + Duration::seconds(60)), 45_000);
    }

    #[test]
    fn check_flags_corruption() {
        let mut negative = session();
        negative.accumulated_ms = -5;
        assert_eq!(negative.check(), Err(Corruption::NegativeDuration(-5)));

        let mut no_end = session();
        no_end.status = SessionStatus::Completed;
        assert_eq!(no_end.check(), Err(Corruption::MissingEndTime));

        let mut reversed = session();
        reversed.status = SessionStatus::Completed;
        reversed.end_time = Some(t0() - Duration::seconds(1));
        assert_eq!(reversed.check(), Err(Corruption::EndBeforeStart));
    }

    #[test]
    fn check_flags_offset_beyond_a_day() {
        let mut skewed = session();
        skewed.timezone_context = TimezoneContext::fixed("bogus", 40_000_000);
        assert_eq!(skewed.check(), Err(Corruption::OffsetOutOfRange(40_000_000)));

        skewed.timezone_context = TimezoneContext::fixed("America/New_York", -300);
        assert_eq!(skewed.check(), Ok(()));
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let json = serde_json::to_value(session()).unwrap();
        assert!(json["activityKey"].is_string());
        assert_eq!(json["status"], "active");
        assert!(json["timezoneContext"]["utcOffsetMinutes"].is_number());
        assert!(json.get("syncedAt").is_none());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [SessionStatus::Active, SessionStatus::Paused, SessionStatus::Completed] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("running".parse::<SessionStatus>().is_err());
    }
}
