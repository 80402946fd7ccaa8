//! Duration accounting under a throttled or suspended runtime.
//!
//! Steady ticks accrue their delta directly. A gap longer than the expected
//! tick means the runtime was throttled or asleep, so the gap is not trusted;
//! the session is later reconciled against its wall-clock bounds instead.

use chrono::{DateTime, Duration, Utc};

use crate::session::ActivitySession;

/// Outcome of a single accrual step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accrual {
    /// The delta (ms) was added to the session.
    Accrued(i64),
    /// The gap was too long to trust; reconciliation is required.
    Gap(Duration),
    /// The instant precedes the last heartbeat and was ignored.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct DurationAccountant {
    max_expected_tick: Duration,
}

impl DurationAccountant {
    pub const fn new(max_expected_tick: Duration) -> Self {
        Self { max_expected_tick }
    }

    /// Accrues time from the session's last heartbeat up to `at`.
    ///
    /// `last_heartbeat_at` moves forward to `at` unless `at` is older.
    pub fn accrue(&self, session: &mut ActivitySession, at: DateTime<Utc>) -> Accrual {
        if at < session.last_heartbeat_at {
            return Accrual::Stale;
        }
        let delta = at - session.last_heartbeat_at;
        session.last_heartbeat_at = at;
        if delta <= self.max_expected_tick {
            let ms = delta.num_milliseconds();
            session.accumulated_ms = session.accumulated_ms.saturating_add(ms);
            Accrual::Accrued(ms)
        } else {
            tracing::debug!(
                session_id = %session.id,
                gap_ms = delta.num_milliseconds(),
                "heartbeat gap exceeds expected tick, deferring to reconciliation"
            );
            Accrual::Gap(delta)
        }
    }

    /// Resets accumulated time to `until - start - paused`, returning the
    /// correction applied in milliseconds.
    ///
    /// Never lowers the accumulated value; a negative correction means the
    /// wall clock stepped backwards and is only logged.
    pub fn reconcile(session: &mut ActivitySession, until: DateTime<Utc>) -> i64 {
        let truth = session.wall_clock_active_ms(until);
        let correction = truth - session.accumulated_ms;
        if correction < 0 {
            tracing::warn!(
                session_id = %session.id,
                correction_ms = correction,
                "wall-clock reconciliation below accumulated time, keeping accumulated"
            );
            return 0;
        }
        if correction > 0 {
            tracing::info!(
                session_id = %session.id,
                correction_ms = correction,
                accumulated_ms = truth,
                "reconciled accumulated time against wall clock"
            );
        }
        session.accumulated_ms = truth;
        correction
    }
}
