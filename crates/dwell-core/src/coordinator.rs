//! Event coordinator: the single ingestion point for raw signals.
//!
//! Browsers fire several events for one user action (tab activation, URL
//! update and window focus often arrive within a few milliseconds). The
//! coordinator debounces them per lane and releases one normalized
//! transition per logical change.

use chrono::{DateTime, Duration, Utc};

use crate::debounce::Debouncer;
use crate::signal::{RawSignal, Transition};
use crate::types::ActivityKey;

/// Debouncing partition: an activity key, or `None` for key-less signals.
pub type Lane = Option<ActivityKey>;

/// A transition released by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub lane: Lane,
    pub transition: Transition,
    /// When the change happened, never later than when it was submitted.
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EventCoordinator {
    pending: Debouncer<Lane, (Transition, DateTime<Utc>)>,
    window: Duration,
    dropped: u64,
    collapsed: u64,
}

impl EventCoordinator {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Debouncer::new(),
            window,
            dropped: 0,
            collapsed: 0,
        }
    }

    /// Accepts a raw signal. Invalid signals are logged and dropped.
    pub fn submit(&mut self, signal: &RawSignal, now: DateTime<Utc>) {
        let (lane, transition) = match signal.key().and_then(|key| Ok((key, signal.normalize()?))) {
            Ok(normalized) => normalized,
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(kind = %signal.kind, error = %err, "dropping invalid signal");
                return;
            }
        };
        let at = signal.observed_at.min(now);
        if let Some((superseded, _)) = self.pending.push(lane, (transition, at), now, self.window) {
            self.collapsed += 1;
            tracing::debug!(superseded = superseded.name(), "debounced signal");
        }
    }

    /// Releases every transition whose debounce window has closed.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        Self::into_dispatches(self.pending.drain_due(now))
    }

    /// Releases everything still pending, e.g. before shutdown.
    pub fn flush(&mut self) -> Vec<Dispatch> {
        Self::into_dispatches(self.pending.drain_all())
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.next_deadline()
    }

    /// Number of signals dropped as invalid since creation.
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of signals superseded inside a debounce window.
    pub const fn collapsed(&self) -> u64 {
        self.collapsed
    }

    fn into_dispatches(due: Vec<(Lane, (Transition, DateTime<Utc>))>) -> Vec<Dispatch> {
        due.into_iter()
            .map(|(lane, (transition, at))| Dispatch {
                lane,
                transition,
                at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[test]
    fn burst_for_one_key_collapses_to_one_start() {
        let mut coordinator = EventCoordinator::new(ms(200));
        for i in 0..10 {
            let now = t0() + ms(i * 10);
            coordinator.submit(&RawSignal::new(SignalKind::Activate, Some("a.com"), now), now);
        }
        assert!(coordinator.drain_due(t0() + ms(200)).is_empty());

        let released = coordinator.drain_due(t0() + ms(300));
        assert_eq!(released.len(), 1);
        assert_eq!(
            released[0].transition,
            Transition::Start(ActivityKey::new("a.com").unwrap())
        );
        assert_eq!(released[0].at, t0() + ms(90));
        assert_eq!(coordinator.collapsed(), 9);
    }

    #[test]
    fn lanes_release_in_window_close_order() {
        let mut coordinator = EventCoordinator::new(ms(200));
        coordinator.submit(&RawSignal::new(SignalKind::Activate, Some("a.com"), t0()), t0());
        coordinator.submit(&RawSignal::new(SignalKind::Hidden, None, t0() + ms(50)), t0() + ms(50));
        coordinator.submit(
            &RawSignal::new(SignalKind::Activate, Some("b.com"), t0() + ms(100)),
            t0() + ms(100),
        );

        let released: Vec<_> = coordinator
            .drain_due(t0() + ms(1000))
            .into_iter()
            .map(|dispatch| dispatch.transition.name())
            .collect();
        assert_eq!(released, vec!["start", "switch_away", "start"]);
    }

    #[test]
    fn invalid_signal_is_dropped_without_blocking_others() {
        let mut coordinator = EventCoordinator::new(ms(200));
        coordinator.submit(&RawSignal::new(SignalKind::Activate, None, t0()), t0());
        coordinator.submit(&RawSignal::new(SignalKind::Activate, Some("a.com"), t0()), t0());
        assert_eq!(coordinator.dropped(), 1);
        assert_eq!(coordinator.drain_due(t0() + ms(200)).len(), 1);
    }

    #[test]
    fn future_timestamps_are_clamped_to_submission_time() {
        let mut coordinator = EventCoordinator::new(ms(200));
        let future = t0() + Duration::hours(1);
        coordinator.submit(&RawSignal::new(SignalKind::Activate, Some("a.com"), future), t0());
        let released = coordinator.flush();
        assert_eq!(released[0].at, t0());
    }
}
