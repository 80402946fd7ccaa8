//! Session state machine.
//!
//! The machine owns the single current-session slot. An open session is
//! either active or paused; completing it consumes the [`OpenSession`] and
//! yields a [`CompletedSession`], which has no transition methods at all, so a
//! finished session cannot be reopened by construction.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accountant::{Accrual, DurationAccountant};
use crate::clock::TimezoneContext;
use crate::config::EngineConfig;
use crate::session::{ActivitySession, PausedInterval, SessionStatus};
use crate::signal::Transition;
use crate::types::{ActivityKey, SessionId};

/// Host-pushed settings. Replaced whole, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    pub enabled: bool,
    pub blocklist: BTreeSet<ActivityKey>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            blocklist: BTreeSet::new(),
        }
    }
}

impl HostSettings {
    pub fn is_blocked(&self, key: &ActivityKey) -> bool {
        self.blocklist.contains(key)
    }
}

/// Why a start was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Disabled,
    Blocked,
}

/// A transition that does not apply to the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// The transition needs an open session and there is none.
    NoOpenSession { transition: &'static str },
    /// The transition does not apply in the current mode.
    Ignored {
        session_id: SessionId,
        transition: &'static str,
    },
}

/// Observable result of applying a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Opened(ActivitySession),
    Updated(ActivitySession),
    Finalized(CompletedSession),
    Refused { key: ActivityKey, reason: Refusal },
    Anomaly(Anomaly),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("session {0} is completed and cannot be reattached")]
pub struct ReattachError(pub SessionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Active,
    Paused { since: DateTime<Utc> },
}

/// The session currently occupying the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSession {
    record: ActivitySession,
    mode: Mode,
    last_activity_at: DateTime<Utc>,
    drift_pending: bool,
}

impl OpenSession {
    fn start(key: ActivityKey, at: DateTime<Utc>, timezone: TimezoneContext) -> Self {
        Self {
            record: ActivitySession::open(key, at, timezone),
            mode: Mode::Active,
            last_activity_at: at,
            drift_pending: false,
        }
    }

    /// Rebuilds an open session from a stored active or paused record.
    ///
    /// A paused record is resumed from its last heartbeat, which is where the
    /// pause began.
    pub fn reattach(record: ActivitySession) -> Result<Self, ReattachError> {
        let mode = match record.status {
            SessionStatus::Active => Mode::Active,
            SessionStatus::Paused => Mode::Paused {
                since: record.last_heartbeat_at,
            },
            SessionStatus::Completed => return Err(ReattachError(record.id)),
        };
        Ok(Self {
            last_activity_at: record.last_heartbeat_at,
            record,
            mode,
            drift_pending: false,
        })
    }

    pub const fn record(&self) -> &ActivitySession {
        &self.record
    }

    pub const fn is_paused(&self) -> bool {
        matches!(self.mode, Mode::Paused { .. })
    }

    fn set_paused(&mut self, since: DateTime<Utc>) {
        self.mode = Mode::Paused { since };
        self.record.status = SessionStatus::Paused;
    }

    fn set_active(&mut self) {
        self.mode = Mode::Active;
        self.record.status = SessionStatus::Active;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = self.last_activity_at.max(at);
    }

    /// Finalizes at `end` (already clamped by the caller) and consumes the session.
    fn complete(mut self, end: DateTime<Utc>) -> CompletedSession {
        let end = end.max(self.record.start_time);
        DurationAccountant::reconcile(&mut self.record, end);
        self.record.status = SessionStatus::Completed;
        self.record.end_time = Some(end);
        self.record.last_heartbeat_at = self.record.last_heartbeat_at.min(end);
        CompletedSession {
            record: self.record,
        }
    }
}

/// A finished session. Its core fields can no longer change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSession {
    record: ActivitySession,
}

impl CompletedSession {
    pub const fn record(&self) -> &ActivitySession {
        &self.record
    }

    pub fn into_record(self) -> ActivitySession {
        self.record
    }

    pub const fn id(&self) -> &SessionId {
        &self.record.id
    }
}

/// Owns the single current-session slot and applies transitions to it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    slot: Option<OpenSession>,
    accountant: DurationAccountant,
    inactivity_timeout: Duration,
    resume_grace: Duration,
    max_pause: Duration,
}

impl StateMachine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            slot: None,
            accountant: DurationAccountant::new(config.max_expected_tick()),
            inactivity_timeout: config.inactivity_timeout(),
            resume_grace: config.resume_grace(),
            max_pause: config.max_pause(),
        }
    }

    /// Installs a recovered session as the current one.
    pub fn attach(&mut self, session: OpenSession) {
        self.slot = Some(session);
    }

    pub fn current(&self) -> Option<&ActivitySession> {
        self.slot.as_ref().map(OpenSession::record)
    }

    pub fn current_open(&self) -> Option<&OpenSession> {
        self.slot.as_ref()
    }

    /// Applies one transition at `at` and reports what changed.
    pub fn apply(
        &mut self,
        transition: &Transition,
        at: DateTime<Utc>,
        settings: &HostSettings,
        timezone: &TimezoneContext,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        match transition {
            Transition::Start(key) => self.start(key, at, settings, timezone, &mut effects),
            Transition::Heartbeat => self.heartbeat(at, &mut effects),
            Transition::SwitchAway | Transition::Close => {
                self.finish(at, transition.name(), &mut effects);
            }
            Transition::InactivityTimeout => self.pause(at, &mut effects),
            Transition::Resume => self.resume(at, settings, &mut effects),
            Transition::StaleTimeout => self.stale(at, &mut effects),
        }
        for effect in &effects {
            if let Effect::Anomaly(anomaly) = effect {
                tracing::debug!(?anomaly, "transition did not apply");
            }
        }
        effects
    }

    fn start(
        &mut self,
        key: &ActivityKey,
        at: DateTime<Utc>,
        settings: &HostSettings,
        timezone: &TimezoneContext,
        effects: &mut Vec<Effect>,
    ) {
        let current = self
            .slot
            .as_ref()
            .map(|open| (&open.record.activity_key == key, open.is_paused()));
        match current {
            // Activating the current activity again is a regain.
            Some((true, paused)) => {
                if !paused {
                    self.heartbeat(at, effects);
                }
                if self.slot.is_some() {
                    self.resume(at, settings, effects);
                    return;
                }
            }
            Some((false, _)) => self.finish(at, "start", effects),
            None => {}
        }
        self.open(key.clone(), at, settings, timezone.clone(), effects);
    }

    fn open(
        &mut self,
        key: ActivityKey,
        at: DateTime<Utc>,
        settings: &HostSettings,
        timezone: TimezoneContext,
        effects: &mut Vec<Effect>,
    ) {
        let refusal = if !settings.enabled {
            Some(Refusal::Disabled)
        } else if settings.is_blocked(&key) {
            Some(Refusal::Blocked)
        } else {
            None
        };
        if let Some(reason) = refusal {
            tracing::debug!(activity_key = %key, ?reason, "not tracking activity");
            effects.push(Effect::Refused { key, reason });
            return;
        }
        let open = OpenSession::start(key, at, timezone);
        tracing::info!(
            session_id = %open.record.id,
            activity_key = %open.record.activity_key,
            "session opened"
        );
        effects.push(Effect::Opened(open.record.clone()));
        self.slot = Some(open);
    }

    /// Accrues active time up to `at`, pausing if the inactivity timeout
    /// elapsed first. Time is only accrued to the pause point.
    fn advance(&self, open: &mut OpenSession, at: DateTime<Utc>) {
        if open.is_paused() {
            return;
        }
        let pause_at = open.last_activity_at + self.inactivity_timeout;
        let inactive = at >= pause_at;
        let until = if inactive {
            pause_at.max(open.record.last_heartbeat_at)
        } else {
            at
        };
        if let Accrual::Gap(_) = self.accountant.accrue(&mut open.record, until) {
            open.drift_pending = true;
        }
        if inactive {
            tracing::info!(session_id = %open.record.id, paused_at = %until, "session paused after inactivity");
            open.set_paused(until);
        }
    }

    fn heartbeat(&mut self, at: DateTime<Utc>, effects: &mut Vec<Effect>) {
        // Ticks keep arriving while nothing is tracked, so an empty slot is
        // not an anomaly here.
        let Some(mut open) = self.slot.take() else {
            return;
        };

        // Sessions never span day buckets: close at local midnight and carry on
        // in a fresh session for the same activity.
        loop {
            let boundary = open
                .record
                .timezone_context
                .next_midnight_after(open.record.start_time);
            if open.is_paused() || at < boundary {
                break;
            }
            self.advance(&mut open, boundary);
            if open.is_paused() {
                break;
            }
            let key = open.record.activity_key.clone();
            let timezone = open.record.timezone_context.clone();
            let last_activity_at = open.last_activity_at;
            tracing::info!(session_id = %open.record.id, %boundary, "splitting session at day boundary");
            effects.push(Effect::Finalized(open.complete(boundary)));

            open = OpenSession::start(key, boundary, timezone);
            open.last_activity_at = last_activity_at.max(boundary - self.inactivity_timeout);
            effects.push(Effect::Opened(open.record.clone()));
        }

        match open.mode {
            Mode::Active => {
                self.advance(&mut open, at);
                effects.push(Effect::Updated(open.record.clone()));
                self.slot = Some(open);
            }
            Mode::Paused { since } => {
                self.slot = Some(open);
                if at - since >= self.max_pause {
                    self.stale(at, effects);
                }
            }
        }
    }

    fn pause(&mut self, at: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let Some(mut open) = self.slot.take() else {
            effects.push(Effect::Anomaly(Anomaly::NoOpenSession {
                transition: "inactivity_timeout",
            }));
            return;
        };
        if open.is_paused() {
            effects.push(Effect::Anomaly(Anomaly::Ignored {
                session_id: open.record.id.clone(),
                transition: "inactivity_timeout",
            }));
            self.slot = Some(open);
            return;
        }
        self.advance(&mut open, at);
        if !open.is_paused() {
            let since = open.record.last_heartbeat_at;
            tracing::info!(session_id = %open.record.id, "session paused on idle signal");
            open.set_paused(since);
        }
        effects.push(Effect::Updated(open.record.clone()));
        self.slot = Some(open);
    }

    fn resume(&mut self, at: DateTime<Utc>, settings: &HostSettings, effects: &mut Vec<Effect>) {
        let Some(mut open) = self.slot.take() else {
            effects.push(Effect::Anomaly(Anomaly::NoOpenSession {
                transition: "resume",
            }));
            return;
        };

        // A regain can be the first signal after a long suspension, so the
        // inactivity timeout is applied before the activity is registered.
        self.advance(&mut open, at);

        if let Mode::Paused { since } = open.mode {
            let at = at.max(since);
            if open.record.timezone_context.day_of(at) != open.record.day() {
                let key = open.record.activity_key.clone();
                let timezone = open.record.timezone_context.clone();
                effects.push(Effect::Finalized(open.complete(since)));
                self.open(key, at, settings, timezone, effects);
                return;
            }
            let gap = at - since;
            if gap < self.resume_grace {
                open.record.accumulated_ms += gap.num_milliseconds();
            } else {
                open.record.paused_intervals.push(PausedInterval { start: since, end: at });
            }
            open.record.last_heartbeat_at = at;
            open.set_active();
            tracing::info!(session_id = %open.record.id, paused_ms = gap.num_milliseconds(), "session resumed");
        }

        open.touch(at);
        if open.drift_pending {
            let until = open.record.last_heartbeat_at.max(at);
            self.accountant.accrue(&mut open.record, until);
            DurationAccountant::reconcile(&mut open.record, until);
            open.drift_pending = false;
        }
        match effects.last_mut() {
            Some(Effect::Updated(last)) if last.id == open.record.id => *last = open.record.clone(),
            _ => effects.push(Effect::Updated(open.record.clone())),
        }
        self.slot = Some(open);
    }

    fn stale(&mut self, at: DateTime<Utc>, effects: &mut Vec<Effect>) {
        match &self.slot {
            Some(open) if open.is_paused() => self.finish(at, "stale_timeout", effects),
            Some(open) => effects.push(Effect::Anomaly(Anomaly::Ignored {
                session_id: open.record.id.clone(),
                transition: "stale_timeout",
            })),
            None => effects.push(Effect::Anomaly(Anomaly::NoOpenSession {
                transition: "stale_timeout",
            })),
        }
    }

    fn finish(&mut self, at: DateTime<Utc>, cause: &'static str, effects: &mut Vec<Effect>) {
        let Some(mut open) = self.slot.take() else {
            effects.push(Effect::Anomaly(Anomaly::NoOpenSession { transition: cause }));
            return;
        };
        self.advance(&mut open, at);
        let end = match open.mode {
            Mode::Paused { since } => since,
            Mode::Active => at.max(open.record.last_heartbeat_at),
        };
        let completed = open.complete(end);
        tracing::info!(
            session_id = %completed.id(),
            activity_key = %completed.record().activity_key,
            accumulated_ms = completed.record().accumulated_ms,
            cause,
            "session completed"
        );
        effects.push(Effect::Finalized(completed));
    }
}

/// Completes a stored open record at its last heartbeat without a slot.
///
/// Used when a record is abandoned (stale at boot, or a stray duplicate).
pub fn finalize_abandoned(record: ActivitySession) -> Result<CompletedSession, ReattachError> {
    let open = OpenSession::reattach(record)?;
    let end = match open.mode {
        Mode::Paused { since } => since,
        Mode::Active => open.record.last_heartbeat_at,
    };
    Ok(open.complete(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(seconds)
    }

    fn key(s: &str) -> ActivityKey {
        ActivityKey::new(s).unwrap()
    }

    struct Harness {
        machine: StateMachine,
        settings: HostSettings,
        tz: TimezoneContext,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(&EngineConfig::default())
        }

        fn with_config(config: &EngineConfig) -> Self {
            Self {
                machine: StateMachine::new(config),
                settings: HostSettings::default(),
                tz: TimezoneContext::utc(),
            }
        }

        fn apply(&mut self, transition: Transition, at: DateTime<Utc>) -> Vec<Effect> {
            self.machine.apply(&transition, at, &self.settings, &self.tz)
        }

        fn tick_through(&mut self, from: i64, to: i64) {
            for s in from..=to {
                self.apply(Transition::Heartbeat, t(s));
            }
        }
    }

    fn finalized(effects: &[Effect]) -> Vec<&ActivitySession> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Finalized(done) => Some(done.record()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn active_then_switch_away_completes_with_elapsed_time() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 5);
        let effects = h.apply(Transition::SwitchAway, t(5));

        let done = finalized(&effects);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, SessionStatus::Completed);
        assert_eq!(done[0].accumulated_seconds(), 5);
        assert_eq!(done[0].end_time, Some(t(5)));
        assert!(h.machine.current().is_none());
    }

    #[test]
    fn switch_away_without_ticks_reconciles_to_wall_clock() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        let effects = h.apply(Transition::SwitchAway, t(5));
        assert_eq!(finalized(&effects)[0].accumulated_ms, 5000);
    }

    #[test]
    fn inactivity_pauses_and_resume_excludes_idle_gap() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 301);

        let current = h.machine.current().unwrap();
        assert_eq!(current.status, SessionStatus::Paused);
        assert_eq!(current.accumulated_seconds(), 300);

        h.apply(Transition::Resume, t(302));
        let current = h.machine.current().unwrap();
        assert_eq!(current.status, SessionStatus::Active);
        assert_eq!(
            current.paused_intervals,
            vec![PausedInterval { start: t(300), end: t(302) }]
        );
        assert_eq!(current.accumulated_seconds(), 300);

        h.tick_through(303, 305);
        let effects = h.apply(Transition::SwitchAway, t(305));
        assert_eq!(finalized(&effects)[0].accumulated_seconds(), 303);
    }

    #[test]
    fn throttled_heartbeats_are_reconciled_on_regain() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 5);
        // Runtime suspended: next tick arrives ten periods late.
        h.apply(Transition::Heartbeat, t(15));
        assert_eq!(h.machine.current().unwrap().accumulated_seconds(), 5);

        h.apply(Transition::Resume, t(15));
        let current = h.machine.current().unwrap();
        assert_eq!(current.accumulated_ms, current.wall_clock_active_ms(t(15)));
        assert_eq!(current.accumulated_seconds(), 15);
    }

    #[test]
    fn throttled_heartbeats_are_reconciled_on_keyed_regain() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 5);
        h.apply(Transition::Heartbeat, t(15));
        assert_eq!(h.machine.current().unwrap().accumulated_seconds(), 5);

        let effects = h.apply(Transition::Start(key("a.com")), t(15));
        assert!(effects.iter().all(|e| !matches!(e, Effect::Opened(_))));
        let current = h.machine.current().unwrap();
        assert_eq!(current.accumulated_ms, current.wall_clock_active_ms(t(15)));
        assert_eq!(current.accumulated_seconds(), 15);
        assert!(matches!(effects.last(), Some(Effect::Updated(s)) if s.accumulated_ms == 15_000));
    }

    #[test]
    fn redundant_start_for_active_key_is_a_heartbeat() {
        let mut h = Harness::new();
        let opened = h.apply(Transition::Start(key("a.com")), t(0));
        let id = match &opened[0] {
            Effect::Opened(session) => session.id.clone(),
            other => panic!("expected Opened, got {other:?}"),
        };
        let effects = h.apply(Transition::Start(key("a.com")), t(1));
        assert!(effects.iter().all(|e| !matches!(e, Effect::Opened(_))));
        assert_eq!(h.machine.current().unwrap().id, id);
        assert_eq!(h.machine.current().unwrap().accumulated_ms, 1000);
    }

    #[test]
    fn starting_another_key_completes_the_current_one() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 3);
        let effects = h.apply(Transition::Start(key("b.com")), t(3));

        assert_eq!(finalized(&effects)[0].activity_key, key("a.com"));
        assert!(matches!(effects.last(), Some(Effect::Opened(s)) if s.activity_key == key("b.com")));
        assert_eq!(h.machine.current().unwrap().activity_key, key("b.com"));
    }

    #[test]
    fn resume_while_active_is_ignored() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 2);
        h.apply(Transition::Resume, t(2));
        let current = h.machine.current().unwrap();
        assert_eq!(current.status, SessionStatus::Active);
        assert!(current.paused_intervals.is_empty());
        assert_eq!(current.accumulated_seconds(), 2);
    }

    #[test]
    fn short_pause_within_grace_is_not_recorded() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 10);
        h.apply(Transition::InactivityTimeout, t(10));
        h.apply(Transition::Resume, t(11));
        let current = h.machine.current().unwrap();
        assert!(current.paused_intervals.is_empty());
        assert_eq!(current.accumulated_seconds(), 11);
    }

    #[test]
    fn paused_session_goes_stale_and_completes_at_pause_start() {
        let config = EngineConfig {
            max_pause_seconds: 60,
            ..EngineConfig::default()
        };
        let mut h = Harness::with_config(&config);
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 10);
        h.apply(Transition::InactivityTimeout, t(10));
        let effects = h.apply(Transition::Heartbeat, t(70));

        let done = finalized(&effects);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].end_time, Some(t(10)));
        assert_eq!(done[0].accumulated_seconds(), 10);
        assert!(h.machine.current().is_none());
    }

    #[test]
    fn session_is_split_at_local_midnight() {
        let mut h = Harness::new();
        let evening = DateTime::parse_from_rfc3339("2025-06-01T23:59:58Z")
            .unwrap()
            .with_timezone(&Utc);
        h.apply(Transition::Start(key("a.com")), evening);
        h.apply(Transition::Heartbeat, evening + Duration::seconds(1));
        let effects = h.apply(Transition::Heartbeat, evening + Duration::seconds(3));

        let done = finalized(&effects);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].day_key(), "2025-06-01");
        assert_eq!(done[0].accumulated_seconds(), 2);

        let current = h.machine.current().unwrap();
        assert_eq!(current.day_key(), "2025-06-02");
        assert_eq!(current.activity_key, key("a.com"));
        assert_eq!(current.accumulated_seconds(), 1);
    }

    #[test]
    fn disabled_engine_refuses_to_start() {
        let mut h = Harness::new();
        h.settings.enabled = false;
        let effects = h.apply(Transition::Start(key("a.com")), t(0));
        assert_eq!(
            effects,
            vec![Effect::Refused {
                key: key("a.com"),
                reason: Refusal::Disabled
            }]
        );
        assert!(h.machine.current().is_none());
    }

    #[test]
    fn blocked_key_is_refused() {
        let mut h = Harness::new();
        h.settings.blocklist.insert(key("social.example"));
        let effects = h.apply(Transition::Start(key("social.example")), t(0));
        assert!(matches!(
            effects[0],
            Effect::Refused {
                reason: Refusal::Blocked,
                ..
            }
        ));
    }

    #[test]
    fn transitions_without_session_are_anomalies() {
        let mut h = Harness::new();
        for transition in [Transition::SwitchAway, Transition::Resume, Transition::InactivityTimeout] {
            let effects = h.apply(transition, t(0));
            assert!(matches!(effects[0], Effect::Anomaly(Anomaly::NoOpenSession { .. })));
        }
        // Idle ticks with nothing tracked are silent.
        assert!(h.apply(Transition::Heartbeat, t(1)).is_empty());
    }

    #[test]
    fn completed_record_cannot_be_reattached() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        let effects = h.apply(Transition::Close, t(4));
        let record = finalized(&effects)[0].clone();
        assert!(OpenSession::reattach(record.clone()).is_err());
        assert!(finalize_abandoned(record).is_err());
    }

    #[test]
    fn reattached_paused_session_resumes_from_pause_start() {
        let mut h = Harness::new();
        h.apply(Transition::Start(key("a.com")), t(0));
        h.tick_through(1, 10);
        h.apply(Transition::InactivityTimeout, t(10));
        let stored = h.machine.current().unwrap().clone();

        let mut restarted = Harness::new();
        restarted.machine.attach(OpenSession::reattach(stored).unwrap());
        restarted.apply(Transition::Resume, t(20));
        let current = restarted.machine.current().unwrap();
        assert_eq!(current.paused_intervals, vec![PausedInterval { start: t(10), end: t(20) }]);
        assert_eq!(current.accumulated_seconds(), 10);
    }

    #[test]
    fn at_most_one_open_session_across_random_sequence() {
        let mut h = Harness::new();
        let keys = ["a.com", "b.com", "c.com"];
        let mut opened = 0usize;
        let mut finished = 0usize;
        for step in 0..200i64 {
            let transition = match step % 7 {
                0 | 3 => Transition::Start(key(keys[usize::try_from(step % 3).unwrap()])),
                1 | 4 => Transition::Heartbeat,
                2 => Transition::InactivityTimeout,
                5 => Transition::Resume,
                _ => Transition::SwitchAway,
            };
            for effect in h.apply(transition, t(step)) {
                match effect {
                    Effect::Opened(_) => opened += 1,
                    Effect::Finalized(done) => {
                        finished += 1;
                        assert_eq!(done.record().status, SessionStatus::Completed);
                    }
                    _ => {}
                }
            }
            let open_now = usize::from(h.machine.current().is_some());
            assert_eq!(opened - finished, open_now);
        }
    }
}
