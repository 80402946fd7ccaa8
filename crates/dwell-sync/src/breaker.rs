//! Circuit breaker for host delivery.
//!
//! A pure state machine: every method takes the current instant, so tests
//! drive it with a manual clock instead of waiting out cooldowns.

use chrono::{DateTime, Duration, Utc};
use dwell_core::{CircuitStateKind, EngineConfig};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: DateTime<Utc> },
    /// The single trial call is in flight.
    HalfOpen,
}

/// Breaker state as exposed to status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: State,
    failure_threshold: u32,
    cooldown: Duration,
    degraded_after: Duration,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last left `closed`; cleared on recovery.
    unhealthy_since: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, degraded_after: Duration) -> Self {
        Self {
            state: State::Closed,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            degraded_after,
            consecutive_failures: 0,
            last_failure_at: None,
            unhealthy_since: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            config.circuit_cooldown(),
            config.degraded_after(),
        )
    }

    /// Asks permission for one call.
    ///
    /// An open breaker whose cooldown elapsed moves to half-open and admits a
    /// single trial; further calls are refused until the trial is recorded.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { until } if now >= until => {
                tracing::info!("circuit half-open, allowing trial call");
                self.state = State::HalfOpen;
                true
            }
            State::Open { .. } | State::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self) {
        if self.state != State::Closed {
            tracing::info!("circuit closed");
        }
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.unhealthy_since = None;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        let trip = match self.state {
            State::Closed => self.consecutive_failures >= self.failure_threshold,
            State::HalfOpen => true,
            State::Open { .. } => false,
        };
        if trip {
            tracing::warn!(
                consecutive_failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.num_seconds(),
                "circuit opened"
            );
            self.state = State::Open {
                until: now + self.cooldown,
            };
            self.unhealthy_since.get_or_insert(now);
        }
    }

    pub const fn state(&self) -> CircuitStateKind {
        match self.state {
            State::Closed => CircuitStateKind::Closed,
            State::Open { .. } => CircuitStateKind::Open,
            State::HalfOpen => CircuitStateKind::HalfOpen,
        }
    }

    pub const fn snapshot(&self) -> CircuitState {
        CircuitState {
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
        }
    }

    /// When an open breaker will admit its trial call.
    pub const fn reopens_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            State::Open { until } => Some(until),
            State::Closed | State::HalfOpen => None,
        }
    }

    /// Whether the breaker has failed to close for `degraded_after`.
    pub fn is_degraded(&self, now: DateTime<Utc>) -> bool {
        self.unhealthy_since
            .is_some_and(|since| now - since >= self.degraded_after)
    }
}
