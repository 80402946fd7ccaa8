//! Engine tuning options.
//!
//! All thresholds are defaults rather than constants; deployments override
//! them through the `[engine]` table of the CLI configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid engine configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Configuration for the tracking engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// No user activity for this long pauses the current session.
    #[serde(alias = "inactivityTimeoutSeconds")]
    pub inactivity_timeout_seconds: u64,

    /// Pauses shorter than this are folded back into active time.
    #[serde(alias = "resumeGraceSeconds")]
    pub resume_grace_seconds: u64,

    /// Outbox debounce for critical host messages.
    #[serde(alias = "debounceCriticalMs")]
    pub debounce_critical_ms: u64,

    /// Outbox debounce for routine host messages.
    #[serde(alias = "debounceRoutineMs")]
    pub debounce_routine_ms: u64,

    /// Open sessions whose last heartbeat is older than this are finalized at boot.
    #[serde(alias = "staleSessionTTLHours", alias = "staleSessionTtlHours")]
    pub stale_session_ttl_hours: u64,

    /// Consecutive failures that open the circuit breaker.
    #[serde(alias = "circuitFailureThreshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open breaker rejects calls before a half-open trial.
    #[serde(alias = "circuitCooldownSeconds")]
    pub circuit_cooldown_seconds: u64,

    /// Coordinator debounce window for raw signals on the same lane.
    #[serde(alias = "signalDebounceMs")]
    pub signal_debounce_ms: u64,

    /// Nominal heartbeat period.
    #[serde(alias = "heartbeatIntervalSeconds")]
    pub heartbeat_interval_seconds: u64,

    /// A paused session is completed once the pause exceeds this.
    #[serde(alias = "maxPauseSeconds")]
    pub max_pause_seconds: u64,

    /// Period of routine session snapshots to the host.
    #[serde(alias = "snapshotIntervalSeconds")]
    pub snapshot_interval_seconds: u64,

    /// Timeout for a single host delivery.
    #[serde(alias = "sendTimeoutMs")]
    pub send_timeout_ms: u64,

    /// Maximum number of queued critical retries.
    #[serde(alias = "retryQueueCapacity")]
    pub retry_queue_capacity: usize,

    /// Attempts per store write before the record is parked in memory.
    #[serde(alias = "storeWriteAttempts")]
    pub store_write_attempts: u32,

    /// Completed sessions older than this many days are removed.
    #[serde(alias = "retentionDays")]
    pub retention_days: u32,

    /// A breaker open this long reports the engine as degraded.
    #[serde(alias = "degradedAfterSeconds")]
    pub degraded_after_seconds: u64,

    /// Period of the open-session consistency check.
    #[serde(alias = "selfCheckIntervalSeconds")]
    pub self_check_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_seconds: 300,
            resume_grace_seconds: 2,
            debounce_critical_ms: 200,
            debounce_routine_ms: 500,
            stale_session_ttl_hours: 24,
            circuit_failure_threshold: 3,
            circuit_cooldown_seconds: 30,
            signal_debounce_ms: 200,
            heartbeat_interval_seconds: 1,
            max_pause_seconds: 1800,
            snapshot_interval_seconds: 60,
            send_timeout_ms: 5000,
            retry_queue_capacity: 256,
            store_write_attempts: 3,
            retention_days: 90,
            degraded_after_seconds: 120,
            self_check_interval_seconds: 300,
        }
    }
}

/// Converts a configured count of seconds to a `chrono::Duration`, saturating.
fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

impl EngineConfig {
    /// Rejects values that would stall or disable the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 6] = [
            ("inactivity_timeout_seconds", self.inactivity_timeout_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("circuit_cooldown_seconds", self.circuit_cooldown_seconds),
            ("snapshot_interval_seconds", self.snapshot_interval_seconds),
            ("send_timeout_ms", self.send_timeout_ms),
            ("self_check_interval_seconds", self.self_check_interval_seconds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "circuit_failure_threshold",
            });
        }
        if self.retry_queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "retry_queue_capacity",
            });
        }
        if self.store_write_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "store_write_attempts",
            });
        }
        Ok(())
    }

    pub fn inactivity_timeout(&self) -> Duration {
        secs(self.inactivity_timeout_seconds)
    }

    pub fn resume_grace(&self) -> Duration {
        secs(self.resume_grace_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_seconds)
    }

    /// Largest heartbeat gap still accrued directly (1.5 ticks).
    pub fn max_expected_tick(&self) -> Duration {
        self.heartbeat_interval() * 3 / 2
    }

    pub fn max_pause(&self) -> Duration {
        secs(self.max_pause_seconds)
    }

    pub fn stale_session_ttl(&self) -> Duration {
        secs(self.stale_session_ttl_hours.saturating_mul(3600))
    }

    pub fn signal_debounce(&self) -> Duration {
        millis(self.signal_debounce_ms)
    }

    pub fn debounce_critical(&self) -> Duration {
        millis(self.debounce_critical_ms)
    }

    pub fn debounce_routine(&self) -> Duration {
        millis(self.debounce_routine_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        secs(self.circuit_cooldown_seconds)
    }

    pub fn snapshot_interval(&self) -> Duration {
        secs(self.snapshot_interval_seconds)
    }

    pub fn degraded_after(&self) -> Duration {
        secs(self.degraded_after_seconds)
    }

    pub fn self_check_interval(&self) -> Duration {
        secs(self.self_check_interval_seconds)
    }
}
