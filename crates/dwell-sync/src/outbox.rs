//! Debounced outbound posts.
//!
//! A post waits out its class's window; a newer post with the same
//! coalescing key replaces it, so bursts of settings or snapshots reach the
//! host once.

use chrono::{DateTime, Duration, Utc};
use dwell_core::debounce::Debouncer;
use dwell_core::{EngineConfig, Envelope, MessageClass};

#[derive(Debug, Clone)]
pub struct Outbox {
    pending: Debouncer<String, Envelope>,
    critical: Duration,
    routine: Duration,
}

impl Outbox {
    pub fn new(critical: Duration, routine: Duration) -> Self {
        Self {
            pending: Debouncer::new(),
            critical,
            routine,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.debounce_critical(), config.debounce_routine())
    }

    /// Schedules an envelope, returning `true` if it replaced a pending one.
    pub fn post(&mut self, envelope: Envelope, now: DateTime<Utc>) -> bool {
        let window = match envelope.class() {
            MessageClass::Critical => self.critical,
            MessageClass::Routine => self.routine,
        };
        let key = envelope.coalesce_key();
        let replaced = self.pending.push(key, envelope, now, window);
        if let Some(previous) = &replaced {
            tracing::debug!(kind = %previous.kind(), "coalesced pending post");
        }
        replaced.is_some()
    }

    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        self.pending.drain_due(now).into_iter().map(|(_, e)| e).collect()
    }

    pub fn drain_all(&mut self) -> Vec<Envelope> {
        self.pending.drain_all().into_iter().map(|(_, e)| e).collect()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
