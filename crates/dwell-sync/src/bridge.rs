//! The sync bridge: every message to the host goes through here.
//!
//! Delivery is guarded by a circuit breaker and bounded by a timeout.
//! Critical messages that cannot be delivered are kept in the retry queue;
//! routine ones are dropped.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dwell_core::{CircuitStateKind, Clock, EngineConfig, Envelope, MessageClass};
use serde::Serialize;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::channel::{Channel, ChannelError};
use crate::outbox::Outbox;
use crate::retry::RetryQueue;

/// Result of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered,
    Queued,
    Rejected,
}

pub struct Bridge<C> {
    channel: C,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    retry: RetryQueue,
    outbox: Outbox,
    send_timeout: StdDuration,
}

impl<C> std::fmt::Debug for Bridge<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("breaker", &self.breaker.snapshot())
            .field("retry", &self.retry.len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl<C: Channel> Bridge<C> {
    pub fn new(channel: C, config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            clock,
            breaker: CircuitBreaker::from_config(config),
            retry: RetryQueue::new(config.retry_queue_capacity),
            outbox: Outbox::from_config(config),
            send_timeout: StdDuration::from_millis(config.send_timeout_ms),
        }
    }

    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Schedules a debounced send.
    pub fn post(&mut self, envelope: Envelope) {
        let now = self.clock.now();
        self.outbox.post(envelope, now);
    }

    /// Sends one envelope now, through the breaker.
    pub async fn send(&mut self, envelope: Envelope) -> SendOutcome {
        let now = self.clock.now();
        let class = envelope.class();
        if !self.breaker.try_acquire(now) {
            tracing::debug!(kind = %envelope.kind(), "circuit open, not calling host");
            return match class {
                MessageClass::Critical => {
                    self.retry.enqueue(envelope, now);
                    SendOutcome::Queued
                }
                MessageClass::Routine => SendOutcome::Rejected,
            };
        }

        match self.attempt(&envelope).await {
            Ok(()) => SendOutcome::Delivered,
            Err(err) => {
                tracing::warn!(kind = %envelope.kind(), error = %err, "host delivery failed");
                match class {
                    MessageClass::Critical => {
                        self.retry.enqueue_failed(envelope, self.clock.now(), &err);
                        SendOutcome::Queued
                    }
                    MessageClass::Routine => SendOutcome::Rejected,
                }
            }
        }
    }

    /// Sends what is due in the outbox, then retries what is due in the queue.
    ///
    /// Returns the envelopes delivered.
    pub async fn pump(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        for envelope in self.outbox.drain_due(self.clock.now()) {
            if self.send(envelope.clone()).await == SendOutcome::Delivered {
                delivered.push(envelope);
            }
        }
        delivered.extend(self.retry_due().await);
        delivered
    }

    /// Sends everything pending in the outbox regardless of debounce.
    pub async fn flush(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        for envelope in self.outbox.drain_all() {
            if self.send(envelope.clone()).await == SendOutcome::Delivered {
                delivered.push(envelope);
            }
        }
        delivered
    }

    async fn retry_due(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        loop {
            let now = self.clock.now();
            if !self.retry.has_due(now) || !self.breaker.try_acquire(now) {
                break;
            }
            let Some(item) = self.retry.pop_due(now) else {
                break;
            };
            match self.attempt(&item.payload).await {
                Ok(()) => {
                    tracing::info!(operation = %item.operation, attempt = item.attempt, "queued delivery succeeded");
                    delivered.push(item.payload);
                }
                Err(err) => {
                    tracing::warn!(operation = %item.operation, error = %err, "queued delivery failed");
                    self.retry.requeue(item, self.clock.now(), &err);
                }
            }
        }
        delivered
    }

    async fn attempt(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let result = tokio::time::timeout(self.send_timeout, self.channel.deliver(envelope))
            .await
            .unwrap_or(Err(ChannelError::Timeout));
        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(self.clock.now()),
        }
        result
    }

    /// When the bridge next has work: a debounce closing or a retry falling due.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        let retry = self.retry.next_due().map(|due| {
            self.breaker
                .reopens_at()
                .map_or(due, |reopens| due.max(reopens))
        });
        match (self.outbox.next_deadline(), retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub const fn circuit_state(&self) -> CircuitStateKind {
        self.breaker.state()
    }

    pub const fn circuit(&self) -> CircuitState {
        self.breaker.snapshot()
    }

    /// Messages waiting: debounced posts plus queued retries.
    pub fn queue_depth(&self) -> usize {
        self.outbox.len() + self.retry.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.breaker.is_degraded(self.clock.now())
    }
}
