//! The tracking engine.
//!
//! One [`Engine`] value owns the current-session slot, the store and the host
//! settings. Every raw signal goes through its coordinator and every session
//! change is persisted before it is announced.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::coordinator::{Dispatch, EventCoordinator};
use crate::machine::{Effect, HostSettings, StateMachine};
use crate::protocol::{CircuitStateKind, Envelope, Message, MessageType, StatusReport};
use crate::recovery::{RecoveryReport, recover, resolve_strays};
use crate::session::ActivitySession;
use crate::signal::{RawSignal, Transition};
use crate::store::{StateStore, StoreError};
use crate::types::SessionId;

/// Inconsistencies resolved since boot at which the engine reports degraded.
const DEGRADED_INCONSISTENCIES: usize = 2;

/// What the engine did with an inbound host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A settings push; `changed` is false for an identical repeat.
    Settings { changed: bool },
    /// The host asked for a status report.
    StatusQuery,
    /// The host acknowledged a finalized session.
    Acknowledged(SessionId),
    /// A message type the engine does not accept inbound.
    Ignored(MessageType),
}

pub struct Engine<S: StateStore> {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: S,
    coordinator: EventCoordinator,
    machine: StateMachine,
    settings: Arc<HostSettings>,
    outbound: Vec<Envelope>,
    pending_writes: BTreeMap<SessionId, ActivitySession>,
    inconsistencies: usize,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl<S: StateStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("current", &self.machine.current().map(|s| &s.id))
            .field("settings", &self.settings)
            .field("outbound", &self.outbound.len())
            .field("pending_writes", &self.pending_writes.len())
            .finish_non_exhaustive()
    }
}

impl<S: StateStore> Engine<S> {
    /// Creates an engine with an empty slot, without consulting the store.
    pub fn new(config: EngineConfig, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator: EventCoordinator::new(config.signal_debounce()),
            machine: StateMachine::new(&config),
            config,
            clock,
            store,
            settings: Arc::new(HostSettings::default()),
            outbound: Vec::new(),
            pending_writes: BTreeMap::new(),
            inconsistencies: 0,
            last_snapshot_at: None,
        }
    }

    /// Creates an engine and runs recovery against the store.
    ///
    /// Recovered completions and unsynced records are queued for the host.
    pub fn boot(config: EngineConfig, store: S, clock: Arc<dyn Clock>) -> Result<(Self, RecoveryReport), StoreError> {
        let mut engine = Self::new(config, store, clock);
        let recovery = recover(
            &mut engine.store,
            engine.clock.now(),
            engine.config.stale_session_ttl(),
            engine.config.retry_queue_capacity,
        )?;
        if let Some(open) = recovery.attached {
            engine.machine.attach(open);
        }
        engine.inconsistencies += recovery.report.inconsistencies_resolved.len();
        for session in recovery.outbound {
            engine.queue(Message::SessionFinalized(session));
        }
        Ok((engine, recovery.report))
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> Arc<HostSettings> {
        Arc::clone(&self.settings)
    }

    pub fn current(&self) -> Option<&ActivitySession> {
        self.machine.current()
    }

    /// Number of records waiting for the store to accept them.
    pub fn pending_writes(&self) -> usize {
        self.pending_writes.len()
    }

    /// Hands a raw signal to the coordinator.
    pub fn submit(&mut self, signal: &RawSignal) {
        self.coordinator.submit(signal, self.clock.now());
    }

    /// Applies every transition whose debounce window has closed.
    pub fn poll(&mut self) -> Vec<Dispatch> {
        let due = self.coordinator.drain_due(self.clock.now());
        for dispatch in &due {
            self.apply(&dispatch.transition, dispatch.at);
        }
        due
    }

    /// When the next debounced transition becomes due.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.coordinator.next_deadline()
    }

    /// Periodic tick: accrues time and emits a snapshot when one is due.
    pub fn heartbeat(&mut self) {
        let now = self.clock.now();
        self.apply(&Transition::Heartbeat, now);

        let Some(current) = self.machine.current() else {
            return;
        };
        let due = self
            .last_snapshot_at
            .is_none_or(|last| now - last >= self.config.snapshot_interval());
        if due {
            let snapshot = current.clone();
            self.last_snapshot_at = Some(now);
            self.queue(Message::SessionHeartbeatSnapshot(snapshot));
        }
    }

    /// Force-completes stored open sessions that are not the current one.
    pub fn self_check(&mut self) -> usize {
        self.flush_pending();
        let current = self.machine.current().map(|s| s.id.clone());
        match resolve_strays(&mut self.store, current.as_ref()) {
            Ok(resolved) => {
                self.inconsistencies += resolved.len();
                let count = resolved.len();
                for done in resolved {
                    self.queue(Message::SessionFinalized(done.into_record()));
                }
                count
            }
            Err(err) => {
                tracing::warn!(error = %err, "self-check could not read open sessions");
                0
            }
        }
    }

    /// Applies a host message.
    pub fn handle_inbound(&mut self, envelope: &Envelope) -> Inbound {
        let now = self.clock.now();
        match &envelope.message {
            Message::Enable => {
                let next = HostSettings {
                    enabled: true,
                    ..(*self.settings).clone()
                };
                self.replace_settings(next, &envelope.message, now)
            }
            Message::Disable => {
                let next = HostSettings {
                    enabled: false,
                    ..(*self.settings).clone()
                };
                self.replace_settings(next, &envelope.message, now)
            }
            Message::SetBlocklist { keys } => {
                let next = HostSettings {
                    blocklist: keys.iter().cloned().collect(),
                    ..(*self.settings).clone()
                };
                let ack = Message::SetBlocklist {
                    keys: next.blocklist.iter().cloned().collect(),
                };
                self.replace_settings(next, &ack, now)
            }
            Message::SessionFinalized(session) => {
                self.mark_synced(&session.id);
                Inbound::Acknowledged(session.id.clone())
            }
            Message::StatusQuery => Inbound::StatusQuery,
            Message::SessionHeartbeatSnapshot(_) | Message::StatusReport(_) => {
                tracing::debug!(kind = %envelope.kind(), "ignoring inbound message");
                Inbound::Ignored(envelope.kind())
            }
        }
    }

    /// Records host acknowledgement of a finalized session.
    pub fn mark_synced(&mut self, id: &SessionId) {
        let now = self.clock.now();
        if let Some(pending) = self.pending_writes.get_mut(id) {
            pending.synced_at = Some(now);
        }
        match self.store.mark_synced(id, now) {
            Ok(true) => tracing::debug!(session_id = %id, "session synced"),
            Ok(false) => tracing::debug!(session_id = %id, "acknowledged session not in store"),
            Err(err) => tracing::warn!(session_id = %id, error = %err, "failed to record sync"),
        }
    }

    /// Removes and returns the messages queued for the host.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbound)
    }

    /// Builds a status report from engine state plus the bridge's view.
    pub fn status_report(&self, circuit_state: CircuitStateKind, queue_depth: usize, bridge_degraded: bool) -> StatusReport {
        let now = self.clock.now();
        let current = self.machine.current();
        StatusReport {
            circuit_state,
            queue_depth,
            last_heartbeat_age_seconds: current.map(|s| (now - s.last_heartbeat_at).num_seconds().max(0)),
            current_session: current.cloned(),
            degraded: bridge_degraded || self.inconsistencies >= DEGRADED_INCONSISTENCIES,
        }
    }

    /// Applies pending transitions and persists the current session.
    ///
    /// The open session stays open so the next run can re-attach it.
    pub fn shutdown(&mut self) {
        let pending = self.coordinator.flush();
        for dispatch in &pending {
            self.apply(&dispatch.transition, dispatch.at);
        }
        if let Some(current) = self.machine.current().cloned() {
            self.persist(&current);
        }
        self.flush_pending();
        if !self.pending_writes.is_empty() {
            tracing::error!(count = self.pending_writes.len(), "shutting down with unpersisted sessions");
        }
    }

    fn replace_settings(&mut self, next: HostSettings, ack: &Message, now: DateTime<Utc>) -> Inbound {
        if *self.settings == next {
            tracing::debug!(kind = %ack.kind(), "settings unchanged");
            return Inbound::Settings { changed: false };
        }
        tracing::info!(enabled = next.enabled, blocked = next.blocklist.len(), "host settings replaced");
        self.settings = Arc::new(next);
        self.queue(ack.clone());

        let excluded = self
            .machine
            .current()
            .is_some_and(|s| !self.settings.enabled || self.settings.is_blocked(&s.activity_key));
        if excluded {
            self.apply(&Transition::Close, now);
        }
        Inbound::Settings { changed: true }
    }

    fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) {
        let settings = Arc::clone(&self.settings);
        let timezone = self.clock.timezone();
        for effect in self.machine.apply(transition, at, &settings, &timezone) {
            match effect {
                Effect::Opened(session) | Effect::Updated(session) => self.persist(&session),
                Effect::Finalized(done) => {
                    self.persist(done.record());
                    self.queue(Message::SessionFinalized(done.into_record()));
                }
                Effect::Refused { .. } | Effect::Anomaly(_) => {}
            }
        }
    }

    fn queue(&mut self, message: Message) {
        self.outbound.push(Envelope::new(message));
    }

    fn persist(&mut self, session: &ActivitySession) {
        self.pending_writes.remove(&session.id);
        self.flush_pending();
        if !self.write(session) {
            self.pending_writes.insert(session.id.clone(), session.clone());
        }
    }

    fn flush_pending(&mut self) {
        if self.pending_writes.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_writes);
        for (id, session) in pending {
            match self.store.upsert(&session) {
                Ok(_) => tracing::info!(session_id = %id, "flushed pending session write"),
                Err(err) if err.is_transient() => {
                    self.pending_writes.insert(id, session);
                }
                Err(err) => tracing::warn!(session_id = %id, error = %err, "dropping rejected pending write"),
            }
        }
    }

    /// Writes with retry. Returns false when the write should be retried later.
    fn write(&mut self, session: &ActivitySession) -> bool {
        let attempts = self.config.store_write_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.upsert(session) {
                Ok(_) => return true,
                Err(err) if err.is_transient() => {
                    tracing::warn!(session_id = %session.id, attempt, error = %err, "session write failed");
                }
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "anomaly: store rejected session write");
                    return true;
                }
            }
        }
        tracing::error!(session_id = %session.id, attempts, "session write retries exhausted, keeping in memory");
        false
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
