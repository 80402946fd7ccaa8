//! Durable session storage.
//!
//! Sessions live in day buckets keyed by their local start date. Writes are
//! idempotent by session ID and completed sessions are frozen apart from sync
//! bookkeeping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::clock::day_key;
use crate::session::{ActivitySession, Corruption};
use crate::types::{ActivityKey, SessionId};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write would change the core fields of a completed session.
    #[error("session {0} is completed and its core fields cannot change")]
    CompletedImmutable(SessionId),

    /// The record fails its invariant checks and was not written.
    #[error("session {id} is invalid: {reason}")]
    Invalid { id: SessionId, reason: Corruption },

    /// The stored copy does not decode, so it cannot be merged into.
    #[error("stored session {id} is unreadable: {reason}")]
    Unreadable { id: SessionId, reason: String },

    /// The backing storage failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same write could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A stored record excluded from reads because it failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedRecord {
    pub id: String,
    pub day: String,
    pub reason: String,
}

/// Result of a range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub sessions: Vec<ActivitySession>,
    pub quarantined: Vec<QuarantinedRecord>,
}

/// Active time for one activity key on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyTotal {
    pub day: String,
    pub activity_key: ActivityKey,
    pub accumulated_ms: i64,
    pub sessions: usize,
}

impl ScanResult {
    /// Per-day, per-key totals, ordered by day then key.
    ///
    /// Quarantined records never contribute.
    pub fn totals(&self) -> Vec<KeyTotal> {
        let mut totals: BTreeMap<(NaiveDate, ActivityKey), (i64, usize)> = BTreeMap::new();
        for session in &self.sessions {
            let entry = totals
                .entry((session.day(), session.activity_key.clone()))
                .or_default();
            entry.0 += session.accumulated_ms;
            entry.1 += 1;
        }
        totals
            .into_iter()
            .map(|((day, activity_key), (accumulated_ms, sessions))| KeyTotal {
                day: day_key(day),
                activity_key,
                accumulated_ms,
                sessions,
            })
            .collect()
    }
}

/// Durable keyed collection of sessions.
///
/// Writes take `&mut self`, so a store has a single writer.
pub trait StateStore {
    /// Inserts or updates a session by ID.
    fn upsert(&mut self, session: &ActivitySession) -> Result<UpsertOutcome, StoreError>;

    /// The open session with the most recent heartbeat, if any.
    fn get_active(&self) -> Result<Option<ActivitySession>, StoreError>;

    /// Every open (active or paused) session, most recent heartbeat first.
    fn list_open(&self) -> Result<Vec<ActivitySession>, StoreError>;

    /// Sessions in the inclusive day range, ordered by start time.
    fn scan_range(&self, start: NaiveDate, end: NaiveDate) -> Result<ScanResult, StoreError>;

    /// Deletes completed sessions whose bucket is older than the retention window.
    fn cleanup_stale(&mut self, retention_days: u32, today: NaiveDate) -> Result<usize, StoreError>;

    /// Records that the host acknowledged a completed session.
    ///
    /// Returns `false` when no completed session has this ID.
    fn mark_synced(&mut self, id: &SessionId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Completed sessions not yet acknowledged by the host, oldest first.
    fn unsynced_completed(&self, limit: usize) -> Result<Vec<ActivitySession>, StoreError>;
}

/// The record an upsert should write, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub outcome: UpsertOutcome,
    pub write: Option<ActivitySession>,
}

/// Decides how `incoming` merges with the stored `existing` record.
///
/// Shared by every backend so they agree on idempotency and freezing.
pub fn plan_upsert(
    existing: Option<&ActivitySession>,
    incoming: &ActivitySession,
) -> Result<UpsertPlan, StoreError> {
    incoming.check().map_err(|reason| StoreError::Invalid {
        id: incoming.id.clone(),
        reason,
    })?;

    let Some(existing) = existing else {
        return Ok(UpsertPlan {
            outcome: UpsertOutcome::Inserted,
            write: Some(incoming.clone()),
        });
    };
    if existing == incoming {
        return Ok(UpsertPlan {
            outcome: UpsertOutcome::Unchanged,
            write: None,
        });
    }
    if existing.is_open() {
        return Ok(UpsertPlan {
            outcome: UpsertOutcome::Updated,
            write: Some(incoming.clone()),
        });
    }

    if !existing.same_core(incoming) || incoming.is_open() {
        return Err(StoreError::CompletedImmutable(existing.id.clone()));
    }
    let synced_at = incoming.synced_at.or(existing.synced_at);
    if synced_at == existing.synced_at {
        return Ok(UpsertPlan {
            outcome: UpsertOutcome::Unchanged,
            write: None,
        });
    }
    let mut frozen = existing.clone();
    frozen.synced_at = synced_at;
    Ok(UpsertPlan {
        outcome: UpsertOutcome::Updated,
        write: Some(frozen),
    })
}

/// Oldest day bucket kept by a retention window.
pub fn retention_cutoff(retention_days: u32, today: NaiveDate) -> NaiveDate {
    today - Duration::days(i64::from(retention_days))
}

fn by_recent_heartbeat(a: &ActivitySession, b: &ActivitySession) -> std::cmp::Ordering {
    b.last_heartbeat_at
        .cmp(&a.last_heartbeat_at)
        .then_with(|| b.start_time.cmp(&a.start_time))
}

/// Orders open sessions most recent heartbeat first.
pub fn sort_open(sessions: &mut [ActivitySession]) {
    sessions.sort_by(by_recent_heartbeat);
}

/// In-memory store used by tests and ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    buckets: BTreeMap<NaiveDate, BTreeMap<SessionId, ActivitySession>>,
    index: HashMap<SessionId, NaiveDate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, id: &SessionId) -> Option<&ActivitySession> {
        let day = self.index.get(id)?;
        self.buckets.get(day)?.get(id)
    }

    fn sessions(&self) -> impl Iterator<Item = &ActivitySession> {
        self.buckets.values().flat_map(BTreeMap::values)
    }
}

impl StateStore for MemoryStore {
    fn upsert(&mut self, session: &ActivitySession) -> Result<UpsertOutcome, StoreError> {
        let plan = plan_upsert(self.get(&session.id), session)?;
        if let Some(record) = plan.write {
            let day = *self.index.entry(record.id.clone()).or_insert_with(|| record.day());
            self.buckets
                .entry(day)
                .or_default()
                .insert(record.id.clone(), record);
        }
        Ok(plan.outcome)
    }

    fn get_active(&self) -> Result<Option<ActivitySession>, StoreError> {
        Ok(self.list_open()?.into_iter().next())
    }

    fn list_open(&self) -> Result<Vec<ActivitySession>, StoreError> {
        let mut open: Vec<_> = self.sessions().filter(|s| s.is_open()).cloned().collect();
        sort_open(&mut open);
        Ok(open)
    }

    fn scan_range(&self, start: NaiveDate, end: NaiveDate) -> Result<ScanResult, StoreError> {
        let mut result = ScanResult::default();
        if start > end {
            return Ok(result);
        }
        for (day, bucket) in self.buckets.range(start..=end) {
            for session in bucket.values() {
                match session.check() {
                    Ok(()) => result.sessions.push(session.clone()),
                    Err(reason) => {
                        tracing::warn!(session_id = %session.id, %reason, "quarantining corrupt session");
                        result.quarantined.push(QuarantinedRecord {
                            id: session.id.to_string(),
                            day: day_key(*day),
                            reason: reason.to_string(),
                        });
                    }
                }
            }
        }
        result.sessions.sort_by_key(|s| s.start_time);
        Ok(result)
    }

    fn cleanup_stale(&mut self, retention_days: u32, today: NaiveDate) -> Result<usize, StoreError> {
        let cutoff = retention_cutoff(retention_days, today);
        let mut removed = Vec::new();
        for (_, bucket) in self.buckets.range_mut(..cutoff) {
            bucket.retain(|id, session| {
                let keep = session.is_open();
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        for id in &removed {
            self.index.remove(id);
        }
        Ok(removed.len())
    }

    fn mark_synced(&mut self, id: &SessionId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(day) = self.index.get(id) else {
            return Ok(false);
        };
        let Some(session) = self
            .buckets
            .get_mut(day)
            .and_then(|b| b.get_mut(id))
            .filter(|s| !s.is_open())
        else {
            return Ok(false);
        };
        session.synced_at = Some(at);
        Ok(true)
    }

    fn unsynced_completed(&self, limit: usize) -> Result<Vec<ActivitySession>, StoreError> {
        let mut pending: Vec<_> = self
            .sessions()
            .filter(|s| !s.is_open() && s.synced_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.start_time);
        pending.truncate(limit);
        Ok(pending)
    }
}
