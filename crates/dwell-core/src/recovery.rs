//! Crash recovery and open-session consistency checks.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::machine::{CompletedSession, OpenSession, finalize_abandoned};
use crate::session::ActivitySession;
use crate::store::{StateStore, StoreError};
use crate::types::SessionId;

/// What recovery did at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Session re-attached as the current one.
    pub reattached: Option<SessionId>,
    /// Open sessions older than the stale TTL that were finalized.
    pub stale_finalized: Vec<SessionId>,
    /// Duplicate open sessions force-completed.
    pub inconsistencies_resolved: Vec<SessionId>,
    /// Completed sessions still awaiting host acknowledgement.
    pub unsynced: usize,
}

/// Recovery output: the session to attach and the records to announce.
#[derive(Debug)]
pub struct Recovery {
    pub attached: Option<OpenSession>,
    /// Completed, unsynced sessions to queue as `SESSION_FINALIZED`.
    pub outbound: Vec<ActivitySession>,
    pub report: RecoveryReport,
}

/// Finalizes or re-attaches the sessions a previous run left open.
///
/// With several open sessions the most recently heartbeated one wins and the
/// rest are completed at their last heartbeat.
pub fn recover<S: StateStore>(
    store: &mut S,
    now: DateTime<Utc>,
    stale_ttl: Duration,
    outbound_limit: usize,
) -> Result<Recovery, StoreError> {
    let mut report = RecoveryReport::default();
    let mut open = store.list_open()?.into_iter();
    let newest = open.next();

    for stray in open {
        let done = complete(store, stray)?;
        tracing::warn!(session_id = %done.id(), "state inconsistency: multiple open sessions, force-completed older one");
        report.inconsistencies_resolved.push(done.id().clone());
    }

    let mut attached = None;
    if let Some(record) = newest {
        let age = now - record.last_heartbeat_at;
        if age > stale_ttl {
            let done = complete(store, record)?;
            tracing::info!(
                session_id = %done.id(),
                age_hours = age.num_hours(),
                "finalized stale session from previous run"
            );
            report.stale_finalized.push(done.id().clone());
        } else {
            tracing::info!(session_id = %record.id, status = %record.status, "re-attached session from previous run");
            report.reattached = Some(record.id.clone());
            attached = OpenSession::reattach(record).ok();
        }
    }

    let outbound = store.unsynced_completed(outbound_limit)?;
    report.unsynced = outbound.len();
    Ok(Recovery {
        attached,
        outbound,
        report,
    })
}

/// Force-completes every stored open session other than `current`.
pub fn resolve_strays<S: StateStore>(
    store: &mut S,
    current: Option<&SessionId>,
) -> Result<Vec<CompletedSession>, StoreError> {
    let mut resolved = Vec::new();
    for record in store.list_open()? {
        if Some(&record.id) == current {
            continue;
        }
        let done = complete(store, record)?;
        tracing::warn!(session_id = %done.id(), "state inconsistency: stray open session force-completed");
        resolved.push(done);
    }
    Ok(resolved)
}

fn complete<S: StateStore>(store: &mut S, record: ActivitySession) -> Result<CompletedSession, StoreError> {
    let id = record.id.clone();
    let done = finalize_abandoned(record).map_err(|_| StoreError::CompletedImmutable(id))?;
    store.upsert(done.record())?;
    Ok(done)
}
