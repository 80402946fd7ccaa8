//! Recover command: finalize or re-attach sessions left open by a crash.
//!
//! Runs the same recovery the engine runs at boot, without starting the
//! engine. A session young enough to re-attach is left open for the next run.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dwell_core::recovery::recover;
use dwell_core::{EngineConfig, RecoveryReport, SessionId, StateStore};

fn ids(ids: &[SessionId]) -> String {
    if ids.is_empty() {
        return "0".to_string();
    }
    let list: Vec<_> = ids.iter().map(SessionId::as_str).collect();
    format!("{} ({})", ids.len(), list.join(", "))
}

pub fn write_report<W: Write>(writer: &mut W, report: &RecoveryReport) -> Result<()> {
    writeln!(writer, "Recovery report")?;
    match &report.reattached {
        Some(id) => writeln!(writer, "Open session kept: {id}")?,
        None => writeln!(writer, "Open session kept: none")?,
    }
    writeln!(writer, "Stale sessions finalized: {}", ids(&report.stale_finalized))?;
    writeln!(
        writer,
        "Inconsistencies resolved: {}",
        ids(&report.inconsistencies_resolved)
    )?;
    writeln!(writer, "Awaiting host sync: {}", report.unsynced)?;
    Ok(())
}

pub fn run<W: Write, S: StateStore>(
    writer: &mut W,
    store: &mut S,
    config: &EngineConfig,
    now: DateTime<Utc>,
    json: bool,
) -> Result<()> {
    let recovery = recover(store, now, config.stale_session_ttl(), usize::MAX)?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&recovery.report)?)?;
    } else {
        write_report(writer, &recovery.report)?;
    }
    Ok(())
}
