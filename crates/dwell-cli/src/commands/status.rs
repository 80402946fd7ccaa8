//! Status command for showing the open session and sync backlog.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use dwell_core::{ActivitySession, StateStore};
use serde::Serialize;

use super::report::format_duration;

#[derive(Debug, Serialize)]
struct StatusJson<'a> {
    database: String,
    open_sessions: &'a [ActivitySession],
    unsynced: usize,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn run<W: Write, S: StateStore>(writer: &mut W, store: &S, database_path: &Path, json: bool) -> Result<()> {
    let open = store.list_open()?;
    let unsynced = store.unsynced_completed(usize::MAX)?.len();

    if json {
        let status = StatusJson {
            database: database_path.display().to_string(),
            open_sessions: &open,
            unsynced,
        };
        writeln!(writer, "{}", serde_json::to_string_pretty(&status)?)?;
        return Ok(());
    }

    writeln!(writer, "dwell status")?;
    writeln!(writer, "Database: {}", database_path.display())?;

    if open.is_empty() {
        writeln!(writer, "No open session.")?;
    }
    for session in &open {
        writeln!(writer, "Open session: {} ({})", session.activity_key, session.status.as_str())?;
        writeln!(writer, "  Session: {}", session.id)?;
        writeln!(writer, "  Started: {}", timestamp(session.start_time))?;
        writeln!(writer, "  Last heartbeat: {}", timestamp(session.last_heartbeat_at))?;
        writeln!(writer, "  Active time: {}", format_duration(session.accumulated_ms))?;
    }
    if open.len() > 1 {
        writeln!(
            writer,
            "Warning: {} open sessions; recovery keeps the most recent.",
            open.len()
        )?;
    }
    writeln!(writer, "Unsynced sessions: {unsynced}")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{active, completed};
    use dwell_db::Database;

    use insta::assert_snapshot;

    #[test]
    fn status_command_outputs_open_session_and_backlog() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("dwell.db");
        let mut db = Database::open(&db_path).unwrap();
        db.upsert(&completed("s-1", "github.com", "2025-06-01T08:00:00Z", 20)).unwrap();
        db.upsert(&active("s-2", "docs.rs", "2025-06-01T09:00:00Z", 45)).unwrap();

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, false).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/dwell.db");
        assert_snapshot!(output, @r"
        dwell status
        Database: [TEMP]/dwell.db
        Open session: docs.rs (active)
          Session: s-2
          Started: 2025-06-01T09:00:00Z
          Last heartbeat: 2025-06-01T09:45:00Z
          Active time: 45m
        Unsynced sessions: 1
        ");
    }

    #[test]
    fn status_command_with_empty_database() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("dwell.db");
        let db = Database::open(&db_path).unwrap();

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, false).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/dwell.db");
        assert_snapshot!(output, @r"
        dwell status
        Database: [TEMP]/dwell.db
        No open session.
        Unsynced sessions: 0
        ");
    }

    #[test]
    fn status_json_lists_open_sessions() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("dwell.db");
        let mut db = Database::open(&db_path).unwrap();
        db.upsert(&active("s-2", "docs.rs", "2025-06-01T09:00:00Z", 45)).unwrap();

        let mut output = Vec::new();
        run(&mut output, &db, &db_path, true).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["unsynced"], 0);
        assert_eq!(value["open_sessions"][0]["id"], "s-2");
        assert_eq!(value["open_sessions"][0]["accumulatedMs"], 2_700_000);
    }
}
