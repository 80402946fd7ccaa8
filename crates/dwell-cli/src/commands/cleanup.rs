//! Cleanup command: apply the retention window.

use std::io::Write;

use anyhow::Result;
use chrono::NaiveDate;
use dwell_core::StateStore;
use dwell_core::day_key;
use dwell_core::store::retention_cutoff;

pub fn run<W: Write, S: StateStore>(writer: &mut W, store: &mut S, retention_days: u32, today: NaiveDate) -> Result<()> {
    let removed = store.cleanup_stale(retention_days, today)?;
    let cutoff = day_key(retention_cutoff(retention_days, today));
    match removed {
        0 => writeln!(writer, "Nothing to remove before {cutoff}.")?,
        1 => writeln!(writer, "Removed 1 completed session before {cutoff}.")?,
        n => writeln!(writer, "Removed {n} completed sessions before {cutoff}.")?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{active, completed};
    use dwell_db::Database;

    use insta::assert_snapshot;

    #[test]
    fn removes_only_completed_sessions_past_retention() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert(&completed("old-1", "docs.rs", "2025-02-01T09:00:00Z", 10)).unwrap();
        db.upsert(&completed("old-2", "docs.rs", "2025-02-27T09:00:00Z", 10)).unwrap();
        db.upsert(&completed("kept", "docs.rs", "2025-03-03T09:00:00Z", 10)).unwrap();
        db.upsert(&active("open", "docs.rs", "2025-01-01T09:00:00Z", 10)).unwrap();

        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let mut output = Vec::new();
        run(&mut output, &mut db, 90, today).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @"Removed 2 completed sessions before 2025-03-03.");
        assert_eq!(db.count().unwrap(), 2);

        let mut again = Vec::new();
        run(&mut again, &mut db, 90, today).unwrap();
        assert_snapshot!(String::from_utf8(again).unwrap(), @"Nothing to remove before 2025-03-03.");
    }
}
