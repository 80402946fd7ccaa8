//! Report command: active time per site and day.
//!
//! Totals come straight from stored sessions. Records that fail validation
//! are listed separately and never counted.

use std::io::Write;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use dwell_core::{KeyTotal, QuarantinedRecord, StateStore, day_key};
use serde::Serialize;

/// Computed report data.
#[derive(Debug)]
pub struct ReportData {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub totals: Vec<KeyTotal>,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl ReportData {
    fn total_ms(&self) -> i64 {
        self.totals.iter().map(|t| t.accumulated_ms).sum()
    }
}

/// Reads `days` days of sessions ending at `end` (inclusive).
pub fn generate_report_data<S: StateStore>(store: &S, end: NaiveDate, days: u32) -> Result<ReportData> {
    let start = end - Duration::days(i64::from(days.max(1)) - 1);
    let scan = store.scan_range(start, end)?;
    Ok(ReportData {
        start,
        end,
        totals: scan.totals(),
        quarantined: scan.quarantined,
    })
}

/// Formats milliseconds as duration string.
/// Returns "Xh Ym" if >= 1 hour, "Xm" if < 1 hour.
pub fn format_duration(ms: i64) -> String {
    if ms < 0 {
        return "0m".to_string();
    }
    let total_minutes = ms / 60_000;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

pub fn write_report<W: Write>(writer: &mut W, data: &ReportData) -> Result<()> {
    if data.start == data.end {
        writeln!(writer, "Activity report for {}", day_key(data.start))?;
    } else {
        writeln!(
            writer,
            "Activity report for {} to {}",
            day_key(data.start),
            day_key(data.end)
        )?;
    }

    if data.totals.is_empty() {
        writeln!(writer, "No activity recorded.")?;
    }

    let mut current_day: Option<&str> = None;
    for total in &data.totals {
        if current_day != Some(total.day.as_str()) {
            writeln!(writer)?;
            writeln!(writer, "{}", total.day)?;
            current_day = Some(total.day.as_str());
        }
        writeln!(
            writer,
            "  {}: {} ({})",
            total.activity_key,
            format_duration(total.accumulated_ms),
            plural(total.sessions, "session")
        )?;
    }

    if !data.totals.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "Total: {}", format_duration(data.total_ms()))?;
    }
    if !data.quarantined.is_empty() {
        writeln!(
            writer,
            "Skipped {}: {}",
            plural(data.quarantined.len(), "corrupt record"),
            data.quarantined
                .iter()
                .map(|q| q.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )?;
    }
    Ok(())
}

/// JSON report structure.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub start: String,
    pub end: String,
    pub total_ms: i64,
    pub totals: &'a [KeyTotal],
    pub quarantined: &'a [QuarantinedRecord],
}

pub fn format_report_json(data: &ReportData) -> Result<String> {
    let report = JsonReport {
        start: day_key(data.start),
        end: day_key(data.end),
        total_ms: data.total_ms(),
        totals: &data.totals,
        quarantined: &data.quarantined,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Runs the report command.
pub fn run<W: Write, S: StateStore>(writer: &mut W, store: &S, end: NaiveDate, days: u32, json: bool) -> Result<()> {
    let data = generate_report_data(store, end, days)?;
    if json {
        writeln!(writer, "{}", format_report_json(&data)?)?;
    } else {
        write_report(writer, &data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::completed;
    use dwell_core::MemoryStore;

    use insta::assert_snapshot;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.upsert(&completed("s-1", "docs.rs", "2025-06-01T09:00:00Z", 45)).unwrap();
        store.upsert(&completed("s-2", "docs.rs", "2025-06-01T11:00:00Z", 30)).unwrap();
        store.upsert(&completed("s-3", "github.com", "2025-06-01T13:00:00Z", 12)).unwrap();
        store.upsert(&completed("s-4", "github.com", "2025-06-02T08:00:00Z", 90)).unwrap();
        store
    }

    #[test]
    fn test_format_duration_hours_and_minutes() {
        assert_eq!(format_duration(5_400_000), "1h 30m");
    }

    #[test]
    fn test_format_duration_floors_seconds() {
        assert_eq!(format_duration(119_999), "1m");
        assert_eq!(format_duration(-1), "0m");
    }

    #[test]
    fn test_report_single_day() {
        let mut output = Vec::new();
        run(&mut output, &store(), day(1), 1, false).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Activity report for 2025-06-01

        2025-06-01
          docs.rs: 1h 15m (2 sessions)
          github.com: 12m (1 session)

        Total: 1h 27m
        ");
    }

    #[test]
    fn test_report_range_groups_by_day() {
        let mut output = Vec::new();
        run(&mut output, &store(), day(2), 2, false).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Activity report for 2025-06-01 to 2025-06-02

        2025-06-01
          docs.rs: 1h 15m (2 sessions)
          github.com: 12m (1 session)

        2025-06-02
          github.com: 1h 30m (1 session)

        Total: 2h 57m
        ");
    }

    #[test]
    fn test_report_empty_period() {
        let mut output = Vec::new();
        run(&mut output, &store(), day(20), 1, false).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Activity report for 2025-06-20
        No activity recorded.
        ");
    }

    #[test]
    fn test_report_json_output() {
        let mut output = Vec::new();
        run(&mut output, &store(), day(2), 1, true).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r#"
        {
          "start": "2025-06-02",
          "end": "2025-06-02",
          "total_ms": 5400000,
          "totals": [
            {
              "day": "2025-06-02",
              "activity_key": "github.com",
              "accumulated_ms": 5400000,
              "sessions": 1
            }
          ],
          "quarantined": []
        }
        "#);
    }
}
