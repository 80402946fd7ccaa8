//! Storage layer for dwell.
//!
//! Persists activity sessions with `rusqlite` and implements
//! [`dwell_core::StateStore`] on top of them.
//!
//! # Thread Safety
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! The engine owns it through `&mut`, which is also what keeps writes
//! single-writer.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in RFC 3339 UTC with millisecond precision
//! (e.g. `2025-06-01T10:30:00.000Z`), so lexicographic order is chronological.
//! The `day` column holds the session's day bucket (`YYYY-MM-DD` in its
//! captured timezone) and is written once, on insert. `paused_intervals` is a
//! JSON array of `{start, end}` objects.

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use dwell_core::store::{plan_upsert, retention_cutoff, sort_open};
use dwell_core::{
    ActivityKey, ActivitySession, PausedInterval, QuarantinedRecord, ScanResult, SessionId,
    SessionStatus, StateStore, StoreError, TimezoneContext, UpsertOutcome, day_key,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for session {session_id}: {timestamp}")]
    TimestampParse {
        session_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored column holds a value that does not decode.
    #[error("invalid session data for {session_id}: {message}")]
    InvalidRecord { session_id: String, message: String },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

const COLUMNS: &str = "id, day, activity_key, status, start_time, end_time, accumulated_ms, \
     last_heartbeat_at, timezone, utc_offset_minutes, paused_intervals, synced_at";

/// A session row exactly as stored, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionRow {
    id: String,
    day: String,
    activity_key: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    accumulated_ms: i64,
    last_heartbeat_at: String,
    timezone: String,
    utc_offset_minutes: i32,
    paused_intervals: String,
    synced_at: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            day: row.get(1)?,
            activity_key: row.get(2)?,
            status: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            accumulated_ms: row.get(6)?,
            last_heartbeat_at: row.get(7)?,
            timezone: row.get(8)?,
            utc_offset_minutes: row.get(9)?,
            paused_intervals: row.get(10)?,
            synced_at: row.get(11)?,
        })
    }

    fn into_session(self) -> Result<ActivitySession, DbError> {
        let invalid = |message: String| DbError::InvalidRecord {
            session_id: self.id.clone(),
            message,
        };
        let id = SessionId::new(self.id.clone()).map_err(|e| invalid(e.to_string()))?;
        let activity_key =
            ActivityKey::new(self.activity_key.clone()).map_err(|e| invalid(e.to_string()))?;
        let status: SessionStatus = self.status.parse().map_err(invalid)?;
        let paused_intervals: Vec<PausedInterval> = serde_json::from_str(&self.paused_intervals)
            .map_err(|e| invalid(format!("paused_intervals: {e}")))?;
        let start_time = parse_timestamp(&self.start_time, &self.id)?;
        let end_time = self
            .end_time
            .as_deref()
            .map(|ts| parse_timestamp(ts, &self.id))
            .transpose()?;
        let last_heartbeat_at = parse_timestamp(&self.last_heartbeat_at, &self.id)?;
        let synced_at = self
            .synced_at
            .as_deref()
            .map(|ts| parse_timestamp(ts, &self.id))
            .transpose()?;
        Ok(ActivitySession {
            id,
            activity_key,
            status,
            start_time,
            end_time,
            accumulated_ms: self.accumulated_ms,
            last_heartbeat_at,
            timezone_context: TimezoneContext::fixed(self.timezone, self.utc_offset_minutes),
            paused_intervals,
            synced_at,
        })
    }

    /// Decodes and validates, or explains why the row is quarantined.
    fn validate(self) -> Result<ActivitySession, QuarantinedRecord> {
        let id = self.id.clone();
        let day = self.day.clone();
        let quarantine = |reason: String| QuarantinedRecord {
            id: id.clone(),
            day: day.clone(),
            reason,
        };
        let session = self.into_session().map_err(|e| quarantine(e.to_string()))?;
        session.check().map_err(|e| quarantine(e.to_string()))?;
        Ok(session)
    }
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing and ephemeral runs. The database is destroyed when
    /// the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        self.conn.execute_batch(
            "
            -- One row per activity session.
            -- day: bucket key, written on insert and never updated
            -- accumulated_ms: active time, frozen once status = 'completed'
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                activity_key TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                accumulated_ms INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT NOT NULL,
                timezone TEXT NOT NULL,
                utc_offset_minutes INTEGER NOT NULL DEFAULT 0,
                paused_intervals TEXT NOT NULL DEFAULT '[]',
                synced_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_day ON sessions(day);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            ",
        )?;
        Ok(())
    }

    /// Fetches one session by ID. Undecodable rows are reported as errors.
    pub fn get(&self, id: &SessionId) -> Result<Option<ActivitySession>, DbError> {
        self.get_row(id.as_str())?
            .map(SessionRow::into_session)
            .transpose()
    }

    /// Number of stored sessions, including corrupt ones.
    pub fn count(&self) -> Result<usize, DbError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn get_row(&self, id: &str) -> Result<Option<SessionRow>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?"),
                [id],
                SessionRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn query_rows(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<SessionRow>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, SessionRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Decodes rows, logging and skipping the ones that fail validation.
    fn valid_sessions(rows: Vec<SessionRow>) -> Vec<ActivitySession> {
        rows.into_iter()
            .filter_map(|row| match row.validate() {
                Ok(session) => Some(session),
                Err(record) => {
                    tracing::warn!(session_id = %record.id, reason = %record.reason, "skipping corrupt session");
                    None
                }
            })
            .collect()
    }

    fn write(&mut self, session: &ActivitySession) -> Result<UpsertOutcome, StoreError> {
        let tx = self.conn.transaction().map_err(DbError::from)?;
        let existing = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?"),
                [session.id.as_str()],
                SessionRow::from_row,
            )
            .optional()
            .map_err(DbError::from)?;
        // An undecodable row may be a completed record, so it is left for
        // inspection rather than overwritten.
        let existing = existing
            .map(SessionRow::into_session)
            .transpose()
            .map_err(|err| {
                tracing::warn!(session_id = %session.id, error = %err, "refusing write over undecodable session row");
                StoreError::Unreadable {
                    id: session.id.clone(),
                    reason: err.to_string(),
                }
            })?;

        let plan = plan_upsert(existing.as_ref(), session)?;
        if let Some(record) = plan.write {
            let paused = serde_json::to_string(&record.paused_intervals).map_err(|e| {
                StoreError::from(DbError::InvalidRecord {
                    session_id: record.id.to_string(),
                    message: e.to_string(),
                })
            })?;
            tx.execute(
                "
                INSERT INTO sessions (
                    id, day, activity_key, status, start_time, end_time, accumulated_ms,
                    last_heartbeat_at, timezone, utc_offset_minutes, paused_intervals, synced_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(id) DO UPDATE SET
                    activity_key = excluded.activity_key,
                    status = excluded.status,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    accumulated_ms = excluded.accumulated_ms,
                    last_heartbeat_at = excluded.last_heartbeat_at,
                    timezone = excluded.timezone,
                    utc_offset_minutes = excluded.utc_offset_minutes,
                    paused_intervals = excluded.paused_intervals,
                    synced_at = excluded.synced_at
                ",
                params![
                    record.id.as_str(),
                    record.day_key(),
                    record.activity_key.as_str(),
                    record.status.as_str(),
                    format_timestamp(record.start_time),
                    record.end_time.map(format_timestamp),
                    record.accumulated_ms,
                    format_timestamp(record.last_heartbeat_at),
                    record.timezone_context.timezone,
                    record.timezone_context.utc_offset_minutes,
                    paused,
                    record.synced_at.map(format_timestamp),
                ],
            )
            .map_err(DbError::from)?;
        }
        tx.commit().map_err(DbError::from)?;
        Ok(plan.outcome)
    }
}

impl StateStore for Database {
    fn upsert(&mut self, session: &ActivitySession) -> Result<UpsertOutcome, StoreError> {
        self.write(session)
    }

    fn get_active(&self) -> Result<Option<ActivitySession>, StoreError> {
        Ok(self.list_open()?.into_iter().next())
    }

    fn list_open(&self) -> Result<Vec<ActivitySession>, StoreError> {
        let rows = self.query_rows(
            &format!("SELECT {COLUMNS} FROM sessions WHERE status IN ('active', 'paused')"),
            [],
        )?;
        let mut open = Self::valid_sessions(rows);
        sort_open(&mut open);
        Ok(open)
    }

    fn scan_range(&self, start: NaiveDate, end: NaiveDate) -> Result<ScanResult, StoreError> {
        let mut result = ScanResult::default();
        if start > end {
            return Ok(result);
        }
        let rows = self.query_rows(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE day >= ?1 AND day <= ?2 ORDER BY start_time ASC, id ASC"
            ),
            [day_key(start), day_key(end)],
        )?;
        for row in rows {
            match row.validate() {
                Ok(session) => result.sessions.push(session),
                Err(record) => {
                    tracing::warn!(session_id = %record.id, reason = %record.reason, "quarantining corrupt session");
                    result.quarantined.push(record);
                }
            }
        }
        Ok(result)
    }

    fn cleanup_stale(&mut self, retention_days: u32, today: NaiveDate) -> Result<usize, StoreError> {
        let cutoff = day_key(retention_cutoff(retention_days, today));
        let removed = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE status = 'completed' AND day < ?",
                [cutoff],
            )
            .map_err(DbError::from)?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "removed sessions past retention");
        }
        Ok(removed)
    }

    fn mark_synced(&mut self, id: &SessionId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET synced_at = ?1 WHERE id = ?2 AND status = 'completed'",
                params![format_timestamp(at), id.as_str()],
            )
            .map_err(DbError::from)?;
        Ok(changed > 0)
    }

    fn unsynced_completed(&self, limit: usize) -> Result<Vec<ActivitySession>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.query_rows(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE status = 'completed' AND synced_at IS NULL \
                 ORDER BY start_time ASC, id ASC LIMIT ?"
            ),
            [limit],
        )?;
        Ok(Self::valid_sessions(rows))
    }
}

fn parse_timestamp(timestamp: &str, session_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            session_id: session_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
