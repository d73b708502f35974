//! SQLite persistence for attendance marks, enrolled identities and the
//! recognition log.
//!
//! One connection behind a mutex; every public operation is a single
//! statement, so SQLite's own constraints decide races between callers.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rollcall_core::gate::{AttendanceStore, StoreError};
use rollcall_core::log::{RecognitionEntry, RecognitionSink};
use rollcall_core::registry::{IdentityRecord, IdentityStore};
use rollcall_core::types::{AttendanceKey, AttendanceRecord, Attendee, Descriptor, MatchDecision, Period};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

pub mod migration;

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Json(e) => StoreError::Corrupt(e.to_string()),
            SqliteError::Invalid(msg) => StoreError::Corrupt(msg),
            other => StoreError::backend(other),
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::info!(path = %path.as_ref().display(), "opened attendance database");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SqliteError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SqliteError> {
        migration::migrate_to_current(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-applied; SQLite rolls it back.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<bool, SqliteError> {
        let (has_period, lecture, slot) = period_columns(record.period.as_ref());
        let result = self.conn().execute(
            "INSERT INTO attendance (roll_no, name, date, time, has_period, lecture, slot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![record.identity, record.name, record.date, record.time, has_period, lecture, slot],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn attendance_exists(&self, key: &AttendanceKey) -> Result<bool, SqliteError> {
        let (has_period, lecture, slot) = period_columns(key.period.as_ref());
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM attendance
             WHERE roll_no = ?1 AND date = ?2 AND has_period = ?3 AND lecture = ?4 AND slot = ?5)",
            params![key.identity, key.date, has_period, lecture, slot],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    fn attendance_between(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, SqliteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT roll_no, name, date, time, has_period, lecture, slot FROM attendance
             WHERE roll_no = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date, time, id",
        )?;
        let rows = stmt.query_map(params![identity, start, end], attendance_row)?;
        collect_attendance(rows)
    }

    fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, SqliteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT roll_no, name, date, time, has_period, lecture, slot FROM attendance
             ORDER BY date, time, roll_no, id",
        )?;
        let rows = stmt.query_map([], attendance_row)?;
        collect_attendance(rows)
    }

    fn distinct_attendees(&self) -> Result<Vec<Attendee>, SqliteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.roll_no, a.name FROM attendance a
             WHERE a.id = (
                 SELECT b.id FROM attendance b WHERE b.roll_no = a.roll_no
                 ORDER BY b.date DESC, b.time DESC, b.id DESC LIMIT 1
             )
             ORDER BY a.roll_no",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(Attendee {
                identity: r.get(0)?,
                name: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_attendance(&self, identity: Option<&str>) -> Result<usize, SqliteError> {
        let removed = match identity {
            Some(id) => self
                .conn()
                .execute("DELETE FROM attendance WHERE roll_no = ?1", params![id])?,
            None => self.conn().execute("DELETE FROM attendance", [])?,
        };
        tracing::info!(identity, removed, "attendance cleared");
        Ok(removed)
    }

    fn upsert_identity(&self, record: &IdentityRecord) -> Result<(), SqliteError> {
        let descriptor = serde_json::to_string(&record.descriptor)?;
        let samples = serde_json::to_string(&record.samples)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO identities (roll_no, name, descriptor, samples, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id, record.name, descriptor, samples, record.enrolled_at],
        )?;
        Ok(())
    }

    fn all_identities(&self) -> Result<Vec<IdentityRecord>, SqliteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT roll_no, name, descriptor, samples, enrolled_at FROM identities ORDER BY roll_no",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, descriptor, samples, enrolled_at) = row?;
            let descriptor: Descriptor = serde_json::from_str(&descriptor)?;
            let samples: Vec<Descriptor> = serde_json::from_str(&samples)?;
            records.push(IdentityRecord {
                id,
                name,
                descriptor,
                samples,
                enrolled_at,
            });
        }
        Ok(records)
    }

    fn remove_identity(&self, id: &str) -> Result<bool, SqliteError> {
        let removed = self
            .conn()
            .execute("DELETE FROM identities WHERE roll_no = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn append_log(&self, entry: &RecognitionEntry) -> Result<(), SqliteError> {
        let (has_period, lecture, slot) = period_columns(entry.period.as_ref());
        self.conn().execute(
            "INSERT INTO recognition_log
                (attempt_id, roll_no, name, has_period, lecture, slot, at, score, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.attempt_id.to_string(),
                entry.identity,
                entry.name,
                has_period,
                lecture,
                slot,
                entry.at,
                entry.score,
                outcome_name(entry.outcome),
            ],
        )?;
        Ok(())
    }

    fn log_entries(&self) -> Result<Vec<RecognitionEntry>, SqliteError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT attempt_id, roll_no, name, has_period, lecture, slot, at, score, outcome
             FROM recognition_log ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                read_period(r, 3)?,
                r.get::<_, DateTime<Utc>>(6)?,
                r.get::<_, f32>(7)?,
                r.get::<_, String>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (attempt_id, identity, name, period, at, score, outcome) = row?;
            entries.push(RecognitionEntry {
                attempt_id: Uuid::parse_str(&attempt_id)
                    .map_err(|e| SqliteError::Invalid(format!("attempt id {attempt_id:?}: {e}")))?,
                identity,
                name,
                period: period?,
                at,
                score,
                outcome: parse_outcome(&outcome)?,
            });
        }
        Ok(entries)
    }
}

impl AttendanceStore for SqliteStore {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        Ok(self.insert_attendance(record)?)
    }

    fn exists(&self, key: &AttendanceKey) -> Result<bool, StoreError> {
        Ok(self.attendance_exists(key)?)
    }

    fn query_by_identity_and_range(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.attendance_between(identity, start, end)?)
    }

    fn delete_by_identity(&self, identity: &str) -> Result<usize, StoreError> {
        Ok(self.delete_attendance(Some(identity))?)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        Ok(self.delete_attendance(None)?)
    }

    fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.all_attendance()?)
    }

    fn attendees(&self) -> Result<Vec<Attendee>, StoreError> {
        Ok(self.distinct_attendees()?)
    }
}

impl IdentityStore for SqliteStore {
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        Ok(self.upsert_identity(record)?)
    }

    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self.all_identities()?)
    }

    fn delete_identity(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.remove_identity(id)?)
    }
}

impl RecognitionSink for SqliteStore {
    fn append(&self, entry: &RecognitionEntry) -> Result<(), StoreError> {
        Ok(self.append_log(entry)?)
    }

    fn entries(&self) -> Result<Vec<RecognitionEntry>, StoreError> {
        Ok(self.log_entries()?)
    }
}

/// Period as key columns. NULL never takes part in uniqueness, so "no period"
/// is an explicit flag and absent parts use sentinels.
type AttendanceRow = (String, String, NaiveDate, NaiveTime, Result<Option<Period>, SqliteError>);

/// Columns: roll_no, name, date, time, has_period, lecture, slot.
fn attendance_row(r: &Row<'_>) -> rusqlite::Result<AttendanceRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, read_period(r, 4)?))
}

fn collect_attendance(
    rows: impl Iterator<Item = rusqlite::Result<AttendanceRow>>,
) -> Result<Vec<AttendanceRecord>, SqliteError> {
    let mut records = Vec::new();
    for row in rows {
        let (identity, name, date, time, period) = row?;
        records.push(AttendanceRecord {
            identity,
            name,
            date,
            time,
            period: period?,
        });
    }
    Ok(records)
}

fn period_columns(period: Option<&Period>) -> (bool, &str, i64) {
    match period {
        Some(p) => (true, p.lecture.as_str(), p.slot.map_or(-1, i64::from)),
        None => (false, "", -1),
    }
}

/// Read the three period columns starting at `first`.
fn read_period(row: &Row<'_>, first: usize) -> rusqlite::Result<Result<Option<Period>, SqliteError>> {
    let has_period: bool = row.get(first)?;
    let lecture: String = row.get(first + 1)?;
    let slot: i64 = row.get(first + 2)?;

    if !has_period {
        return Ok(Ok(None));
    }
    let slot = match slot {
        s if s < 0 => None,
        s => match u32::try_from(s) {
            Ok(s) => Some(s),
            Err(_) => return Ok(Err(SqliteError::Invalid(format!("slot {s}")))),
        },
    };
    Ok(Ok(Some(Period { lecture, slot })))
}

fn outcome_name(outcome: MatchDecision) -> &'static str {
    match outcome {
        MatchDecision::Accepted => "accepted",
        MatchDecision::Rejected => "rejected",
        MatchDecision::NoCandidates => "no-candidates",
    }
}

fn parse_outcome(s: &str) -> Result<MatchDecision, SqliteError> {
    match s {
        "accepted" => Ok(MatchDecision::Accepted),
        "rejected" => Ok(MatchDecision::Rejected),
        "no-candidates" => Ok(MatchDecision::NoCandidates),
        other => Err(SqliteError::Invalid(format!("outcome {other:?}"))),
    }
}
