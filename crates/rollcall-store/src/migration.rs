//! Schema versioning for the rollcall database.

use crate::SqliteError;
use rusqlite::{params, Connection, OptionalExtension};

const CURRENT_SCHEMA_VERSION: i32 = 2;

fn init_metadata_table(conn: &Connection) -> Result<(), SqliteError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i32, SqliteError> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    match version {
        Some(v) => v
            .parse::<i32>()
            .map_err(|_| SqliteError::Invalid(format!("schema version {v:?}"))),
        None => Ok(0),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SqliteError> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        params![version.to_string()],
    )?;
    Ok(())
}

/// Bring the database up to the current schema.
pub fn migrate_to_current(conn: &Connection) -> Result<(), SqliteError> {
    init_metadata_table(conn)?;
    let mut version = schema_version(conn)?;

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    if version > CURRENT_SCHEMA_VERSION {
        return Err(SqliteError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if version < 1 {
        migrate_v0_to_v1(conn)?;
        version = 1;
        set_schema_version(conn, version)?;
    }

    if version < 2 {
        migrate_v1_to_v2(conn)?;
        version = 2;
        set_schema_version(conn, version)?;
    }

    tracing::info!(version, "database schema migrated");
    Ok(())
}

/// v1: attendance and enrolled identities.
fn migrate_v0_to_v1(conn: &Connection) -> Result<(), SqliteError> {
    conn.execute_batch(
        "BEGIN IMMEDIATE;
        CREATE TABLE IF NOT EXISTS attendance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            roll_no TEXT NOT NULL,
            name TEXT NOT NULL,
            date TEXT NOT NULL,
            time TEXT NOT NULL,
            has_period INTEGER NOT NULL,
            lecture TEXT NOT NULL DEFAULT '',
            slot INTEGER NOT NULL DEFAULT -1,
            UNIQUE(roll_no, date, has_period, lecture, slot)
        );
        CREATE INDEX IF NOT EXISTS attendance_roll_date_idx ON attendance(roll_no, date);
        CREATE TABLE IF NOT EXISTS identities (
            roll_no TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            descriptor TEXT NOT NULL,
            samples TEXT NOT NULL,
            enrolled_at TEXT NOT NULL
        );
        COMMIT;",
    )?;
    Ok(())
}

/// v2: recognition audit log.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), SqliteError> {
    conn.execute_batch(
        "BEGIN IMMEDIATE;
        CREATE TABLE IF NOT EXISTS recognition_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            attempt_id TEXT NOT NULL,
            roll_no TEXT,
            name TEXT,
            has_period INTEGER NOT NULL,
            lecture TEXT NOT NULL DEFAULT '',
            slot INTEGER NOT NULL DEFAULT -1,
            at TEXT NOT NULL,
            score REAL NOT NULL,
            outcome TEXT NOT NULL
        );
        COMMIT;",
    )?;
    Ok(())
}
