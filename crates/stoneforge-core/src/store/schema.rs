//! Schema creation and versioned migrations for the element store.
//!
//! Migrations are applied in order inside a single transaction; a failure
//! rolls the database back to its prior version and surfaces as
//! [`StoneforgeError::MigrationFailed`].

use rusqlite::Connection;

use crate::error::{Result, StoneforgeError};

/// Schema version this build writes and expects.
pub const SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE elements (
         id         TEXT PRIMARY KEY,
         type       TEXT NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL,
         created_by TEXT NOT NULL,
         tags       TEXT NOT NULL,
         metadata   TEXT NOT NULL,
         deleted_at TEXT
     );
     CREATE INDEX idx_elements_type ON elements (type);
     CREATE INDEX idx_elements_updated_at ON elements (updated_at);

     CREATE TABLE dependencies (
         blocked_id TEXT NOT NULL,
         blocker_id TEXT NOT NULL,
         dep_type   TEXT NOT NULL,
         created_at TEXT NOT NULL,
         PRIMARY KEY (blocked_id, blocker_id, dep_type)
     );
     CREATE INDEX idx_dependencies_blocker ON dependencies (blocker_id);

     CREATE TABLE dirty_elements (
         id        TEXT PRIMARY KEY,
         marked_at TEXT NOT NULL
     );

     CREATE TABLE child_counters (
         parent_id  TEXT PRIMARY KEY,
         next_child INTEGER NOT NULL
     );

     CREATE TABLE counters (
         name  TEXT PRIMARY KEY,
         value INTEGER NOT NULL
     );

     CREATE TABLE settings (
         key        TEXT PRIMARY KEY,
         value      TEXT NOT NULL,
         updated_at TEXT NOT NULL
     );",
)];

/// Open-time setup: pragmas, version table, pending migrations.
///
/// # Errors
/// Returns [`StoneforgeError::MigrationFailed`] if a migration step fails,
/// and [`StoneforgeError::IntegrityFailure`] if the on-disk version is newer
/// than this build understands.
pub fn initialize(conn: &Connection) -> Result<()> {
    // journal_mode is a row-returning pragma; query it instead of batching.
    let _mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;

    let current: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let current = current.unwrap_or(0);
    if current > SCHEMA_VERSION {
        return Err(StoneforgeError::IntegrityFailure {
            detail: format!(
                "database schema version {current} is newer than supported version \
                 {SCHEMA_VERSION}; upgrade stoneforge"
            ),
        });
    }

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        apply_migration(conn, *version, sql)?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i64, sql: &str) -> Result<()> {
    tracing::debug!(version, "applying schema migration");
    let failed = |e: rusqlite::Error| StoneforgeError::MigrationFailed {
        detail: format!("migration to version {version}: {e}"),
    };

    conn.execute_batch("BEGIN IMMEDIATE").map_err(failed)?;
    let result = conn
        .execute_batch(sql)
        .and_then(|()| {
            conn.execute("DELETE FROM schema_version", [])?;
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            Ok(())
        });
    match result {
        Ok(()) => conn.execute_batch("COMMIT").map_err(failed),
        Err(e) => {
            // Best effort; the original error is the one worth reporting.
            let _ = conn.execute_batch("ROLLBACK");
            Err(failed(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        initialize(&conn).expect("first init");
        initialize(&conn).expect("second init");

        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .expect("version row");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_on_disk_version_is_rejected() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        initialize(&conn).expect("init");
        conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION + 1])
            .expect("bump version");
        assert!(matches!(
            initialize(&conn),
            Err(StoneforgeError::IntegrityFailure { .. })
        ));
    }
}
