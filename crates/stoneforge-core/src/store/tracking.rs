//! Dirty-element tracking and monotonic counters.
//!
//! The dirty set records every element mutated since the last export; the
//! sync layer drains it. Marking is idempotent and survives across
//! transactions. Counters back hierarchical child numbering and the
//! monotonic element index used by the id generator.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::ElementId;

/// Record an element as mutated since the last export. Idempotent: marking
/// twice keeps the first `marked_at`.
pub(super) fn mark_dirty(
    conn: &Connection,
    id: &ElementId,
    marked_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO dirty_elements (id, marked_at) VALUES (?1, ?2)
         ON CONFLICT(id) DO NOTHING",
        rusqlite::params![id.as_str(), marked_at.to_rfc3339()],
    )?;
    Ok(())
}

/// All currently dirty element ids, oldest mark first.
pub(super) fn dirty_elements(conn: &Connection) -> Result<Vec<ElementId>> {
    let mut stmt =
        conn.prepare("SELECT id FROM dirty_elements ORDER BY marked_at ASC, id ASC")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    ids.iter().map(|id| ElementId::new(id)).collect()
}

/// Drop the given ids from the dirty set (typically after a successful
/// export).
pub(super) fn clear_dirty(conn: &Connection, ids: &[ElementId]) -> Result<()> {
    for id in ids {
        conn.execute("DELETE FROM dirty_elements WHERE id = ?1", [id.as_str()])?;
    }
    Ok(())
}

/// Atomic increment-then-read of the per-parent child counter.
///
/// Monotone per parent: every call returns a strictly larger number than the
/// previous call for the same parent.
pub(super) fn next_child_number(conn: &Connection, parent: &ElementId) -> Result<u64> {
    let n: i64 = conn.query_row(
        "INSERT INTO child_counters (parent_id, next_child) VALUES (?1, 1)
         ON CONFLICT(parent_id) DO UPDATE SET next_child = next_child + 1
         RETURNING next_child",
        [parent.as_str()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(n).unwrap_or(0))
}

/// Atomic increment-then-read of a named counter.
pub(super) fn next_counter(conn: &Connection, name: &str) -> Result<u64> {
    let n: i64 = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        [name],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(n).unwrap_or(0))
}
