//! Dependency edge persistence.
//!
//! Insertion does not validate cycles — callers that care run
//! [`crate::graph::detect_cycle`] first (the explicit-check contract).

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StoneforgeError};
use crate::model::{Dependency, DependencyType, ElementId};

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: (String, String, String, String)) -> Result<Dependency> {
    let (blocked, blocker, dep_type, created_at) = raw;
    Ok(Dependency {
        blocked_id: ElementId::new(&blocked)?,
        blocker_id: ElementId::new(&blocker)?,
        dep_type: dep_type.parse()?,
        created_at: created_at
            .parse()
            .map_err(|e| StoneforgeError::IntegrityFailure {
                detail: format!("unparseable dependency timestamp '{created_at}': {e}"),
            })?,
    })
}

fn type_clause(types: Option<&[DependencyType]>) -> String {
    types.map_or_else(String::new, |types| {
        let list = types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(" AND dep_type IN ({list})")
    })
}

/// Insert an edge. The edge key is unique; re-inserting fails with
/// `AlreadyExists`. Both endpoints must exist, and both are marked dirty so
/// the next export carries their changed blocking state.
pub(super) fn add(conn: &Connection, dep: &Dependency) -> Result<()> {
    for endpoint in [&dep.blocked_id, &dep.blocker_id] {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM elements WHERE id = ?1",
                [endpoint.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoneforgeError::NotFound {
                id: endpoint.to_string(),
            });
        }
    }

    let inserted = conn.execute(
        "INSERT INTO dependencies (blocked_id, blocker_id, dep_type, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(blocked_id, blocker_id, dep_type) DO NOTHING",
        params![
            dep.blocked_id.as_str(),
            dep.blocker_id.as_str(),
            dep.dep_type.as_str(),
            dep.created_at.to_rfc3339(),
        ],
    )?;
    if inserted == 0 {
        return Err(StoneforgeError::AlreadyExists {
            id: format!(
                "{} -[{}]-> {}",
                dep.blocked_id, dep.dep_type, dep.blocker_id
            ),
        });
    }

    super::tracking::mark_dirty(conn, &dep.blocked_id, dep.created_at)?;
    super::tracking::mark_dirty(conn, &dep.blocker_id, dep.created_at)?;
    Ok(())
}

/// Remove an edge by key; returns whether anything was removed.
pub(super) fn remove(
    conn: &Connection,
    blocked: &ElementId,
    blocker: &ElementId,
    dep_type: DependencyType,
) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM dependencies
         WHERE blocked_id = ?1 AND blocker_id = ?2 AND dep_type = ?3",
        params![blocked.as_str(), blocker.as_str(), dep_type.as_str()],
    )?;
    if removed > 0 {
        let now = chrono::Utc::now();
        super::tracking::mark_dirty(conn, blocked, now)?;
        super::tracking::mark_dirty(conn, blocker, now)?;
    }
    Ok(removed > 0)
}

/// Edges naming `id` as the blocked element, optionally restricted by type.
pub(super) fn dependencies_of(
    conn: &Connection,
    id: &ElementId,
    types: Option<&[DependencyType]>,
) -> Result<Vec<Dependency>> {
    let sql = format!(
        "SELECT blocked_id, blocker_id, dep_type, created_at FROM dependencies
         WHERE blocked_id = ?1{}",
        type_clause(types)
    );
    query_edges(conn, &sql, id)
}

/// Edges naming `id` as the blocker, optionally restricted by type.
pub(super) fn dependents_of(
    conn: &Connection,
    id: &ElementId,
    types: Option<&[DependencyType]>,
) -> Result<Vec<Dependency>> {
    let sql = format!(
        "SELECT blocked_id, blocker_id, dep_type, created_at FROM dependencies
         WHERE blocker_id = ?1{}",
        type_clause(types)
    );
    query_edges(conn, &sql, id)
}

fn query_edges(conn: &Connection, sql: &str, id: &ElementId) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<_> = stmt
        .query_map([id.as_str()], dependency_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter().map(decode).collect()
}

/// Every edge in the store, in key order (stable for export).
pub(super) fn all(conn: &Connection) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT blocked_id, blocker_id, dep_type, created_at FROM dependencies
         ORDER BY blocked_id, blocker_id, dep_type",
    )?;
    let rows: Vec<_> = stmt
        .query_map([], dependency_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter().map(decode).collect()
}
