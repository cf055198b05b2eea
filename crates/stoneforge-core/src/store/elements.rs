//! Element row mapping and CRUD, as free functions over a connection.
//!
//! Everything here runs inside the caller's transaction; the [`super::Store`]
//! wrapper owns locking and transaction boundaries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StoneforgeError};
use crate::model::{Element, ElementId, ElementType};

// ---------------------------------------------------------------------------
// ElementPatch
// ---------------------------------------------------------------------------

/// A partial update to an element.
///
/// `id`, `created_at`, and `created_by` are present so an attempted change
/// can be rejected with [`StoneforgeError::Immutable`] rather than silently
/// dropped; they are never applied.
#[derive(Clone, Debug, Default)]
pub struct ElementPatch {
    /// Attempting to set this fails with `Immutable`.
    pub id: Option<ElementId>,
    /// Attempting to set this fails with `Immutable`.
    pub created_at: Option<DateTime<Utc>>,
    /// Attempting to set this fails with `Immutable`.
    pub created_by: Option<String>,
    /// Replacement tag list.
    pub tags: Option<Vec<String>>,
    /// Replacement metadata mapping.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// `Some(Some(_))` stamps a tombstone, `Some(None)` clears one.
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl ElementPatch {
    /// A patch that only replaces the metadata mapping.
    #[must_use]
    pub fn metadata(metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Paginated list filter.
#[derive(Clone, Debug, Default)]
pub struct ElementFilter {
    /// Restrict to one discriminator.
    pub element_type: Option<ElementType>,
    /// Restrict to elements carrying this tag.
    pub tag: Option<String>,
    /// Include tombstones (excluded by default).
    pub include_deleted: bool,
    /// Page size; `None` means unbounded.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: usize,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    raw.parse().map_err(|e| StoneforgeError::IntegrityFailure {
        detail: format!("unparseable {column} timestamp '{raw}': {e}"),
    })
}

pub(super) fn element_from_row(row: &Row<'_>) -> rusqlite::Result<RawElementRow> {
    Ok(RawElementRow {
        id: row.get(0)?,
        element_type: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        created_by: row.get(4)?,
        tags: row.get(5)?,
        metadata: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

/// Raw text columns before domain validation.
pub(super) struct RawElementRow {
    id: String,
    element_type: String,
    created_at: String,
    updated_at: String,
    created_by: String,
    tags: String,
    metadata: String,
    deleted_at: Option<String>,
}

impl RawElementRow {
    pub(super) fn into_element(self) -> Result<Element> {
        let integrity = |detail: String| StoneforgeError::IntegrityFailure { detail };

        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| integrity(format!("corrupt tags on '{}': {e}", self.id)))?;
        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.metadata)
                .map_err(|e| integrity(format!("corrupt metadata on '{}': {e}", self.id)))?;
        let deleted_at = match self.deleted_at {
            None => None,
            Some(raw) => Some(parse_timestamp(&raw, "deletedAt")?),
        };

        Ok(Element {
            id: ElementId::new(&self.id)?,
            element_type: self.element_type.parse()?,
            created_at: parse_timestamp(&self.created_at, "createdAt")?,
            updated_at: parse_timestamp(&self.updated_at, "updatedAt")?,
            created_by: self.created_by,
            tags,
            metadata,
            deleted_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "id, type, created_at, updated_at, created_by, tags, metadata, deleted_at";

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// Insert a validated element; fails with `AlreadyExists` if the id is taken.
pub(super) fn create(conn: &Connection, el: &Element) -> Result<()> {
    el.validate()?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM elements WHERE id = ?1",
            [el.id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(StoneforgeError::AlreadyExists {
            id: el.id.to_string(),
        });
    }
    insert_row(conn, el)?;
    super::tracking::mark_dirty(conn, &el.id, el.updated_at)?;
    Ok(())
}

fn insert_row(conn: &Connection, el: &Element) -> Result<()> {
    let tags = serde_json::to_string(&el.tags).map_err(|e| StoneforgeError::Database {
        detail: format!("serializing tags: {e}"),
    })?;
    let metadata = serde_json::to_string(&el.metadata).map_err(|e| StoneforgeError::Database {
        detail: format!("serializing metadata: {e}"),
    })?;
    conn.execute(
        "INSERT INTO elements (id, type, created_at, updated_at, created_by, tags, metadata, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             type = excluded.type,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at,
             created_by = excluded.created_by,
             tags = excluded.tags,
             metadata = excluded.metadata,
             deleted_at = excluded.deleted_at",
        params![
            el.id.as_str(),
            el.element_type.as_str(),
            el.created_at.to_rfc3339(),
            el.updated_at.to_rfc3339(),
            el.created_by,
            tags,
            metadata,
            el.deleted_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Fetch one element by id.
pub(super) fn get(conn: &Connection, id: &ElementId) -> Result<Option<Element>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM elements WHERE id = ?1"),
            [id.as_str()],
            element_from_row,
        )
        .optional()?;
    raw.map(RawElementRow::into_element).transpose()
}

/// Apply a patch under the immutability rules; returns the updated element.
pub(super) fn update(
    conn: &Connection,
    id: &ElementId,
    patch: &ElementPatch,
    _actor: &str,
    now: DateTime<Utc>,
) -> Result<Element> {
    if patch.id.is_some() {
        return Err(StoneforgeError::Immutable {
            field: "id",
            id: id.to_string(),
        });
    }
    if patch.created_at.is_some() {
        return Err(StoneforgeError::Immutable {
            field: "createdAt",
            id: id.to_string(),
        });
    }
    if patch.created_by.is_some() {
        return Err(StoneforgeError::Immutable {
            field: "createdBy",
            id: id.to_string(),
        });
    }

    let mut el = get(conn, id)?.ok_or_else(|| StoneforgeError::NotFound {
        id: id.to_string(),
    })?;

    if let Some(tags) = &patch.tags {
        el.tags.clone_from(tags);
    }
    if let Some(metadata) = &patch.metadata {
        el.metadata.clone_from(metadata);
    }
    if let Some(deleted_at) = patch.deleted_at {
        el.deleted_at = deleted_at;
    }
    el.updated_at = now.max(el.created_at);
    el.validate()?;

    insert_row(conn, &el)?;
    super::tracking::mark_dirty(conn, &el.id, el.updated_at)?;
    Ok(el)
}

/// Upsert an element verbatim, preserving its timestamps.
///
/// Used by sync import, where the merged record's `updatedAt` is
/// authoritative and must not be re-stamped.
pub(super) fn put_raw(conn: &Connection, el: &Element) -> Result<()> {
    el.validate()?;
    insert_row(conn, el)
}

/// Hard-delete tombstones whose `deletedAt` is older than the TTL horizon.
/// Returns the removed ids.
pub(super) fn purge_expired_tombstones(
    conn: &Connection,
    horizon: DateTime<Utc>,
) -> Result<Vec<ElementId>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM elements WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
    )?;
    let ids: Vec<String> = stmt
        .query_map([horizon.to_rfc3339()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut removed = Vec::with_capacity(ids.len());
    for id in ids {
        conn.execute("DELETE FROM elements WHERE id = ?1", [&id])?;
        conn.execute(
            "DELETE FROM dependencies WHERE blocked_id = ?1 OR blocker_id = ?1",
            [&id],
        )?;
        removed.push(ElementId::new(&id)?);
    }
    Ok(removed)
}

/// Paginated list.
pub(super) fn list(conn: &Connection, filter: &ElementFilter) -> Result<Vec<Element>> {
    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM elements WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(t) = filter.element_type {
        sql.push_str(" AND type = ?");
        args.push(Box::new(t.as_str().to_owned()));
    }
    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(" OFFSET ?");
        args.push(Box::new(i64::try_from(filter.offset).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let params = rusqlite::params_from_iter(args.iter().map(|arg| &**arg));
    let rows: Vec<RawElementRow> = stmt
        .query_map(params, element_from_row)?
        .collect::<rusqlite::Result<_>>()?;

    let mut elements = Vec::with_capacity(rows.len());
    for raw in rows {
        let el = raw.into_element()?;
        // Tag filtering happens after decode; tags are a JSON column.
        if let Some(tag) = &filter.tag
            && !el.tags.iter().any(|t| t == tag)
        {
            continue;
        }
        elements.push(el);
    }
    Ok(elements)
}
