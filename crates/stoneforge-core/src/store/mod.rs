//! The element store — single-writer SQLite persistence for elements,
//! dependencies, the dirty set, and counters.
//!
//! All mutations funnel through a per-process mutex bundled into the
//! transaction wrapper: the store is synchronous from the caller's
//! perspective and never yields while holding a row lock. Reads are
//! snapshot-consistent within a transaction; no reader observes a
//! partially-written element.

mod dependencies;
mod elements;
mod schema;
mod tracking;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Result, StoneforgeError};
use crate::model::{Dependency, DependencyType, Element, ElementId, ElementType};

pub use elements::{ElementFilter, ElementPatch};
pub use schema::SCHEMA_VERSION;

/// Default tombstone TTL before hard removal.
pub const DEFAULT_TOMBSTONE_TTL_DAYS: i64 = 30;

/// Counter name backing the monotonic element index in generated ids.
const ELEMENT_INDEX_COUNTER: &str = "element_index";

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

/// Transaction isolation, mirroring SQLite's begin behaviors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Take locks lazily on first use.
    #[default]
    Deferred,
    /// Take the write lock up front.
    Immediate,
    /// Exclude even readers.
    Exclusive,
}

impl From<Isolation> for TransactionBehavior {
    fn from(iso: Isolation) -> Self {
        match iso {
            Isolation::Deferred => Self::Deferred,
            Isolation::Immediate => Self::Immediate,
            Isolation::Exclusive => Self::Exclusive,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable persistence for elements, dependencies, a dirty-elements set, and
/// hierarchical child counters.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a store at `path`, applying pending migrations.
    ///
    /// # Errors
    /// Returns a `Storage` error if the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| StoneforgeError::Database {
            detail: format!("opening '{}': {e}", path.display()),
        })?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, dry runs).
    ///
    /// # Errors
    /// Returns a `Storage` error if initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a single write transaction with the given isolation.
    ///
    /// Every operation exposed on [`StoreTx`] participates in the same
    /// transaction; an `Err` from `f` rolls everything back.
    ///
    /// # Errors
    /// Propagates `f`'s error, or a `Storage` error from commit/rollback.
    pub fn transaction<T>(
        &self,
        isolation: Isolation,
        f: impl FnOnce(&StoreTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| poisoned())?;
        let tx = guard.transaction_with_behavior(isolation.into())?;
        let result = f(&StoreTx { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Rollback happens on drop; the caller's error wins.
                Err(e)
            }
        }
    }

    fn with_tx<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        self.transaction(Isolation::Deferred, f)
    }

    /// Mint a fresh root element id from the creation context and the
    /// store's monotonic element index.
    ///
    /// # Errors
    /// Returns a `Storage` error if the counter cannot be advanced.
    pub fn mint_id(
        &self,
        element_type: ElementType,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ElementId> {
        self.with_tx(|tx| {
            let index = tracking::next_counter(tx.conn, ELEMENT_INDEX_COUNTER)?;
            Ok(ElementId::generate(
                element_type,
                created_by,
                created_at,
                index,
            ))
        })
    }

    /// Insert a validated element; fails with `AlreadyExists` if the id is
    /// taken. Marks the element dirty.
    ///
    /// # Errors
    /// `AlreadyExists`, validation errors, or `Storage` failures.
    pub fn create(&self, el: &Element) -> Result<()> {
        self.with_tx(|tx| tx.create(el))
    }

    /// Fetch one element.
    ///
    /// # Errors
    /// `Storage` failures only; a missing id is `Ok(None)`.
    pub fn get(&self, id: &ElementId) -> Result<Option<Element>> {
        self.with_tx(|tx| tx.get(id))
    }

    /// Fetch one element, failing with `NotFound` if missing.
    ///
    /// # Errors
    /// `NotFound` or `Storage` failures.
    pub fn require(&self, id: &ElementId) -> Result<Element> {
        self.with_tx(|tx| tx.require(id))
    }

    /// Apply a patch; returns the updated element. Marks it dirty.
    ///
    /// # Errors
    /// `NotFound` on a missing id, `Immutable` on attempts to change
    /// id/createdAt/createdBy, validation errors, `Storage` failures.
    pub fn update(&self, id: &ElementId, patch: &ElementPatch, actor: &str) -> Result<Element> {
        self.with_tx(|tx| tx.update(id, patch, actor))
    }

    /// Soft-delete: stamp `deletedAt`, turning the element into a tombstone.
    ///
    /// # Errors
    /// `HasDependents` if live elements still depend on this one;
    /// `NotFound` on a missing id.
    pub fn soft_delete(&self, id: &ElementId, actor: &str) -> Result<Element> {
        self.with_tx(|tx| {
            let dependents = dependencies::dependents_of(tx.conn, id, None)?;
            let mut live = 0usize;
            for dep in &dependents {
                if let Some(el) = elements::get(tx.conn, &dep.blocked_id)?
                    && !el.is_deleted()
                {
                    live += 1;
                }
            }
            if live > 0 {
                return Err(StoneforgeError::HasDependents {
                    id: id.to_string(),
                    count: live,
                });
            }
            tx.update(
                id,
                &ElementPatch {
                    deleted_at: Some(Some(Utc::now())),
                    ..ElementPatch::default()
                },
                actor,
            )
        })
    }

    /// Paginated listing.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn list(&self, filter: &ElementFilter) -> Result<Vec<Element>> {
        self.with_tx(|tx| elements::list(tx.conn, filter))
    }

    /// Upsert a merged element verbatim (sync import path); timestamps are
    /// preserved, dirtiness is the caller's decision.
    ///
    /// # Errors
    /// Validation or `Storage` failures.
    pub fn put_raw(&self, el: &Element) -> Result<()> {
        self.with_tx(|tx| elements::put_raw(tx.conn, el))
    }

    /// Hard-remove tombstones older than `ttl`. Returns the purged ids.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn purge_expired_tombstones(&self, ttl: Duration) -> Result<Vec<ElementId>> {
        let horizon = Utc::now() - ttl;
        self.with_tx(|tx| elements::purge_expired_tombstones(tx.conn, horizon))
    }

    /// Insert a dependency edge (no cycle validation — see
    /// [`crate::graph::detect_cycle`]).
    ///
    /// # Errors
    /// `NotFound` for a missing endpoint, `AlreadyExists` for a duplicate
    /// edge key.
    pub fn add_dependency(&self, dep: &Dependency) -> Result<()> {
        self.with_tx(|tx| tx.add_dependency(dep))
    }

    /// Remove an edge by key; returns whether anything was removed.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn remove_dependency(
        &self,
        blocked: &ElementId,
        blocker: &ElementId,
        dep_type: DependencyType,
    ) -> Result<bool> {
        self.with_tx(|tx| dependencies::remove(tx.conn, blocked, blocker, dep_type))
    }

    /// Edges naming `id` as blocked, optionally restricted by type.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn get_dependencies(
        &self,
        id: &ElementId,
        types: Option<&[DependencyType]>,
    ) -> Result<Vec<Dependency>> {
        self.with_tx(|tx| dependencies::dependencies_of(tx.conn, id, types))
    }

    /// Edges naming `id` as blocker, optionally restricted by type.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn get_dependents(
        &self,
        id: &ElementId,
        types: Option<&[DependencyType]>,
    ) -> Result<Vec<Dependency>> {
        self.with_tx(|tx| dependencies::dependents_of(tx.conn, id, types))
    }

    /// Every edge in the store (export path).
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        self.with_tx(|tx| dependencies::all(tx.conn))
    }

    /// Record an element as mutated since the last export (idempotent).
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn mark_dirty(&self, id: &ElementId) -> Result<()> {
        self.with_tx(|tx| tracking::mark_dirty(tx.conn, id, Utc::now()))
    }

    /// All dirty element ids, oldest mark first.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn dirty_elements(&self) -> Result<Vec<ElementId>> {
        self.with_tx(|tx| tracking::dirty_elements(tx.conn))
    }

    /// Drop ids from the dirty set after a successful export.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn clear_dirty(&self, ids: &[ElementId]) -> Result<()> {
        self.with_tx(|tx| tracking::clear_dirty(tx.conn, ids))
    }

    /// Atomic, per-parent-monotone child number.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn next_child_number(&self, parent: &ElementId) -> Result<u64> {
        self.with_tx(|tx| tx.next_child_number(parent))
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().map_err(|_| poisoned())?;
        f(&guard)
    }
}

fn poisoned() -> StoneforgeError {
    StoneforgeError::Database {
        detail: "store mutex poisoned by a panicking writer".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// StoreTx
// ---------------------------------------------------------------------------

/// Handle passed to [`Store::transaction`] closures: the same operations,
/// scoped to the open transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    /// See [`Store::create`].
    ///
    /// # Errors
    /// As [`Store::create`].
    pub fn create(&self, el: &Element) -> Result<()> {
        elements::create(self.conn, el)
    }

    /// See [`Store::get`].
    ///
    /// # Errors
    /// As [`Store::get`].
    pub fn get(&self, id: &ElementId) -> Result<Option<Element>> {
        elements::get(self.conn, id)
    }

    /// See [`Store::require`].
    ///
    /// # Errors
    /// As [`Store::require`].
    pub fn require(&self, id: &ElementId) -> Result<Element> {
        self.get(id)?.ok_or_else(|| StoneforgeError::NotFound {
            id: id.to_string(),
        })
    }

    /// See [`Store::update`].
    ///
    /// # Errors
    /// As [`Store::update`].
    pub fn update(&self, id: &ElementId, patch: &ElementPatch, actor: &str) -> Result<Element> {
        elements::update(self.conn, id, patch, actor, Utc::now())
    }

    /// See [`Store::add_dependency`].
    ///
    /// # Errors
    /// As [`Store::add_dependency`].
    pub fn add_dependency(&self, dep: &Dependency) -> Result<()> {
        dependencies::add(self.conn, dep)
    }

    /// See [`Store::next_child_number`].
    ///
    /// # Errors
    /// As [`Store::next_child_number`].
    pub fn next_child_number(&self, parent: &ElementId) -> Result<u64> {
        tracking::next_child_number(self.conn, parent)
    }
}
