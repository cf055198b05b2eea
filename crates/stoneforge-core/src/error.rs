//! Error types for the Stoneforge core.
//!
//! Defines [`StoneforgeError`], the unified error type for store, sync, and
//! graph operations. Error messages are designed to be agent-friendly: each
//! variant includes a clear description of what went wrong and, where
//! possible, actionable guidance on how to fix it.
//!
//! Every variant maps onto one of six [`ErrorKind`]s, each carrying a
//! machine-readable code, an HTTP-status hint for API surfaces, and a CLI
//! exit code.

use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The six error families every [`StoneforgeError`] falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: bad ids, tags, timestamps, or metadata.
    Validation,
    /// A referenced element or entity does not exist.
    NotFound,
    /// The operation collides with existing state (duplicate id, cycle).
    Conflict,
    /// The operation violates a structural constraint (immutability,
    /// dangling dependents).
    Constraint,
    /// The storage backend failed (connection, migration, integrity).
    Storage,
    /// Actor resolution or signing failed.
    Identity,
}

impl ErrorKind {
    /// HTTP status hint for API surfaces wrapping core errors.
    #[must_use]
    pub const fn http_hint(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Constraint => 422,
            Self::Storage => 500,
            Self::Identity => 403,
        }
    }

    /// Process exit code for the CLI contract.
    ///
    /// `0 success, 1 general, 2 invalid-args, 3 not-found, 4 validation,
    /// 5 permission` — storage and conflict failures map onto `1 general`.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Validation => 4,
            Self::NotFound => 3,
            Self::Conflict | Self::Constraint | Self::Storage => 1,
            Self::Identity => 5,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not-found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Constraint => write!(f, "constraint"),
            Self::Storage => write!(f, "storage"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

// ---------------------------------------------------------------------------
// StoneforgeError
// ---------------------------------------------------------------------------

/// Unified error type for Stoneforge core operations.
///
/// Each variant is designed to be self-contained: an agent receiving this
/// error should be able to understand what happened and what to do next
/// without additional context.
#[derive(Debug)]
pub enum StoneforgeError {
    /// Input failed validation for a reason not covered by a more specific
    /// variant.
    InvalidInput {
        /// What was wrong with the input.
        detail: String,
    },

    /// A tag failed validation.
    InvalidTag {
        /// The offending tag.
        tag: String,
        /// Why the tag is invalid.
        reason: String,
    },

    /// A timestamp failed validation (e.g. `updatedAt` before `createdAt`).
    InvalidTimestamp {
        /// Description of the problem.
        detail: String,
    },

    /// Element metadata failed validation.
    InvalidMetadata {
        /// Why the metadata is invalid.
        reason: String,
    },

    /// An element identifier failed validation.
    InvalidId {
        /// The invalid id that was provided.
        id: String,
        /// Why the id is invalid.
        reason: String,
    },

    /// The requested element does not exist.
    NotFound {
        /// The id that was not found.
        id: String,
    },

    /// A referenced entity (agent, channel, pool) does not exist.
    EntityNotFound {
        /// What kind of entity was looked up.
        what: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// An element with this id already exists.
    AlreadyExists {
        /// The id that is already taken.
        id: String,
    },

    /// Adding the dependency would create a cycle in the blocking subgraph.
    CycleDetected {
        /// The cycle, as a path of element ids starting and ending at the
        /// same element.
        path: Vec<String>,
    },

    /// An update attempted to change an immutable field.
    Immutable {
        /// The field that cannot be changed.
        field: &'static str,
        /// The element the update targeted.
        id: String,
    },

    /// The element cannot be deleted while other elements depend on it.
    HasDependents {
        /// The element that still has dependents.
        id: String,
        /// How many active dependents reference it.
        count: usize,
    },

    /// The storage backend reported an error.
    Database {
        /// Description from the backend.
        detail: String,
    },

    /// Applying schema migrations failed.
    MigrationFailed {
        /// Description of the failed migration step.
        detail: String,
    },

    /// The store's on-disk state is inconsistent.
    IntegrityFailure {
        /// Description of the inconsistency.
        detail: String,
    },

    /// Actor resolution or signing failed.
    Identity {
        /// Description of the identity failure.
        detail: String,
    },
}

impl StoneforgeError {
    /// The error family this variant belongs to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. }
            | Self::InvalidTag { .. }
            | Self::InvalidTimestamp { .. }
            | Self::InvalidMetadata { .. }
            | Self::InvalidId { .. } => ErrorKind::Validation,
            Self::NotFound { .. } | Self::EntityNotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::CycleDetected { .. } => ErrorKind::Conflict,
            Self::Immutable { .. } | Self::HasDependents { .. } => ErrorKind::Constraint,
            Self::Database { .. } | Self::MigrationFailed { .. } | Self::IntegrityFailure { .. } => {
                ErrorKind::Storage
            }
            Self::Identity { .. } => ErrorKind::Identity,
        }
    }

    /// Machine-readable error code, stable across releases.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "InvalidInput",
            Self::InvalidTag { .. } => "InvalidTag",
            Self::InvalidTimestamp { .. } => "InvalidTimestamp",
            Self::InvalidMetadata { .. } => "InvalidMetadata",
            Self::InvalidId { .. } => "InvalidId",
            Self::NotFound { .. } => "NotFound",
            Self::EntityNotFound { .. } => "EntityNotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::CycleDetected { .. } => "CycleDetected",
            Self::Immutable { .. } => "Immutable",
            Self::HasDependents { .. } => "HasDependents",
            Self::Database { .. } => "DatabaseError",
            Self::MigrationFailed { .. } => "MigrationFailed",
            Self::IntegrityFailure { .. } => "IntegrityFailure",
            Self::Identity { .. } => "IdentityError",
        }
    }

    /// CLI exit code for this error, per the runner contract.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

impl fmt::Display for StoneforgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { detail } => write!(f, "invalid input: {detail}"),
            Self::InvalidTag { tag, reason } => {
                write!(f, "invalid tag '{tag}': {reason}")
            }
            Self::InvalidTimestamp { detail } => write!(f, "invalid timestamp: {detail}"),
            Self::InvalidMetadata { reason } => write!(f, "invalid metadata: {reason}"),
            Self::InvalidId { id, reason } => write!(f, "invalid element id '{id}': {reason}"),
            Self::NotFound { id } => {
                write!(f, "element '{id}' not found")
            }
            Self::EntityNotFound { what, id } => {
                write!(f, "{what} '{id}' not found")
            }
            Self::AlreadyExists { id } => {
                write!(f, "element '{id}' already exists")
            }
            Self::CycleDetected { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            Self::Immutable { field, id } => {
                write!(f, "field '{field}' of element '{id}' is immutable")
            }
            Self::HasDependents { id, count } => {
                write!(
                    f,
                    "element '{id}' has {count} active dependent(s); remove the \
                     dependencies before deleting"
                )
            }
            Self::Database { detail } => write!(f, "database error: {detail}"),
            Self::MigrationFailed { detail } => write!(f, "schema migration failed: {detail}"),
            Self::IntegrityFailure { detail } => write!(f, "store integrity failure: {detail}"),
            Self::Identity { detail } => write!(f, "identity error: {detail}"),
        }
    }
}

impl std::error::Error for StoneforgeError {}

impl From<rusqlite::Error> for StoneforgeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database {
            detail: e.to_string(),
        }
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, StoneforgeError>;
