//! Dependency edges between elements.
//!
//! Edges are stored externally and reference elements by id only. The edge
//! key `(blockedId, blockerId, type)` is unique; `relates-to` is
//! semantically bidirectional but stored once.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoneforgeError};
use crate::model::ElementId;

// ---------------------------------------------------------------------------
// DependencyType
// ---------------------------------------------------------------------------

/// The typed semantics of a dependency edge.
///
/// `blocks`, `awaits`, and `parent-child` are blocking; `relates-to`,
/// `mentions`, and `references` are informational and never affect the
/// computed `blocked` predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    Awaits,
    ParentChild,
    RelatesTo,
    Mentions,
    References,
}

impl DependencyType {
    /// Whether an active edge of this type makes its `blockedId` blocked.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Blocks | Self::Awaits | Self::ParentChild)
    }

    /// Stable string form used in the database and JSONL records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Awaits => "awaits",
            Self::ParentChild => "parent-child",
            Self::RelatesTo => "relates-to",
            Self::Mentions => "mentions",
            Self::References => "references",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocks" => Ok(Self::Blocks),
            "awaits" => Ok(Self::Awaits),
            "parent-child" => Ok(Self::ParentChild),
            "relates-to" => Ok(Self::RelatesTo),
            "mentions" => Ok(Self::Mentions),
            "references" => Ok(Self::References),
            other => Err(StoneforgeError::InvalidInput {
                detail: format!("unknown dependency type '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------------

/// A directed edge `(blockedId, blockerId, type)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// The element waiting on the blocker.
    pub blocked_id: ElementId,
    /// The element being waited on.
    pub blocker_id: ElementId,
    /// Edge semantics.
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    /// When the edge was recorded.
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    /// Validated constructor: rejects self-loops.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidInput`] if both endpoints are the
    /// same element.
    pub fn new(
        blocked_id: ElementId,
        blocker_id: ElementId,
        dep_type: DependencyType,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        if blocked_id == blocker_id {
            return Err(StoneforgeError::InvalidInput {
                detail: format!("dependency self-loop on '{blocked_id}'"),
            });
        }
        Ok(Self {
            blocked_id,
            blocker_id,
            dep_type,
            created_at,
        })
    }

    /// The unique edge key.
    #[must_use]
    pub fn key(&self) -> (ElementId, ElementId, DependencyType) {
        (
            self.blocked_id.clone(),
            self.blocker_id.clone(),
            self.dep_type,
        )
    }
}
