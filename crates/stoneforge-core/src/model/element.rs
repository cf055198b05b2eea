//! The [`Element`] base record and its identifier.
//!
//! Elements are the only first-class entities in the store. Identifiers are
//! opaque `el-<hash>` strings, optionally hierarchical (`el-<hash>.<n>`); the
//! structure is never parsed outside the generator and the child-counter
//! path.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoneforgeError};

/// Maximum number of tags on one element.
pub const MAX_TAGS: usize = 50;

/// Maximum length of a single tag, in characters.
pub const MAX_TAG_LEN: usize = 100;

/// Maximum serialized size of the metadata mapping, in bytes.
pub const MAX_METADATA_BYTES: usize = 64 * 1024;

/// Metadata keys with this prefix are reserved for the system and rejected
/// on user writes.
pub const RESERVED_METADATA_PREFIX: &str = "_el_";

// ---------------------------------------------------------------------------
// ElementId
// ---------------------------------------------------------------------------

/// A validated element identifier: `el-<hash>` with an optional dotted
/// hierarchical suffix (`el-1a2b3c.4`).
///
/// Root hashes are 6–10 lowercase hex characters. Child segments are decimal
/// numbers handed out by the store's per-parent counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementId(String);

impl ElementId {
    /// Create an `ElementId` from a string, validating format.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidId`] if the string is not a valid
    /// element id.
    pub fn new(s: &str) -> Result<Self> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Derive a fresh root id from the creation context.
    ///
    /// The hash input includes a monotonic element index so two elements
    /// created by the same actor in the same instant still get distinct ids.
    #[must_use]
    pub fn generate(
        element_type: ElementType,
        created_by: &str,
        created_at: DateTime<Utc>,
        index: u64,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(element_type.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(created_by.as_bytes());
        hasher.update(b"\0");
        hasher.update(created_at.to_rfc3339().as_bytes());
        hasher.update(b"\0");
        hasher.update(index.to_be_bytes());
        let digest = hasher.finalize();

        let mut hash = String::with_capacity(8);
        for byte in digest.iter().take(4) {
            use fmt::Write;
            // Writing hex into a String cannot fail.
            let _ = write!(hash, "{byte:02x}");
        }
        Self(format!("el-{hash}"))
    }

    /// Derive the id of the `n`-th child of `parent`.
    #[must_use]
    pub fn child(parent: &Self, n: u64) -> Self {
        Self(format!("{}.{n}", parent.0))
    }

    /// Return the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<()> {
        let invalid = |reason: &str| StoneforgeError::InvalidId {
            id: s.to_owned(),
            reason: reason.to_owned(),
        };

        let Some(rest) = s.strip_prefix("el-") else {
            return Err(invalid("must start with 'el-'"));
        };
        let mut segments = rest.split('.');
        let root = segments.next().unwrap_or_default();
        if root.len() < 6 || root.len() > 10 {
            return Err(invalid("root hash must be 6-10 hex characters"));
        }
        if !root
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(invalid("root hash must be lowercase hex"));
        }
        for seg in segments {
            if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("child segments must be decimal numbers"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ElementId {
    type Err = StoneforgeError;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ElementId {
    type Error = StoneforgeError;
    fn try_from(s: String) -> Result<Self> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<ElementId> for String {
    fn from(id: ElementId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ElementType
// ---------------------------------------------------------------------------

/// The closed set of element discriminators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Task,
    Message,
    Document,
    Entity,
    Plan,
    Workflow,
    Playbook,
    Channel,
    Library,
    Team,
}

impl ElementType {
    /// Stable string form used in ids, the database, and JSONL records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Message => "message",
            Self::Document => "document",
            Self::Entity => "entity",
            Self::Plan => "plan",
            Self::Workflow => "workflow",
            Self::Playbook => "playbook",
            Self::Channel => "channel",
            Self::Library => "library",
            Self::Team => "team",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task" => Ok(Self::Task),
            "message" => Ok(Self::Message),
            "document" => Ok(Self::Document),
            "entity" => Ok(Self::Entity),
            "plan" => Ok(Self::Plan),
            "workflow" => Ok(Self::Workflow),
            "playbook" => Ok(Self::Playbook),
            "channel" => Ok(Self::Channel),
            "library" => Ok(Self::Library),
            "team" => Ok(Self::Team),
            other => Err(StoneforgeError::InvalidInput {
                detail: format!("unknown element type '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// Base record shared by all domain types.
///
/// Soft deletion stamps [`Element::deleted_at`], turning the element into a
/// tombstone; hard removal happens only after the sync TTL. Richer records
/// (agent configuration, the task orchestrator sub-record) are typed views
/// over [`Element::metadata`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Immutable identifier.
    pub id: ElementId,
    /// Discriminator.
    #[serde(rename = "type")]
    pub element_type: ElementType,
    /// Creation timestamp; immutable.
    pub created_at: DateTime<Utc>,
    /// Last-mutation timestamp; always ≥ `created_at`.
    pub updated_at: DateTime<Utc>,
    /// Creator reference; immutable.
    pub created_by: String,
    /// Ordered tag bag, validated and duplicate-free.
    #[serde(default)]
    pub tags: Vec<String>,
    /// JSON metadata mapping, bounded to 64 KiB serialized.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Tombstone timestamp; `None` while the element is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Element {
    /// Validated constructor.
    ///
    /// # Errors
    /// Returns a validation error if the tags or metadata are out of bounds,
    /// or if `created_by` is empty.
    pub fn new(
        id: ElementId,
        element_type: ElementType,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        if created_by.is_empty() {
            return Err(StoneforgeError::InvalidInput {
                detail: "createdBy must not be empty".to_owned(),
            });
        }
        Ok(Self {
            id,
            element_type,
            created_at,
            updated_at: created_at,
            created_by: created_by.to_owned(),
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
            deleted_at: None,
        })
    }

    /// Attach validated tags. Consumes and returns `self` for chaining at
    /// construction sites.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidTag`] on malformed tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Result<Self> {
        validate_tags(&tags)?;
        self.tags = tags;
        Ok(self)
    }

    /// Attach validated metadata. Consumes and returns `self` for chaining.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidMetadata`] on reserved keys or
    /// oversized payloads.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        validate_metadata(&metadata)?;
        self.metadata = metadata;
        Ok(self)
    }

    /// Whether this element is a tombstone.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The task workflow status, if this element carries one.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.metadata.get("status").and_then(|v| v.as_str())
    }

    /// Whether the element's status is in the closed set.
    ///
    /// Only tasks carry a workflow status; for every other type this is
    /// always `false`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status().is_some_and(is_closed_status)
    }

    /// Structural validation of the whole record.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.updated_at < self.created_at {
            return Err(StoneforgeError::InvalidTimestamp {
                detail: format!(
                    "updatedAt {} is before createdAt {}",
                    self.updated_at, self.created_at
                ),
            });
        }
        validate_tags(&self.tags)?;
        validate_metadata(&self.metadata)?;
        Ok(())
    }
}

/// Whether a workflow status string counts as closed for blocking and merge
/// purposes.
#[must_use]
pub(crate) fn is_closed_status(status: &str) -> bool {
    matches!(status, "closed" | "tombstone")
}

/// Validate a tag list: charset, length, count, and uniqueness.
///
/// # Errors
/// Returns [`StoneforgeError::InvalidTag`] naming the offending tag.
pub(crate) fn validate_tags(tags: &[String]) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(StoneforgeError::InvalidTag {
            tag: String::new(),
            reason: format!("at most {MAX_TAGS} tags allowed, got {}", tags.len()),
        });
    }
    let mut seen = std::collections::HashSet::with_capacity(tags.len());
    for tag in tags {
        if tag.is_empty() {
            return Err(StoneforgeError::InvalidTag {
                tag: tag.clone(),
                reason: "tag must not be empty".to_owned(),
            });
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(StoneforgeError::InvalidTag {
                tag: tag.clone(),
                reason: format!("tag exceeds {MAX_TAG_LEN} characters"),
            });
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-'))
        {
            return Err(StoneforgeError::InvalidTag {
                tag: tag.clone(),
                reason: "allowed characters are A-Z, a-z, 0-9, '_', ':', '-'".to_owned(),
            });
        }
        if !seen.insert(tag.as_str()) {
            return Err(StoneforgeError::InvalidTag {
                tag: tag.clone(),
                reason: "duplicate tag".to_owned(),
            });
        }
    }
    Ok(())
}

/// Validate a metadata mapping: reserved prefix and serialized size.
///
/// # Errors
/// Returns [`StoneforgeError::InvalidMetadata`] on violation.
pub(crate) fn validate_metadata(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    for key in metadata.keys() {
        if key.starts_with(RESERVED_METADATA_PREFIX) {
            return Err(StoneforgeError::InvalidMetadata {
                reason: format!(
                    "key '{key}' uses the reserved prefix '{RESERVED_METADATA_PREFIX}'"
                ),
            });
        }
    }
    let serialized = serde_json::to_string(metadata).map_err(|e| {
        StoneforgeError::InvalidMetadata {
            reason: format!("metadata is not JSON-serializable: {e}"),
        }
    })?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(StoneforgeError::InvalidMetadata {
            reason: format!(
                "serialized metadata is {} bytes, limit is {MAX_METADATA_BYTES}",
                serialized.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().expect("valid timestamp")
    }

    #[test]
    fn generated_ids_are_valid_and_distinct_per_index() {
        let a = ElementId::generate(ElementType::Task, "el-director", now(), 1);
        let b = ElementId::generate(ElementType::Task, "el-director", now(), 2);
        assert_ne!(a, b);
        assert!(ElementId::new(a.as_str()).is_ok());
    }

    #[test]
    fn hierarchical_child_ids_round_trip() {
        let parent = ElementId::new("el-1a2b3c").expect("valid id");
        let child = ElementId::child(&parent, 4);
        assert_eq!(child.as_str(), "el-1a2b3c.4");
        assert!(ElementId::new(child.as_str()).is_ok());

        let grandchild = ElementId::child(&child, 2);
        assert_eq!(grandchild.as_str(), "el-1a2b3c.4.2");
        assert!(ElementId::new(grandchild.as_str()).is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(ElementId::new("task-123456").is_err());
        assert!(ElementId::new("el-12345").is_err()); // too short
        assert!(ElementId::new("el-0123456789ab").is_err()); // too long
        assert!(ElementId::new("el-ABCDEF").is_err()); // uppercase
        assert!(ElementId::new("el-1a2b3c.x").is_err()); // non-numeric child
    }

    #[test]
    fn tag_validation_rejects_bad_charsets_and_duplicates() {
        assert!(validate_tags(&["ok_tag:v1-x".to_owned()]).is_ok());
        assert!(validate_tags(&["has space".to_owned()]).is_err());
        assert!(validate_tags(&["a".to_owned(), "a".to_owned()]).is_err());
        assert!(validate_tags(&["x".repeat(MAX_TAG_LEN + 1)]).is_err());

        let too_many: Vec<String> = (0..=MAX_TAGS).map(|i| format!("t{i}")).collect();
        assert!(validate_tags(&too_many).is_err());
    }

    #[test]
    fn metadata_rejects_reserved_prefix_and_oversize() {
        let mut meta = serde_json::Map::new();
        meta.insert("_el_hash".to_owned(), serde_json::Value::Null);
        assert!(validate_metadata(&meta).is_err());

        let mut big = serde_json::Map::new();
        big.insert(
            "blob".to_owned(),
            serde_json::Value::String("x".repeat(MAX_METADATA_BYTES)),
        );
        assert!(validate_metadata(&big).is_err());
    }

    #[test]
    fn constructor_enforces_timestamp_order() {
        let id = ElementId::new("el-abcdef").expect("valid id");
        let mut el = Element::new(id, ElementType::Task, "el-director", now()).expect("valid");
        el.updated_at = now() - chrono::Duration::seconds(1);
        assert!(matches!(
            el.validate(),
            Err(StoneforgeError::InvalidTimestamp { .. })
        ));
    }
}
