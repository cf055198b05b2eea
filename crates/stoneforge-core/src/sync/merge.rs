//! Per-element merge: LWW with tombstone classification, closed-status
//! precedence, and tag set union.
//!
//! The merge is commutative modulo tag order for live-vs-live inputs with
//! distinct `updatedAt`, and idempotent (`merge(a, a)` keeps `a` with
//! resolution `IDENTICAL`). A conflict record is emitted whenever the two
//! content hashes differ, regardless of which side wins.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Element;
use crate::sync::hash::content_hash;

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// How a merge was decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Content hashes matched; local kept, no conflict.
    Identical,
    /// Local side won.
    LocalWins,
    /// Remote side won.
    RemoteWins,
    /// A winner was picked by LWW, then the tag union changed its tags.
    TagsMerged,
}

/// One line in the conflict journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// The element both sides changed.
    pub id: String,
    /// Local content hash.
    pub local_hash: String,
    /// Remote content hash.
    pub remote_hash: String,
    /// How the merge resolved.
    pub resolution: Resolution,
    /// Local `updatedAt`.
    pub local_updated_at: DateTime<Utc>,
    /// Remote `updatedAt`.
    pub remote_updated_at: DateTime<Utc>,
    /// When the merge ran.
    pub resolved_at: DateTime<Utc>,
}

/// The merged element plus how it was decided.
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// The surviving record.
    pub element: Element,
    /// How the merge resolved.
    pub resolution: Resolution,
    /// Present whenever the content hashes differed.
    pub conflict: Option<ConflictRecord>,
}

// ---------------------------------------------------------------------------
// Tombstone classification
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Liveness {
    Live,
    FreshTombstone,
    ExpiredTombstone,
}

fn classify(el: &Element, ttl: Duration, now: DateTime<Utc>) -> Liveness {
    match el.deleted_at {
        None => Liveness::Live,
        Some(deleted_at) if now - deleted_at <= ttl => Liveness::FreshTombstone,
        Some(_) => Liveness::ExpiredTombstone,
    }
}

// ---------------------------------------------------------------------------
// merge_elements
// ---------------------------------------------------------------------------

/// Merge `local` and `remote` versions of one element.
///
/// # Errors
/// Only hashing can fail, and only on unserializable metadata.
pub fn merge_elements(
    local: &Element,
    remote: &Element,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let local_hash = content_hash(local)?;
    let remote_hash = content_hash(remote)?;

    // Rule 1: hash equality short-circuits; keep local.
    if local_hash == remote_hash {
        return Ok(MergeOutcome {
            element: local.clone(),
            resolution: Resolution::Identical,
            conflict: None,
        });
    }

    let decided = decide(local, remote, ttl, now);
    let (mut element, resolution) = match decided {
        Side::Local => (local.clone(), Resolution::LocalWins),
        Side::Remote => (remote.clone(), Resolution::RemoteWins),
        Side::LastWriter => {
            // Rule 5: LWW by updatedAt, ties to local; then tag union.
            let (mut winner, mut res) = if remote.updated_at > local.updated_at {
                (remote.clone(), Resolution::RemoteWins)
            } else {
                (local.clone(), Resolution::LocalWins)
            };
            let union = tag_union(&local.tags, &remote.tags);
            if union != winner.tags {
                winner.tags = union;
                res = Resolution::TagsMerged;
            }
            (winner, res)
        }
    };

    // A tag-merged winner is a new revision; its updatedAt must cover both
    // inputs so a later LWW round doesn't resurrect the loser.
    if resolution == Resolution::TagsMerged {
        element.updated_at = element.updated_at.max(local.updated_at).max(remote.updated_at);
    }

    let conflict = ConflictRecord {
        id: local.id.to_string(),
        local_hash,
        remote_hash,
        resolution,
        local_updated_at: local.updated_at,
        remote_updated_at: remote.updated_at,
        resolved_at: now,
    };

    Ok(MergeOutcome {
        element,
        resolution,
        conflict: Some(conflict),
    })
}

enum Side {
    Local,
    Remote,
    LastWriter,
}

fn decide(local: &Element, remote: &Element, ttl: Duration, now: DateTime<Utc>) -> Side {
    // Rules 2-3: tombstone classification. FRESH beats LIVE; LIVE beats
    // EXPIRED; two tombstones fall through to LWW.
    let l = classify(local, ttl, now);
    let r = classify(remote, ttl, now);
    match (l, r) {
        (Liveness::FreshTombstone, Liveness::Live) => return Side::Local,
        (Liveness::Live, Liveness::FreshTombstone) => return Side::Remote,
        (Liveness::ExpiredTombstone, Liveness::Live) => return Side::Remote,
        (Liveness::Live, Liveness::ExpiredTombstone) => return Side::Local,
        _ => {}
    }

    // Rule 4: closed-status precedence, task-specific. Only when both
    // sides carry a status; a status-less record never loses on this rule.
    // If exactly one side is closed, the closed side wins regardless of
    // updatedAt.
    if local.status().is_some() && remote.status().is_some() {
        match (local.is_closed(), remote.is_closed()) {
            (true, false) => return Side::Local,
            (false, true) => return Side::Remote,
            _ => {}
        }
    }
    Side::LastWriter
}

/// Sorted set union of two tag lists.
fn tag_union(a: &[String], b: &[String]) -> Vec<String> {
    let mut union: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    union.sort();
    union.dedup();
    union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementId, ElementType};

    fn ttl() -> Duration {
        Duration::days(30)
    }

    fn base(id: &str) -> Element {
        let created: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().expect("timestamp");
        Element::new(
            ElementId::new(id).expect("valid id"),
            ElementType::Task,
            "el-boot01",
            created,
        )
        .expect("valid element")
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    #[test]
    fn merge_is_idempotent() {
        let el = base("el-aaaa11");
        let out = merge_elements(&el, &el, ttl(), Utc::now()).expect("merge");
        assert_eq!(out.resolution, Resolution::Identical);
        assert_eq!(out.element, el);
        assert!(out.conflict.is_none());
    }

    #[test]
    fn lww_picks_newer_remote_and_unions_tags() {
        let mut local = base("el-aaaa11");
        local.tags = vec!["x".to_owned(), "y".to_owned()];
        local.updated_at = at("2026-01-02T00:00:00Z");

        let mut remote = base("el-aaaa11");
        remote.tags = vec!["y".to_owned(), "z".to_owned()];
        remote.updated_at = at("2026-01-03T00:00:00Z");

        let out = merge_elements(&local, &remote, ttl(), Utc::now()).expect("merge");
        assert_eq!(out.resolution, Resolution::TagsMerged);
        assert_eq!(out.element.tags, vec!["x", "y", "z"]);
        let conflict = out.conflict.expect("hashes differ");
        assert_eq!(conflict.resolution, Resolution::TagsMerged);
    }

    #[test]
    fn lww_tie_goes_to_local() {
        let mut local = base("el-aaaa11");
        local.metadata.insert("note".to_owned(), "local".into());
        let mut remote = base("el-aaaa11");
        remote.metadata.insert("note".to_owned(), "remote".into());

        let out = merge_elements(&local, &remote, ttl(), Utc::now()).expect("merge");
        assert_eq!(out.resolution, Resolution::LocalWins);
        assert_eq!(out.element.metadata.get("note"), local.metadata.get("note"));
    }

    #[test]
    fn fresh_tombstone_beats_live() {
        let now = Utc::now();
        let mut tombstone = base("el-aaaa11");
        tombstone.deleted_at = Some(now - Duration::days(2));
        let mut live = base("el-aaaa11");
        live.updated_at = now; // newer than the tombstone, still loses

        let out = merge_elements(&tombstone, &live, ttl(), now).expect("merge");
        assert_eq!(out.resolution, Resolution::LocalWins);
        assert!(out.element.is_deleted());

        let flipped = merge_elements(&live, &tombstone, ttl(), now).expect("merge");
        assert_eq!(flipped.resolution, Resolution::RemoteWins);
        assert!(flipped.element.is_deleted());
    }

    #[test]
    fn expired_tombstone_loses_to_live() {
        let now = Utc::now();
        let mut tombstone = base("el-aaaa11");
        tombstone.deleted_at = Some(now - Duration::days(90));
        tombstone.updated_at = now;
        let live = base("el-aaaa11");

        let out = merge_elements(&tombstone, &live, ttl(), now).expect("merge");
        assert_eq!(out.resolution, Resolution::RemoteWins);
        assert!(!out.element.is_deleted());
    }

    #[test]
    fn closed_side_wins_regardless_of_updated_at() {
        let mut closed = base("el-aaaa11");
        closed.metadata.insert("status".to_owned(), "closed".into());
        closed.updated_at = at("2026-01-02T00:00:00Z");

        let mut open = base("el-aaaa11");
        open.metadata.insert("status".to_owned(), "open".into());
        open.updated_at = at("2026-02-01T00:00:00Z"); // much newer

        let out = merge_elements(&closed, &open, ttl(), Utc::now()).expect("merge");
        assert_eq!(out.resolution, Resolution::LocalWins);
        assert_eq!(out.element.status(), Some("closed"));

        let flipped = merge_elements(&open, &closed, ttl(), Utc::now()).expect("merge");
        assert_eq!(flipped.resolution, Resolution::RemoteWins);
        assert_eq!(flipped.element.status(), Some("closed"));
    }

    #[test]
    fn closed_precedence_needs_a_status_on_both_sides() {
        let mut closed = base("el-aaaa11");
        closed.metadata.insert("status".to_owned(), "closed".into());
        closed.updated_at = at("2026-01-02T00:00:00Z");

        // The other side never carried a status: rule 4 is out and the
        // newer record wins on plain LWW.
        let mut statusless = base("el-aaaa11");
        statusless
            .metadata
            .insert("note".to_owned(), "fresher edit".into());
        statusless.updated_at = at("2026-02-01T00:00:00Z");

        let out = merge_elements(&closed, &statusless, ttl(), Utc::now()).expect("merge");
        assert_eq!(out.resolution, Resolution::RemoteWins);
        assert_eq!(out.element.status(), None);

        let flipped = merge_elements(&statusless, &closed, ttl(), Utc::now()).expect("merge");
        assert_eq!(flipped.resolution, Resolution::LocalWins);
        assert_eq!(flipped.element.status(), None);
    }

    #[test]
    fn conflict_record_carries_both_hashes() {
        let mut local = base("el-aaaa11");
        local.tags = vec!["a".to_owned()];
        let mut remote = base("el-aaaa11");
        remote.tags = vec!["b".to_owned()];
        remote.updated_at = local.updated_at + Duration::seconds(1);

        let out = merge_elements(&local, &remote, ttl(), Utc::now()).expect("merge");
        let conflict = out.conflict.expect("conflict");
        assert_eq!(conflict.local_hash.len(), 64);
        assert_eq!(conflict.remote_hash.len(), 64);
        assert_ne!(conflict.local_hash, conflict.remote_hash);
        assert_eq!(conflict.id, "el-aaaa11");
    }
}
