//! Three-way merge of dependency edge sets.
//!
//! Edges are keyed by `(blockedId, blockerId, type)`. Removal is always
//! authoritative: an edge missing on either side that the shared baseline
//! witnessed is dropped from the merged set.

use std::collections::BTreeMap;

use crate::model::{Dependency, DependencyType, ElementId};

type EdgeKey = (ElementId, ElementId, DependencyType);

fn keyed(edges: &[Dependency]) -> BTreeMap<EdgeKey, &Dependency> {
    edges.iter().map(|e| (e.key(), e)).collect()
}

/// Merge local and remote edge sets against the shared baseline.
///
/// - present in both → keep the remote record;
/// - present only locally → dropped if the baseline has it (remote removed
///   it), kept otherwise (local addition);
/// - present only remotely → dropped if the baseline has it (local removed
///   it), kept otherwise (remote addition).
#[must_use]
pub fn merge_dependencies(
    local: &[Dependency],
    remote: &[Dependency],
    original: &[Dependency],
) -> Vec<Dependency> {
    let local = keyed(local);
    let remote = keyed(remote);
    let original = keyed(original);

    let mut merged: BTreeMap<EdgeKey, Dependency> = BTreeMap::new();

    for (key, edge) in &remote {
        if local.contains_key(key) {
            merged.insert(key.clone(), (*edge).clone());
        } else if !original.contains_key(key) {
            // Remote addition.
            merged.insert(key.clone(), (*edge).clone());
        }
        // else: local removed a baseline edge — removal wins.
    }

    for (key, edge) in &local {
        if remote.contains_key(key) || original.contains_key(key) {
            // Either already handled above, or remote removed it.
            continue;
        }
        merged.insert(key.clone(), (*edge).clone());
    }

    merged.into_values().collect()
}
