//! Sync & merge: content hashing, per-element LWW merge, dependency
//! three-way merge, and JSONL import/export with a conflict journal.

mod deps;
mod hash;
mod jsonl;
mod merge;

pub use deps::merge_dependencies;
pub use hash::content_hash;
pub use jsonl::{ExportReport, ImportReport, SyncPaths, Syncer};
pub use merge::{merge_elements, ConflictRecord, MergeOutcome, Resolution};

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::{Element, ElementId, ElementType};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn arb_tags() -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("[a-z]{1,6}", 0..5)
            .prop_map(|set| set.into_iter().collect())
    }

    fn arb_updated_at() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..1_000_000).prop_map(|offset| {
            Utc.timestamp_opt(1_760_000_000 + offset, 0)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }

    fn element(tags: Vec<String>, updated_at: DateTime<Utc>) -> Element {
        let created = Utc
            .timestamp_opt(1_760_000_000, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let mut el = Element::new(
            ElementId::new("el-facade").expect("valid id"),
            ElementType::Task,
            "el-boot01",
            created,
        )
        .expect("valid element");
        el.tags = tags;
        el.updated_at = updated_at;
        el
    }

    proptest! {
        // merge(a, a) == a with resolution IDENTICAL.
        #[test]
        fn merge_idempotence(tags in arb_tags(), updated in arb_updated_at()) {
            let el = element(tags, updated);
            let out = merge_elements(&el, &el, Duration::days(30), Utc::now())
                .expect("merge");
            prop_assert_eq!(out.resolution, Resolution::Identical);
            prop_assert_eq!(out.element, el);
        }

        // Swapping local and remote yields the same winner content and the
        // same merged tag set when updatedAt differs.
        #[test]
        fn merge_commutativity_modulo_tag_order(
            tags_a in arb_tags(),
            tags_b in arb_tags(),
            updated_a in arb_updated_at(),
            updated_b in arb_updated_at(),
        ) {
            prop_assume!(updated_a != updated_b);
            let a = element(tags_a, updated_a);
            let b = element(tags_b, updated_b);
            let now = Utc::now();

            let ab = merge_elements(&a, &b, Duration::days(30), now).expect("merge");
            let ba = merge_elements(&b, &a, Duration::days(30), now).expect("merge");

            let mut ab_tags = ab.element.tags.clone();
            let mut ba_tags = ba.element.tags.clone();
            ab_tags.sort();
            ba_tags.sort();
            prop_assert_eq!(ab_tags, ba_tags);
            prop_assert_eq!(ab.element.updated_at, ba.element.updated_at);
            prop_assert_eq!(ab.element.metadata, ba.element.metadata);
        }

        // A fresh tombstone dominates a live record from either side.
        #[test]
        fn tombstone_dominance(tags in arb_tags(), updated in arb_updated_at()) {
            let now = Utc::now();
            let live = element(tags.clone(), updated);
            let mut tombstone = element(tags, updated);
            tombstone.deleted_at = Some(now - Duration::days(1));

            let a = merge_elements(&tombstone, &live, Duration::days(30), now)
                .expect("merge");
            let b = merge_elements(&live, &tombstone, Duration::days(30), now)
                .expect("merge");
            prop_assert!(a.element.is_deleted());
            prop_assert!(b.element.is_deleted());
        }
    }
}
