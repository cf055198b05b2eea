//! Two-workspace sync scenarios over the JSONL files: lossless first
//! contact, LWW with tag union, and tombstone propagation.

use chrono::{Duration, Utc};

use stoneforge_core::model::{Element, ElementType};
use stoneforge_core::store::{ElementPatch, Store};
use stoneforge_core::sync::{Resolution, SyncPaths, Syncer};

const TTL_DAYS: i64 = 30;

fn ttl() -> Duration {
    Duration::days(TTL_DAYS)
}

fn seed_task(store: &Store, actor: &str, tags: &[&str]) -> Element {
    let now = Utc::now();
    let id = store.mint_id(ElementType::Task, actor, now).expect("mint");
    let mut el = Element::new(id, ElementType::Task, actor, now).expect("element");
    el.metadata.insert("status".to_owned(), "open".into());
    el = el
        .with_tags(tags.iter().map(|t| (*t).to_owned()).collect())
        .expect("tags");
    store.create(&el).expect("create");
    el
}

struct Peer {
    store: Store,
    _dir: tempfile::TempDir,
    paths: SyncPaths,
}

impl Peer {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = SyncPaths::under(&dir.path().join("sync"));
        Self {
            store: Store::open_in_memory().expect("store"),
            _dir: dir,
            paths,
        }
    }

    fn syncer(&self) -> Syncer<'_> {
        Syncer::new(&self.store, self.paths.clone(), ttl())
    }
}

#[test]
fn divergent_tag_edits_union_under_lww() {
    let alice = Peer::new();
    let task = seed_task(&alice.store, "el-a11ce0", &["x", "y"]);
    alice.syncer().export().expect("export");

    // Bob picks up Alice's state through her files.
    let bob = Peer::new();
    Syncer::new(&bob.store, alice.paths.clone(), ttl())
        .import()
        .expect("import");

    // Bob retags later; Alice is stale.
    std::thread::sleep(std::time::Duration::from_millis(20));
    bob.store
        .update(
            &task.id,
            &ElementPatch {
                tags: Some(vec!["y".to_owned(), "z".to_owned()]),
                ..ElementPatch::default()
            },
            "el-b0b000",
        )
        .expect("bob retags");
    Syncer::new(&bob.store, bob.paths.clone(), ttl())
        .export()
        .expect("bob exports");

    // Alice merges Bob's newer record: remote wins, tags union.
    let report = Syncer::new(&alice.store, bob.paths.clone(), ttl())
        .import()
        .expect("alice imports");
    assert_eq!(report.conflicts, 1);

    let merged = alice.store.require(&task.id).expect("merged");
    assert_eq!(merged.tags, vec!["x", "y", "z"]);

    let journal = Syncer::new(&alice.store, bob.paths.clone(), ttl())
        .recent_conflicts(10)
        .expect("journal");
    assert_eq!(journal.last().expect("entry").resolution, Resolution::TagsMerged);
}

#[test]
fn fresh_tombstones_propagate_through_import() {
    let alice = Peer::new();
    let task = seed_task(&alice.store, "el-a11ce0", &[]);
    alice.syncer().export().expect("export");

    let bob = Peer::new();
    Syncer::new(&bob.store, alice.paths.clone(), ttl())
        .import()
        .expect("import");

    // Alice deletes; Bob edits. The fresh tombstone still wins.
    alice
        .store
        .soft_delete(&task.id, "el-a11ce0")
        .expect("delete");
    alice.syncer().export().expect("export tombstone");

    std::thread::sleep(std::time::Duration::from_millis(20));
    bob.store
        .update(
            &task.id,
            &ElementPatch {
                tags: Some(vec!["late-edit".to_owned()]),
                ..ElementPatch::default()
            },
            "el-b0b000",
        )
        .expect("bob edits");

    Syncer::new(&bob.store, alice.paths.clone(), ttl())
        .import()
        .expect("bob imports tombstone");
    let merged = bob.store.require(&task.id).expect("record");
    assert!(merged.is_deleted());
}

#[test]
fn reimporting_own_export_is_conflict_free() {
    let alice = Peer::new();
    seed_task(&alice.store, "el-a11ce0", &["solo"]);
    alice.syncer().export().expect("export");

    let report = alice.syncer().import().expect("import");
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.elements_written, 0);
    assert_eq!(report.dependencies_removed, 0);
}
