//! End-to-end steward scenarios: the merge sweep, executor error isolation,
//! and the execution history.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use stoneforge::session::{ProcessLauncher, SessionManager, StartOptions};
use stoneforge::steward::{
    BuiltinExecutor, MergeBackend, MergeDisposition, MergeStewardService, StewardScheduler,
};
use stoneforge_core::model::{
    AgentConfig, AgentRole, Element, ElementType, MergeStatus, StewardFocus, StewardTrigger,
    TaskOrchestrator,
};
use stoneforge_core::store::Store;

const ACTOR: &str = "el-s7ew4rd";

/// Merges branches whose name says so; conflicts/fails the rest.
struct ScriptedBackend;

impl MergeBackend for ScriptedBackend {
    fn merge(&self, _task: &Element, orch: &TaskOrchestrator) -> Result<MergeDisposition> {
        let branch = orch.branch.as_deref().unwrap_or_default();
        if branch.contains("conflict") {
            Ok(MergeDisposition::Conflict("overlapping edits".to_owned()))
        } else if branch.contains("broken") {
            Ok(MergeDisposition::Failed("remote unreachable".to_owned()))
        } else {
            Ok(MergeDisposition::Merged)
        }
    }
}

fn seed_closed_task(store: &Store, branch: &str) -> Element {
    let now = Utc::now();
    let id = store
        .mint_id(ElementType::Task, ACTOR, now)
        .expect("mint id");
    let mut task = Element::new(id, ElementType::Task, ACTOR, now).expect("task");
    task.metadata.insert("status".to_owned(), "closed".into());
    let orch = TaskOrchestrator {
        branch: Some(branch.to_owned()),
        merge_status: MergeStatus::Pending,
        ..TaskOrchestrator::default()
    };
    orch.write_to(&mut task).expect("orch");
    store.create(&task).expect("create");
    task
}

fn seed_steward(store: &Store, focus: Option<StewardFocus>) -> Element {
    let now = Utc::now();
    let id = store
        .mint_id(ElementType::Entity, ACTOR, now)
        .expect("mint id");
    let mut agent = Element::new(id, ElementType::Entity, ACTOR, now).expect("agent");
    AgentConfig {
        role: AgentRole::Steward,
        worker_mode: None,
        steward_focus: focus,
        triggers: vec![StewardTrigger::Event {
            event: "task.closed".to_owned(),
        }],
        channel: None,
        executables: vec!["claude".to_owned()],
    }
    .write_to(&mut agent)
    .expect("config");
    store.create(&agent).expect("create");
    agent
}

fn scheduler_over(store: &Arc<Store>) -> StewardScheduler {
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(store),
        Arc::new(ProcessLauncher::new()),
        ACTOR,
    ));
    let merge = Arc::new(MergeStewardService::new(
        Arc::clone(store),
        Arc::new(ScriptedBackend),
        ACTOR,
    ));
    let executor = Arc::new(BuiltinExecutor::new(
        merge,
        sessions,
        StartOptions {
            executable: "claude".to_owned(),
            working_directory: PathBuf::from("."),
            prompt: None,
            extra_args: Vec::new(),
        },
    ));
    StewardScheduler::new(Arc::clone(store), executor)
}

#[tokio::test]
async fn merge_steward_sweeps_pending_branches_and_reports_counts() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let ok_one = seed_closed_task(&store, "agent/mason/el-1-ok");
    let ok_two = seed_closed_task(&store, "agent/mason/el-2-ok");
    let broken = seed_closed_task(&store, "agent/mason/el-3-broken");
    // Open tasks never enter the sweep.
    let now = Utc::now();
    let open_id = store
        .mint_id(ElementType::Task, ACTOR, now)
        .expect("mint id");
    let mut open = Element::new(open_id, ElementType::Task, ACTOR, now).expect("task");
    open.metadata.insert("status".to_owned(), "open".into());
    store.create(&open).expect("create");

    let steward = seed_steward(&store, Some(StewardFocus::Merge));
    let scheduler = scheduler_over(&store);

    let record = scheduler.execute_steward(&steward.id, "manual").await;
    assert!(record.success);
    assert_eq!(record.items_processed, Some(3));
    let output = record.output.expect("output");
    assert!(output.contains("2 merged"), "output was: {output}");
    assert!(output.contains("1 failed"), "output was: {output}");
    assert_eq!(scheduler.history(10).await.len(), 1);

    for (id, expected) in [
        (&ok_one.id, MergeStatus::Merged),
        (&ok_two.id, MergeStatus::Merged),
        (&broken.id, MergeStatus::Failed),
    ] {
        let task = store.require(id).expect("task");
        let orch = TaskOrchestrator::from_element(&task).expect("orch");
        assert_eq!(orch.merge_status, expected, "task {id}");
    }
    // Merged tasks carry a merge timestamp; failed ones the failure detail.
    let merged = TaskOrchestrator::from_element(&store.require(&ok_one.id).expect("task"))
        .expect("orch");
    assert!(merged.merged_at.is_some());
    let failed = TaskOrchestrator::from_element(&store.require(&broken.id).expect("task"))
        .expect("orch");
    assert_eq!(failed.last_sync_result.as_deref(), Some("remote unreachable"));
}

#[tokio::test]
async fn unknown_focus_fails_politely_without_destabilizing_peers() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let custom = seed_steward(&store, Some(StewardFocus::Custom));
    let merge = seed_steward(&store, Some(StewardFocus::Merge));
    let scheduler = scheduler_over(&store);

    let record = scheduler.execute_steward(&custom.id, "manual").await;
    assert!(!record.success);
    assert_eq!(record.output.as_deref(), Some("Unknown steward focus"));
    assert!(record.error.is_none());

    // The next steward runs fine and both executions are in history.
    let record = scheduler.execute_steward(&merge.id, "manual").await;
    assert!(record.success);
    assert_eq!(scheduler.history(10).await.len(), 2);
}

#[tokio::test]
async fn event_trigger_drives_the_merge_steward() {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    seed_closed_task(&store, "agent/mason/el-9-ok");
    seed_steward(&store, Some(StewardFocus::Merge));
    let scheduler = scheduler_over(&store);

    let fired = scheduler.handle_event("task.closed").await;
    assert_eq!(fired.len(), 1);
    assert!(fired[0].success);
    assert_eq!(fired[0].items_processed, Some(1));
    assert!(fired[0].trigger.contains("task.closed"));

    assert!(scheduler.handle_event("task.reopened").await.is_empty());
}
