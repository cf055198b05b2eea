//! End-to-end dispatch scenarios: ready-queue selection, the atomic
//! assign+notify transaction, and explicit cycle detection.

use std::sync::Arc;

use chrono::Utc;

use stoneforge::dispatch::{
    DispatchOptions, Dispatcher, PoolAccounting, SpawnRequest,
};
use stoneforge_core::graph;
use stoneforge_core::model::{
    AgentConfig, AgentRole, Dependency, DependencyType, Element, ElementId, ElementType, Pool,
    PoolAgentType, TaskOrchestrator, WorkerMode,
};
use stoneforge_core::store::Store;
use stoneforge_core::StoneforgeError;

const ACTOR: &str = "el-d1r3c7";

fn seed_channel(store: &Store) -> Element {
    let now = Utc::now();
    let id = store
        .mint_id(ElementType::Channel, ACTOR, now)
        .expect("mint channel id");
    let channel = Element::new(id, ElementType::Channel, ACTOR, now).expect("channel");
    store.create(&channel).expect("create channel");
    channel
}

fn seed_agent(store: &Store, name: &str, channel: Option<&ElementId>) -> Element {
    let now = Utc::now();
    let id = store
        .mint_id(ElementType::Entity, ACTOR, now)
        .expect("mint agent id");
    let mut agent = Element::new(id, ElementType::Entity, ACTOR, now).expect("agent");
    agent.metadata.insert("name".to_owned(), name.into());
    AgentConfig {
        role: AgentRole::Worker,
        worker_mode: Some(WorkerMode::Ephemeral),
        steward_focus: None,
        triggers: Vec::new(),
        channel: channel.cloned(),
        executables: vec!["claude".to_owned()],
    }
    .write_to(&mut agent)
    .expect("agent config");
    store.create(&agent).expect("create agent");
    agent
}

fn seed_task(store: &Store, title: &str, priority: i64) -> Element {
    let now = Utc::now();
    let id = store
        .mint_id(ElementType::Task, ACTOR, now)
        .expect("mint task id");
    let mut task = Element::new(id, ElementType::Task, ACTOR, now).expect("task");
    task.metadata.insert("status".to_owned(), "open".into());
    task.metadata.insert("title".to_owned(), title.into());
    task.metadata.insert("priority".to_owned(), priority.into());
    store.create(&task).expect("create task");
    task
}

#[test]
fn dispatch_happy_path_assigns_and_posts_notification() {
    let store = Store::open_in_memory().expect("store");
    let channel = seed_channel(&store);
    let agent = seed_agent(&store, "mason", Some(&channel.id));
    let task = seed_task(&store, "Wire the dispatcher", 3);

    let dispatcher = Dispatcher::new(&store, ACTOR);
    let result = dispatcher
        .dispatch(
            &task.id,
            &agent.id,
            &DispatchOptions {
                priority: Some(3),
                ..DispatchOptions::default()
            },
        )
        .expect("dispatch");

    assert!(result.is_new_assignment);
    let orch = TaskOrchestrator::from_element(&result.task).expect("orch");
    assert_eq!(orch.assigned_agent.as_ref(), Some(&agent.id));
    assert!(orch.branch.expect("branch").starts_with("agent/mason/"));

    let meta = &result.notification.metadata;
    assert_eq!(meta.get("type"), Some(&"task-assignment".into()));
    assert_eq!(meta.get("taskId"), Some(&task.id.to_string().into()));
    assert_eq!(meta.get("priority"), Some(&3.into()));
    assert_eq!(meta.get("suppressInbox"), Some(&true.into()));

    // Dispatching again to the same agent is not a new assignment.
    let again = dispatcher
        .dispatch(&task.id, &agent.id, &DispatchOptions::default())
        .expect("re-dispatch");
    assert!(!again.is_new_assignment);
}

#[test]
fn ready_queue_feeds_dispatch_under_pool_admission() {
    let store = Store::open_in_memory().expect("store");
    let channel = seed_channel(&store);
    let _agent = seed_agent(&store, "mason", Some(&channel.id));
    let urgent = seed_task(&store, "Urgent fix", 9);
    let routine = seed_task(&store, "Routine chore", 1);

    let accounting = Arc::new(PoolAccounting::new(vec![Pool {
        name: "workers".to_owned(),
        max_size: 1,
        agent_types: vec![PoolAgentType {
            role: AgentRole::Worker,
            worker_mode: Some(WorkerMode::Ephemeral),
            steward_focus: None,
            priority: 10,
            max_slots: None,
        }],
        enabled: true,
    }]));
    let request = SpawnRequest {
        role: AgentRole::Worker,
        worker_mode: Some(WorkerMode::Ephemeral),
        steward_focus: None,
    };

    // Highest-priority ready task comes out first.
    let (task, check) = stoneforge::dispatch::next_ready_task(&store, &accounting, &request, None)
        .expect("query")
        .expect("a task is ready");
    assert_eq!(task.id, urgent.id);
    assert!(check.can_spawn);

    // With the single slot taken, admission closes the valve entirely.
    accounting
        .register("sess-1", &request)
        .expect("slot available");
    assert!(stoneforge::dispatch::next_ready_task(&store, &accounting, &request, None)
        .expect("query")
        .is_none());

    // Releasing the slot re-opens it for the remaining task.
    accounting.release("sess-1");
    store
        .soft_delete(&urgent.id, ACTOR)
        .expect("retire urgent task");
    let (task, _) = stoneforge::dispatch::next_ready_task(&store, &accounting, &request, None)
        .expect("query")
        .expect("routine task is ready");
    assert_eq!(task.id, routine.id);
}

#[test]
fn cycle_detection_is_explicit_and_returns_the_path() {
    let store = Store::open_in_memory().expect("store");
    let a = seed_task(&store, "A", 0);
    let b = seed_task(&store, "B", 0);

    // The default insertion path never validates cycles: both edges land.
    let ab = Dependency::new(a.id.clone(), b.id.clone(), DependencyType::Blocks, Utc::now())
        .expect("edge");
    let ba = Dependency::new(b.id.clone(), a.id.clone(), DependencyType::Blocks, Utc::now())
        .expect("edge");
    store.add_dependency(&ab).expect("a blocked by b");
    store.add_dependency(&ba).expect("b blocked by a");

    let path = graph::detect_cycle(&store, &ab)
        .expect("detect")
        .expect("cycle exists");
    assert_eq!(path.len(), 3);
    assert_eq!(path[0], a.id);
    assert_eq!(path[2], a.id);

    // The checked path surfaces it as a typed conflict.
    let err = graph::add_dependency_checked(
        &store,
        &Dependency::new(a.id.clone(), b.id.clone(), DependencyType::Awaits, Utc::now())
            .expect("edge"),
    )
    .expect_err("cycle refused");
    assert!(matches!(err, StoneforgeError::CycleDetected { .. }));

    // Both tasks are mutually blocked, so neither is ready.
    let ready = graph::ready_tasks(&store, 10, &graph::ReadyFilter::default()).expect("ready");
    assert!(ready.is_empty());
}
