//! Task assignment: bind a task to an agent with deterministic branch and
//! worktree resolution.

use chrono::Utc;

use stoneforge_core::error::Result;
use stoneforge_core::model::{Element, ElementId, HandoffRecord, TaskOrchestrator, TaskStatus};
use stoneforge_core::store::{ElementPatch, StoreTx};

use crate::dispatch::names::{generate_branch_name, generate_worktree_path};

/// Optional overrides for [`assign_to_agent`].
#[derive(Clone, Debug, Default)]
pub struct AssignOptions {
    /// Branch to work on; derived from the worker name and task slug when
    /// omitted.
    pub branch: Option<String>,
    /// Worktree path; derived when omitted.
    pub worktree: Option<String>,
    /// Session taking ownership, if one is already running.
    pub session_id: Option<String>,
    /// Stamp `startedAt` and move the task to `in_progress`.
    pub mark_as_started: bool,
}

/// The result of an assignment.
#[derive(Clone, Debug)]
pub struct Assignment {
    /// The task after the orchestrator update.
    pub task: Element,
    /// Whether the assignee changed (first assignment or handoff).
    pub is_new_assignment: bool,
}

/// A human-friendly name for branch/worktree derivation: the element's
/// `name` metadata, falling back to its id.
fn display_name(el: &Element) -> String {
    el.metadata
        .get("name")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| el.id.to_string(), ToOwned::to_owned)
}

/// The task's `title` metadata, falling back to its id.
fn task_title(task: &Element) -> String {
    task.metadata
        .get("title")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| task.id.to_string(), ToOwned::to_owned)
}

/// Assign `task` to `agent` inside the caller's transaction.
///
/// Resolves branch/worktree deterministically when not provided, records a
/// handoff when the assignee changes, and (optionally) marks the task
/// started.
///
/// # Errors
/// `NotFound` if the task or agent is missing, plus store update failures.
pub fn assign_to_agent(
    tx: &StoreTx<'_>,
    task_id: &ElementId,
    agent_id: &ElementId,
    actor: &str,
    opts: &AssignOptions,
) -> Result<Assignment> {
    let task = tx.require(task_id)?;
    let agent = tx.require(agent_id)?;
    let now = Utc::now();

    let mut orch = TaskOrchestrator::from_element(&task)?;
    let previous = orch.assigned_agent.clone();
    let is_new_assignment = previous.as_ref() != Some(agent_id);

    if is_new_assignment {
        if let Some(from_agent) = previous {
            orch.handoff_history.push(HandoffRecord {
                from_agent,
                to_agent: agent_id.clone(),
                at: now,
                reason: None,
            });
        }
        orch.assigned_agent = Some(agent_id.clone());
    }

    let worker_name = display_name(&agent);
    let title = task_title(&task);
    orch.branch = opts
        .branch
        .clone()
        .or(orch.branch)
        .or_else(|| Some(generate_branch_name(&worker_name, task_id, &title)));
    orch.worktree = opts
        .worktree
        .clone()
        .or(orch.worktree)
        .or_else(|| Some(generate_worktree_path(&worker_name, &title)));
    if let Some(session_id) = &opts.session_id {
        orch.session_id = Some(session_id.clone());
    }

    let mut metadata = task.metadata.clone();
    if opts.mark_as_started {
        if orch.started_at.is_none() {
            orch.started_at = Some(now);
        }
        metadata.insert(
            "status".to_owned(),
            TaskStatus::InProgress.as_str().into(),
        );
    }

    // Write the record through a scratch element so serialization reuses
    // one code path.
    let mut scratch = task.clone();
    scratch.metadata = metadata;
    orch.write_to(&mut scratch)?;

    let updated = tx.update(task_id, &ElementPatch::metadata(scratch.metadata), actor)?;
    Ok(Assignment {
        task: updated,
        is_new_assignment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoneforge_core::model::ElementType;
    use stoneforge_core::store::{Isolation, Store};

    fn seed(store: &Store, element_type: ElementType, name: Option<&str>) -> Element {
        let now = Utc::now();
        let id = store
            .mint_id(element_type, "el-boot01", now)
            .expect("minted id");
        let mut el = Element::new(id, element_type, "el-boot01", now).expect("valid");
        if let Some(name) = name {
            el.metadata.insert("name".to_owned(), name.into());
        }
        if element_type == ElementType::Task {
            el.metadata.insert("status".to_owned(), "open".into());
            el.metadata
                .insert("title".to_owned(), "Fix The Parser".into());
        }
        store.create(&el).expect("create");
        el
    }

    fn assign(
        store: &Store,
        task: &Element,
        agent: &Element,
        opts: &AssignOptions,
    ) -> Assignment {
        store
            .transaction(Isolation::Immediate, |tx| {
                assign_to_agent(tx, &task.id, &agent.id, "el-boot01", opts)
            })
            .expect("assign")
    }

    #[test]
    fn first_assignment_resolves_branch_and_worktree() {
        let store = Store::open_in_memory().expect("store");
        let task = seed(&store, ElementType::Task, None);
        let agent = seed(&store, ElementType::Entity, Some("Mason"));

        let result = assign(&store, &task, &agent, &AssignOptions::default());
        assert!(result.is_new_assignment);

        let orch = TaskOrchestrator::from_element(&result.task).expect("orch");
        assert_eq!(orch.assigned_agent, Some(agent.id.clone()));
        assert_eq!(
            orch.branch.as_deref(),
            Some(format!("agent/mason/{}-fix-the-parser", task.id).as_str())
        );
        assert_eq!(
            orch.worktree.as_deref(),
            Some(".stoneforge/.worktrees/mason-fix-the-parser")
        );
        assert!(orch.handoff_history.is_empty());
        assert!(orch.started_at.is_none());
    }

    #[test]
    fn reassignment_records_a_handoff() {
        let store = Store::open_in_memory().expect("store");
        let task = seed(&store, ElementType::Task, None);
        let mason = seed(&store, ElementType::Entity, Some("mason"));
        let quarry = seed(&store, ElementType::Entity, Some("quarry"));

        assign(&store, &task, &mason, &AssignOptions::default());
        let again = assign(&store, &task, &mason, &AssignOptions::default());
        assert!(!again.is_new_assignment);

        let handed = assign(&store, &task, &quarry, &AssignOptions::default());
        assert!(handed.is_new_assignment);
        let orch = TaskOrchestrator::from_element(&handed.task).expect("orch");
        assert_eq!(orch.assigned_agent, Some(quarry.id.clone()));
        assert_eq!(orch.handoff_history.len(), 1);
        assert_eq!(orch.handoff_history[0].from_agent, mason.id);
    }

    #[test]
    fn mark_as_started_stamps_and_transitions() {
        let store = Store::open_in_memory().expect("store");
        let task = seed(&store, ElementType::Task, None);
        let agent = seed(&store, ElementType::Entity, Some("mason"));

        let result = assign(
            &store,
            &task,
            &agent,
            &AssignOptions {
                mark_as_started: true,
                session_id: Some("sess-01".to_owned()),
                ..AssignOptions::default()
            },
        );
        let orch = TaskOrchestrator::from_element(&result.task).expect("orch");
        assert!(orch.started_at.is_some());
        assert_eq!(orch.session_id.as_deref(), Some("sess-01"));
        assert_eq!(result.task.task_status(), Some(TaskStatus::InProgress));
    }

    #[test]
    fn explicit_branch_wins_over_derivation() {
        let store = Store::open_in_memory().expect("store");
        let task = seed(&store, ElementType::Task, None);
        let agent = seed(&store, ElementType::Entity, Some("mason"));

        let result = assign(
            &store,
            &task,
            &agent,
            &AssignOptions {
                branch: Some("hotfix/custom".to_owned()),
                ..AssignOptions::default()
            },
        );
        let orch = TaskOrchestrator::from_element(&result.task).expect("orch");
        assert_eq!(orch.branch.as_deref(), Some("hotfix/custom"));
    }
}
