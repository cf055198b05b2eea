//! Dependency & task engine: the computed `blocked` predicate, ready/backlog
//! queries, and explicit cycle detection.
//!
//! `blocked` is never stored. A task is blocked iff at least one active
//! blocking edge names it as `blockedId`, where active means the blocker is
//! neither closed nor tombstoned. Cycle detection is explicit: insertion
//! never validates — callers that want referential integrity run
//! [`detect_cycle`] before commit.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::error::{Result, StoneforgeError};
use crate::model::{Dependency, DependencyType, Element, ElementId, ElementType, TaskStatus};
use crate::store::{ElementFilter, Store};

const BLOCKING_TYPES: &[DependencyType] = &[
    DependencyType::Blocks,
    DependencyType::Awaits,
    DependencyType::ParentChild,
];

/// Whether a blocking edge from `blocked` to this blocker is active.
fn blocker_is_active(blocker: Option<&Element>) -> bool {
    blocker.is_some_and(|el| !el.is_deleted() && !el.is_closed())
}

/// Whether the task has at least one active blocking edge.
///
/// # Errors
/// `Storage` failures.
pub fn is_blocked(store: &Store, task: &ElementId) -> Result<bool> {
    for edge in store.get_dependencies(task, Some(BLOCKING_TYPES))? {
        let blocker = store.get(&edge.blocker_id)?;
        if blocker_is_active(blocker.as_ref()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Filter for ready/backlog queries.
#[derive(Clone, Debug, Default)]
pub struct ReadyFilter {
    /// Restrict to tasks carrying this tag.
    pub tag: Option<String>,
    /// Restrict to tasks assigned to this agent (via the orchestrator
    /// record); `None` imposes no assignment constraint.
    pub assigned_to: Option<ElementId>,
}

/// Tasks that are open, not deferred, and not blocked, sorted by
/// `(priority desc, complexity asc, createdAt asc)`.
///
/// # Errors
/// `Storage` failures.
pub fn ready_tasks(store: &Store, limit: usize, filter: &ReadyFilter) -> Result<Vec<Element>> {
    let now = Utc::now();
    let tasks = store.list(&ElementFilter {
        element_type: Some(ElementType::Task),
        tag: filter.tag.clone(),
        ..ElementFilter::default()
    })?;

    let mut ready = Vec::new();
    for task in tasks {
        if task.task_status() != Some(TaskStatus::Open) || task.is_deferred(now) {
            continue;
        }
        if let Some(agent) = &filter.assigned_to {
            let orch = crate::model::TaskOrchestrator::from_element(&task)?;
            if orch.assigned_agent.as_ref() != Some(agent) {
                continue;
            }
        }
        if is_blocked(store, &task.id)? {
            continue;
        }
        ready.push(task);
    }

    ready.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.complexity().cmp(&b.complexity()))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    ready.truncate(limit);
    Ok(ready)
}

/// Open tasks that are blocked or deferred — work that exists but cannot
/// dispatch yet.
///
/// # Errors
/// `Storage` failures.
pub fn backlog_tasks(store: &Store, limit: usize) -> Result<Vec<Element>> {
    let now = Utc::now();
    let tasks = store.list(&ElementFilter {
        element_type: Some(ElementType::Task),
        ..ElementFilter::default()
    })?;

    let mut backlog = Vec::new();
    for task in tasks {
        let open = matches!(
            task.task_status(),
            Some(TaskStatus::Open | TaskStatus::Deferred)
        );
        if !open {
            continue;
        }
        if task.is_deferred(now) || is_blocked(store, &task.id)? {
            backlog.push(task);
        }
    }
    backlog.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    backlog.truncate(limit);
    Ok(backlog)
}

/// DFS over the blocking subgraph: would `candidate` close a cycle?
///
/// Returns the cycle as a path starting and ending at
/// `candidate.blocked_id`, or `None`. The candidate edge itself need not be
/// inserted yet; existing edges are read from the store.
///
/// # Errors
/// `Storage` failures.
pub fn detect_cycle(store: &Store, candidate: &Dependency) -> Result<Option<Vec<ElementId>>> {
    if !candidate.dep_type.is_blocking() {
        return Ok(None);
    }

    // Walk blocker-ward from the candidate's blocker; reaching the
    // candidate's blocked side closes the loop.
    let target = &candidate.blocked_id;
    let mut visited: HashSet<ElementId> = HashSet::new();
    let mut parents: HashMap<ElementId, ElementId> = HashMap::new();
    let mut stack = vec![candidate.blocker_id.clone()];
    visited.insert(candidate.blocker_id.clone());

    while let Some(current) = stack.pop() {
        if current == *target {
            // Reconstruct target -> ... -> blocker, then close the loop.
            let mut path = vec![target.clone()];
            let mut cursor = current;
            while let Some(parent) = parents.get(&cursor) {
                path.push(parent.clone());
                cursor = parent.clone();
            }
            path.reverse();
            let mut cycle = vec![target.clone()];
            cycle.extend(path);
            return Ok(Some(cycle));
        }
        for edge in store.get_dependencies(&current, Some(BLOCKING_TYPES))? {
            if visited.insert(edge.blocker_id.clone()) {
                parents.insert(edge.blocker_id.clone(), current.clone());
                stack.push(edge.blocker_id);
            }
        }
    }
    Ok(None)
}

/// Insert an edge after an explicit cycle check.
///
/// # Errors
/// [`StoneforgeError::CycleDetected`] with the cycle path, plus everything
/// [`Store::add_dependency`] can fail with.
pub fn add_dependency_checked(store: &Store, dep: &Dependency) -> Result<()> {
    if let Some(path) = detect_cycle(store, dep)? {
        return Err(StoneforgeError::CycleDetected {
            path: path.into_iter().map(|id| id.to_string()).collect(),
        });
    }
    store.add_dependency(dep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ElementPatch;
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().expect("store")
    }

    fn task_with(store: &Store, status: &str, priority: i64, complexity: i64) -> Element {
        let now = Utc::now();
        let id = store
            .mint_id(ElementType::Task, "el-boot01", now)
            .expect("minted id");
        let mut el = Element::new(id, ElementType::Task, "el-boot01", now).expect("valid");
        el.metadata.insert("status".to_owned(), status.into());
        el.metadata.insert("priority".to_owned(), priority.into());
        el.metadata
            .insert("complexity".to_owned(), complexity.into());
        store.create(&el).expect("create");
        el
    }

    fn blocks(store: &Store, blocked: &Element, blocker: &Element) -> Dependency {
        let dep = Dependency::new(
            blocked.id.clone(),
            blocker.id.clone(),
            DependencyType::Blocks,
            Utc::now(),
        )
        .expect("edge");
        store.add_dependency(&dep).expect("insert");
        dep
    }

    #[test]
    fn blocked_iff_active_blocking_edge() {
        let s = store();
        let t = task_with(&s, "open", 0, 0);
        let blocker = task_with(&s, "open", 0, 0);
        assert!(!is_blocked(&s, &t.id).expect("blocked"));

        blocks(&s, &t, &blocker);
        assert!(is_blocked(&s, &t.id).expect("blocked"));

        // Closing the blocker unblocks without touching the edge.
        let mut meta = blocker.metadata.clone();
        meta.insert("status".to_owned(), "closed".into());
        s.update(&blocker.id, &ElementPatch::metadata(meta), "el-boot01")
            .expect("close blocker");
        assert!(!is_blocked(&s, &t.id).expect("blocked"));
    }

    #[test]
    fn closed_blocker_never_flips_to_blocked() {
        let s = store();
        let t = task_with(&s, "open", 0, 0);
        let closed = task_with(&s, "closed", 0, 0);
        blocks(&s, &t, &closed);
        assert!(!is_blocked(&s, &t.id).expect("blocked"));
    }

    #[test]
    fn informational_edges_never_block() {
        let s = store();
        let t = task_with(&s, "open", 0, 0);
        let other = task_with(&s, "open", 0, 0);
        let dep = Dependency::new(
            t.id.clone(),
            other.id.clone(),
            DependencyType::RelatesTo,
            Utc::now(),
        )
        .expect("edge");
        s.add_dependency(&dep).expect("insert");
        assert!(!is_blocked(&s, &t.id).expect("blocked"));
    }

    #[test]
    fn ready_ordering_is_priority_then_complexity_then_age() {
        let s = store();
        let low = task_with(&s, "open", 1, 0);
        let high_complex = task_with(&s, "open", 5, 9);
        let high_simple = task_with(&s, "open", 5, 1);
        let _closed = task_with(&s, "closed", 9, 0);

        let ready = ready_tasks(&s, 10, &ReadyFilter::default()).expect("ready");
        let ids: Vec<_> = ready.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![high_simple.id, high_complex.id, low.id]);
    }

    #[test]
    fn deferred_and_blocked_tasks_land_in_backlog() {
        let s = store();
        let mut deferred = task_with(&s, "open", 0, 0);
        let until = Utc::now() + Duration::hours(2);
        let mut meta = deferred.metadata.clone();
        meta.insert("deferredUntil".to_owned(), until.to_rfc3339().into());
        deferred = s
            .update(&deferred.id, &ElementPatch::metadata(meta), "el-boot01")
            .expect("defer");

        let blocked = task_with(&s, "open", 0, 0);
        let blocker = task_with(&s, "open", 0, 0);
        blocks(&s, &blocked, &blocker);

        let ready = ready_tasks(&s, 10, &ReadyFilter::default()).expect("ready");
        assert!(ready.iter().all(|t| t.id == blocker.id));

        let backlog = backlog_tasks(&s, 10).expect("backlog");
        let ids: HashSet<_> = backlog.iter().map(|t| t.id.clone()).collect();
        assert!(ids.contains(&deferred.id));
        assert!(ids.contains(&blocked.id));
    }

    #[test]
    fn two_edge_cycle_yields_path_of_length_three() {
        let s = store();
        let a = task_with(&s, "open", 0, 0);
        let b = task_with(&s, "open", 0, 0);

        // Both inserts succeed — the default path does not validate.
        blocks(&s, &a, &b);
        blocks(&s, &b, &a);

        let candidate = Dependency::new(
            a.id.clone(),
            b.id.clone(),
            DependencyType::Blocks,
            Utc::now(),
        )
        .expect("edge");
        let path = detect_cycle(&s, &candidate)
            .expect("detect")
            .expect("cycle present");
        assert_eq!(path.len(), 3);
        assert_eq!(path.first(), Some(&a.id));
        assert_eq!(path.last(), Some(&a.id));
        assert_eq!(path[1], b.id);
    }

    #[test]
    fn checked_insert_rejects_cycles() {
        let s = store();
        let a = task_with(&s, "open", 0, 0);
        let b = task_with(&s, "open", 0, 0);
        blocks(&s, &a, &b);

        let closing = Dependency::new(
            b.id.clone(),
            a.id.clone(),
            DependencyType::Blocks,
            Utc::now(),
        )
        .expect("edge");
        assert!(matches!(
            add_dependency_checked(&s, &closing),
            Err(StoneforgeError::CycleDetected { .. })
        ));

        // Informational edges may close loops freely.
        let informational = Dependency::new(
            b.id.clone(),
            a.id.clone(),
            DependencyType::References,
            Utc::now(),
        )
        .expect("edge");
        add_dependency_checked(&s, &informational).expect("insert");
    }
}
