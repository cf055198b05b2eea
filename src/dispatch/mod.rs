//! Dispatch: pick a ready task + agent pair and run it under pool and
//! rate-limit constraints.
//!
//! [`Dispatcher`] issues the atomic assign+notify transaction;
//! [`PoolAccounting`] gates admission; [`RateLimitTracker`] walks the
//! executable fallback chain; [`PredecessorConsultation`] lets new sessions
//! ask the previous holder of a role for advice.

mod assign;
mod consult;
mod dispatcher;
mod names;
mod pool;
mod rate_limit;

pub use assign::{assign_to_agent, AssignOptions, Assignment};
pub use consult::{
    ConsultOptions, ConsultResult, PredecessorConsultation, QueryInfo, QueryStatus, MAX_TIMEOUT,
    MIN_TIMEOUT,
};
pub use dispatcher::{DispatchOptions, DispatchResult, Dispatcher, DISPATCH_NOTIFICATION_TAG};
pub use names::{generate_branch_name, generate_worktree_path, slugify, MAX_SLUG_LEN};
pub use pool::{PoolAccounting, PoolStatus, SpawnCheck, SpawnRequest};
pub use rate_limit::{LimitEntry, RateLimitTracker, RATE_LIMITS_KEY};

use stoneforge_core::error::Result;
use stoneforge_core::model::{Element, ElementId};
use stoneforge_core::store::Store;
use stoneforge_core::graph::{self, ReadyFilter};

/// Rank contending ready tasks for one slot: agent-type priority first,
/// then task priority, then age.
#[must_use]
pub fn rank_contenders(mut candidates: Vec<(Element, SpawnCheck)>) -> Vec<(Element, SpawnCheck)> {
    candidates.sort_by(|(task_a, check_a), (task_b, check_b)| {
        check_b
            .priority
            .unwrap_or(i64::MIN)
            .cmp(&check_a.priority.unwrap_or(i64::MIN))
            .then_with(|| task_b.priority().cmp(&task_a.priority()))
            .then_with(|| task_a.created_at.cmp(&task_b.created_at))
    });
    candidates
}

/// The next dispatchable task for an agent shape, if pool admission and the
/// ready queue both allow one.
///
/// # Errors
/// Store failures from the ready query.
pub fn next_ready_task(
    store: &Store,
    accounting: &PoolAccounting,
    request: &SpawnRequest,
    assigned_to: Option<&ElementId>,
) -> Result<Option<(Element, SpawnCheck)>> {
    let check = accounting.spawn_check(request);
    if !check.can_spawn {
        return Ok(None);
    }
    let ready = graph::ready_tasks(
        store,
        1,
        &ReadyFilter {
            tag: None,
            assigned_to: assigned_to.cloned(),
        },
    )?;
    Ok(ready.into_iter().next().map(|task| (task, check)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stoneforge_core::model::ElementType;

    fn task(priority: i64, created_offset_secs: i64) -> Element {
        let created = Utc::now() - chrono::Duration::seconds(created_offset_secs);
        let mut el = Element::new(
            ElementId::new("el-aaaa01").expect("valid id"),
            ElementType::Task,
            "el-boot01",
            created,
        )
        .expect("valid element");
        el.metadata.insert("priority".to_owned(), priority.into());
        el
    }

    fn check(priority: Option<i64>) -> SpawnCheck {
        SpawnCheck {
            can_spawn: true,
            pool: Some("workers".to_owned()),
            priority,
            reason: None,
        }
    }

    #[test]
    fn contention_ranks_agent_type_priority_before_task_priority() {
        let ranked = rank_contenders(vec![
            (task(9, 0), check(Some(1))),
            (task(1, 0), check(Some(5))),
            (task(5, 60), check(Some(5))),
        ]);
        // Agent-type priority 5 entries first; among them, task priority 5
        // beats 1; the low agent-type priority lands last despite its task
        // priority of 9.
        assert_eq!(ranked[0].0.priority(), 5);
        assert_eq!(ranked[1].0.priority(), 1);
        assert_eq!(ranked[2].0.priority(), 9);
    }
}
