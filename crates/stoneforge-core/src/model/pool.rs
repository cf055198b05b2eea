//! Pools — named concurrency caps over agent sessions.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoneforgeError};
use crate::model::{AgentRole, StewardFocus, WorkerMode};

/// Largest permitted pool size.
pub const MAX_POOL_SIZE: u32 = 1000;

/// One admissible agent shape inside a pool, with its own slot cap and
/// contention priority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAgentType {
    /// Role this entry admits.
    pub role: AgentRole,
    /// Required worker mode, if the role is worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_mode: Option<WorkerMode>,
    /// Required steward focus, if the role is steward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steward_focus: Option<StewardFocus>,
    /// Contention rank: higher wins when ready tasks compete for one slot.
    pub priority: i64,
    /// Per-type slot cap; `None` means bounded only by the pool size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slots: Option<u32>,
}

impl PoolAgentType {
    /// Whether a spawn request with the given shape is admissible here.
    #[must_use]
    pub fn accepts(
        &self,
        role: AgentRole,
        worker_mode: Option<WorkerMode>,
        steward_focus: Option<StewardFocus>,
    ) -> bool {
        if self.role != role {
            return false;
        }
        if let Some(required) = self.worker_mode
            && worker_mode != Some(required)
        {
            return false;
        }
        if let Some(required) = self.steward_focus
            && steward_focus != Some(required)
        {
            return false;
        }
        true
    }

    /// Stable key used for per-type slot accounting.
    #[must_use]
    pub fn slot_key(&self) -> String {
        let mode = self
            .worker_mode
            .map_or("*", |m| match m {
                WorkerMode::Ephemeral => "ephemeral",
                WorkerMode::Persistent => "persistent",
            });
        let focus = self.steward_focus.map_or("*".to_owned(), |f| f.to_string());
        format!("{}/{mode}/{focus}", self.role)
    }
}

/// A named concurrency cap governing how many sessions of which agent types
/// may run simultaneously.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Pool name, unique per workspace.
    pub name: String,
    /// Total active-session cap, in `[1, 1000]`.
    pub max_size: u32,
    /// Admissible agent shapes.
    pub agent_types: Vec<PoolAgentType>,
    /// Disabled pools never govern admission.
    pub enabled: bool,
}

impl Pool {
    /// Validate the pool's structural invariants.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidInput`] if the size is out of range
    /// or a per-type cap exceeds the pool size.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoneforgeError::InvalidInput {
                detail: "pool name must not be empty".to_owned(),
            });
        }
        if self.max_size == 0 || self.max_size > MAX_POOL_SIZE {
            return Err(StoneforgeError::InvalidInput {
                detail: format!(
                    "pool '{}' maxSize {} out of range [1, {MAX_POOL_SIZE}]",
                    self.name, self.max_size
                ),
            });
        }
        for at in &self.agent_types {
            if let Some(slots) = at.max_slots
                && slots > self.max_size
            {
                return Err(StoneforgeError::InvalidInput {
                    detail: format!(
                        "pool '{}': maxSlots {slots} for {} exceeds pool maxSize {}",
                        self.name,
                        at.slot_key(),
                        self.max_size
                    ),
                });
            }
        }
        Ok(())
    }

    /// The first agent-type entry that admits the given shape.
    #[must_use]
    pub fn matching_type(
        &self,
        role: AgentRole,
        worker_mode: Option<WorkerMode>,
        steward_focus: Option<StewardFocus>,
    ) -> Option<&PoolAgentType> {
        self.agent_types
            .iter()
            .find(|at| at.accepts(role, worker_mode, steward_focus))
    }
}
