//! Pool admission: live session accounting against configured caps.
//!
//! Admission decisions are taken under one coarse pool-wide lock — the
//! counts involved are tiny and the alternative (per-type CAS) buys nothing
//! at workspace scale.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use stoneforge_core::model::{AgentRole, Pool, StewardFocus, WorkerMode};

/// The agent shape asking for a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Role of the agent to spawn.
    pub role: AgentRole,
    /// Worker mode, if a worker.
    pub worker_mode: Option<WorkerMode>,
    /// Steward focus, if a steward.
    pub steward_focus: Option<StewardFocus>,
}

/// The admission decision.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnCheck {
    /// Whether a slot is available.
    pub can_spawn: bool,
    /// The governing pool, if one accepts the request.
    pub pool: Option<String>,
    /// Contention priority of the matched agent type.
    pub priority: Option<i64>,
    /// Why admission was denied, when it was.
    pub reason: Option<String>,
}

/// A registered live session, for accounting.
#[derive(Clone, Debug)]
struct ActiveSlot {
    pool: String,
    type_key: String,
}

/// Snapshot of one pool's occupancy.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Live sessions charged to the pool.
    pub active: usize,
    /// Configured cap.
    pub max_size: u32,
    /// Live sessions per agent-type slot key.
    pub by_type: HashMap<String, usize>,
}

/// Session accounting over the configured pools.
pub struct PoolAccounting {
    pools: Vec<Pool>,
    active: Mutex<HashMap<String, ActiveSlot>>,
}

impl PoolAccounting {
    /// Build accounting over validated pools.
    #[must_use]
    pub fn new(pools: Vec<Pool>) -> Self {
        Self {
            pools,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSlot>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admission check: identify the governing pool (first enabled pool
    /// whose agent types accept the request) and compare live counts
    /// against the pool and per-type caps.
    #[must_use]
    pub fn spawn_check(&self, request: &SpawnRequest) -> SpawnCheck {
        let governing = self.pools.iter().find_map(|pool| {
            if !pool.enabled {
                return None;
            }
            pool.matching_type(request.role, request.worker_mode, request.steward_focus)
                .map(|agent_type| (pool, agent_type))
        });

        let Some((pool, agent_type)) = governing else {
            return SpawnCheck {
                can_spawn: false,
                pool: None,
                priority: None,
                reason: Some("no enabled pool accepts this agent type".to_owned()),
            };
        };

        let active = self.lock();
        let pool_count = active.values().filter(|s| s.pool == pool.name).count();
        if pool_count >= usize::try_from(pool.max_size).unwrap_or(usize::MAX) {
            return SpawnCheck {
                can_spawn: false,
                pool: Some(pool.name.clone()),
                priority: Some(agent_type.priority),
                reason: Some(format!(
                    "pool '{}' is full ({pool_count}/{})",
                    pool.name, pool.max_size
                )),
            };
        }

        let type_key = agent_type.slot_key();
        if let Some(max_slots) = agent_type.max_slots {
            let type_count = active
                .values()
                .filter(|s| s.pool == pool.name && s.type_key == type_key)
                .count();
            if type_count >= usize::try_from(max_slots).unwrap_or(usize::MAX) {
                return SpawnCheck {
                    can_spawn: false,
                    pool: Some(pool.name.clone()),
                    priority: Some(agent_type.priority),
                    reason: Some(format!(
                        "agent type '{type_key}' is full ({type_count}/{max_slots})"
                    )),
                };
            }
        }

        SpawnCheck {
            can_spawn: true,
            pool: Some(pool.name.clone()),
            priority: Some(agent_type.priority),
            reason: None,
        }
    }

    /// Charge a slot for a spawned session. Fails closed if no pool admits
    /// the request at this instant (check-then-register races resolve to a
    /// denial, never an overcommit).
    ///
    /// # Errors
    /// The denial reason when the pool or agent type is full, or when no
    /// enabled pool accepts the request.
    pub fn register(&self, session_id: &str, request: &SpawnRequest) -> Result<(), String> {
        let governing = self.pools.iter().find_map(|pool| {
            if !pool.enabled {
                return None;
            }
            pool.matching_type(request.role, request.worker_mode, request.steward_focus)
                .map(|agent_type| (pool, agent_type))
        });
        let Some((pool, agent_type)) = governing else {
            return Err("no enabled pool accepts this agent type".to_owned());
        };

        let mut active = self.lock();
        let pool_count = active.values().filter(|s| s.pool == pool.name).count();
        if pool_count >= usize::try_from(pool.max_size).unwrap_or(usize::MAX) {
            return Err(format!(
                "pool '{}' is full ({pool_count}/{})",
                pool.name, pool.max_size
            ));
        }
        let type_key = agent_type.slot_key();
        if let Some(max_slots) = agent_type.max_slots {
            let type_count = active
                .values()
                .filter(|s| s.pool == pool.name && s.type_key == type_key)
                .count();
            if type_count >= usize::try_from(max_slots).unwrap_or(usize::MAX) {
                return Err(format!("agent type '{type_key}' is full"));
            }
        }
        active.insert(
            session_id.to_owned(),
            ActiveSlot {
                pool: pool.name.clone(),
                type_key,
            },
        );
        Ok(())
    }

    /// Release a session's slot. Unknown ids are ignored (release races
    /// with registration teardown).
    pub fn release(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    /// Occupancy snapshot of every configured pool.
    #[must_use]
    pub fn status(&self) -> Vec<PoolStatus> {
        let active = self.lock();
        self.pools
            .iter()
            .map(|pool| {
                let mut by_type: HashMap<String, usize> = HashMap::new();
                let mut count = 0usize;
                for slot in active.values().filter(|s| s.pool == pool.name) {
                    count += 1;
                    *by_type.entry(slot.type_key.clone()).or_default() += 1;
                }
                PoolStatus {
                    name: pool.name.clone(),
                    active: count,
                    max_size: pool.max_size,
                    by_type,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoneforge_core::model::PoolAgentType;

    fn pools() -> Vec<Pool> {
        vec![
            Pool {
                name: "disabled".to_owned(),
                max_size: 100,
                agent_types: vec![PoolAgentType {
                    role: AgentRole::Worker,
                    worker_mode: None,
                    steward_focus: None,
                    priority: 99,
                    max_slots: None,
                }],
                enabled: false,
            },
            Pool {
                name: "workers".to_owned(),
                max_size: 2,
                agent_types: vec![
                    PoolAgentType {
                        role: AgentRole::Worker,
                        worker_mode: Some(WorkerMode::Ephemeral),
                        steward_focus: None,
                        priority: 10,
                        max_slots: Some(1),
                    },
                    PoolAgentType {
                        role: AgentRole::Worker,
                        worker_mode: Some(WorkerMode::Persistent),
                        steward_focus: None,
                        priority: 5,
                        max_slots: None,
                    },
                ],
                enabled: true,
            },
        ]
    }

    fn ephemeral() -> SpawnRequest {
        SpawnRequest {
            role: AgentRole::Worker,
            worker_mode: Some(WorkerMode::Ephemeral),
            steward_focus: None,
        }
    }

    fn persistent() -> SpawnRequest {
        SpawnRequest {
            role: AgentRole::Worker,
            worker_mode: Some(WorkerMode::Persistent),
            steward_focus: None,
        }
    }

    #[test]
    fn disabled_pools_never_govern() {
        let accounting = PoolAccounting::new(pools());
        let check = accounting.spawn_check(&ephemeral());
        assert!(check.can_spawn);
        assert_eq!(check.pool.as_deref(), Some("workers"));
        assert_eq!(check.priority, Some(10));
    }

    #[test]
    fn admission_stops_at_max_size() {
        let accounting = PoolAccounting::new(pools());
        accounting.register("s1", &persistent()).expect("s1");
        accounting.register("s2", &persistent()).expect("s2");

        let check = accounting.spawn_check(&persistent());
        assert!(!check.can_spawn);
        assert!(check.reason.expect("reason").contains("full"));

        // Releasing frees the slot again.
        accounting.release("s1");
        assert!(accounting.spawn_check(&persistent()).can_spawn);
    }

    #[test]
    fn per_type_slots_cap_below_pool_size() {
        let accounting = PoolAccounting::new(pools());
        accounting.register("s1", &ephemeral()).expect("s1");

        // Pool has room (1/2) but the ephemeral type is capped at 1.
        let check = accounting.spawn_check(&ephemeral());
        assert!(!check.can_spawn);
        // A different type still fits.
        assert!(accounting.spawn_check(&persistent()).can_spawn);
    }

    #[test]
    fn unmatched_requests_are_denied_with_reason() {
        let accounting = PoolAccounting::new(pools());
        let check = accounting.spawn_check(&SpawnRequest {
            role: AgentRole::Steward,
            worker_mode: None,
            steward_focus: Some(StewardFocus::Merge),
        });
        assert!(!check.can_spawn);
        assert!(check.pool.is_none());
    }

    #[test]
    fn status_reports_occupancy_by_type() {
        let accounting = PoolAccounting::new(pools());
        accounting.register("s1", &ephemeral()).expect("s1");
        accounting.register("s2", &persistent()).expect("s2");

        let status = accounting.status();
        let workers = status
            .iter()
            .find(|p| p.name == "workers")
            .expect("workers pool");
        assert_eq!(workers.active, 2);
        assert_eq!(workers.max_size, 2);
        assert_eq!(workers.by_type.len(), 2);
    }
}
