//! Domain model: elements, dependencies, agents, pools, and the task
//! orchestrator sub-record.
//!
//! Every first-class entity is an [`Element`] discriminated by
//! [`ElementType`]; richer records (agents, tasks) are typed views over the
//! element's metadata mapping. The dependency graph is stored externally as
//! [`Dependency`] edges — elements never embed child/parent pointers.

mod agent;
mod dependency;
mod element;
mod pool;
mod task;

pub use agent::{AgentConfig, AgentRole, StewardFocus, StewardTrigger, WorkerMode};
pub use dependency::{Dependency, DependencyType};
pub use element::{
    Element, ElementId, ElementType, MAX_METADATA_BYTES, MAX_TAGS, MAX_TAG_LEN,
    RESERVED_METADATA_PREFIX,
};
pub use pool::{Pool, PoolAgentType};
pub use task::{
    HandoffRecord, MergeStatus, SessionHistoryEntry, TaskOrchestrator, TaskStatus,
    SESSION_HISTORY_CAP,
};
