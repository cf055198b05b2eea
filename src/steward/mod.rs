//! Stewards: scheduled agents that reconcile derived state.
//!
//! A steward is an agent whose metadata carries a focus (merge readiness,
//! documentation drift) and a trigger list: cron expressions evaluated in
//! UTC, or named events published on the internal bus. The scheduler
//! isolates failures per execution and keeps a bounded history ring.

mod executors;
mod scheduler;

pub use executors::{
    BuiltinExecutor, ExecutorReport, GitMergeBackend, MergeBackend, MergeDisposition,
    MergeStewardService, MergeSummary, StewardExecutor,
};
pub use scheduler::{StewardScheduler, HISTORY_CAP};

use chrono::{DateTime, Utc};
use serde::Serialize;

use stoneforge_core::model::ElementId;

/// One entry in the scheduler's execution history.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// The steward that ran.
    pub steward_id: ElementId,
    /// What fired it (`cron(…)`, `event(…)`, `manual`).
    pub trigger: String,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Whether the run succeeded.
    pub success: bool,
    /// Failure description, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executor summary, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Items touched, when countable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<u64>,
}
