//! Task workflow fields and the nested `orchestrator` sub-record.
//!
//! Tasks are elements whose metadata carries a workflow `status`, scheduling
//! hints (`priority`, `complexity`, `deferredUntil`), and the orchestration
//! record the dispatcher and session manager maintain.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoneforgeError};
use crate::model::{Element, ElementId};

/// Session history entries kept per task (ring buffer).
pub const SESSION_HISTORY_CAP: usize = 50;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Workflow status of a task element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Deferred,
    Closed,
}

impl TaskStatus {
    /// Whether this status counts as closed for blocking and merge purposes.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "deferred" => Ok(Self::Deferred),
            "closed" => Ok(Self::Closed),
            other => Err(StoneforgeError::InvalidInput {
                detail: format!("unknown task status '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MergeStatus
// ---------------------------------------------------------------------------

/// Where a task's branch sits in the merge pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Pending,
    Testing,
    Merging,
    Merged,
    Conflict,
    TestFailed,
    Failed,
    NotApplicable,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Testing => "testing",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Conflict => "conflict",
            Self::TestFailed => "test_failed",
            Self::Failed => "failed",
            Self::NotApplicable => "not_applicable",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator sub-record
// ---------------------------------------------------------------------------

/// One entry in a task's session history ring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryEntry {
    /// Runtime session identifier.
    pub session_id: String,
    /// Agent that owned the session.
    pub agent_id: ElementId,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session ended, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// A handoff from one agent to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    /// The agent the task moved away from.
    pub from_agent: ElementId,
    /// The agent the task moved to.
    pub to_agent: ElementId,
    /// When the handoff happened.
    pub at: DateTime<Utc>,
    /// Free-form reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The nested `orchestrator` sub-record the dispatcher and session manager
/// maintain on each task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrchestrator {
    /// Branch the task's work lands on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Worktree path the session runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    /// Current session, if one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The workflow assignee and session owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<ElementId>,
    /// When work started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When work completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the branch merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    /// Merge pipeline position.
    #[serde(default)]
    pub merge_status: MergeStatus,
    /// Outcome of the last test run against the branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test_result: Option<String>,
    /// Issues the session reported while working.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reported_issues: Vec<String>,
    /// Ring of past sessions, newest last, capped at
    /// [`SESSION_HISTORY_CAP`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_history: Vec<SessionHistoryEntry>,
    /// Past handoffs, newest last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoff_history: Vec<HandoffRecord>,
    /// Result of the last sync touching this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_result: Option<String>,
}

/// Metadata key the orchestrator record lives under.
pub(crate) const ORCHESTRATOR_METADATA_KEY: &str = "orchestrator";

impl TaskOrchestrator {
    /// Push a session history entry, evicting the oldest past the cap.
    pub fn record_session(&mut self, entry: SessionHistoryEntry) {
        self.session_history.push(entry);
        if self.session_history.len() > SESSION_HISTORY_CAP {
            let overflow = self.session_history.len() - SESSION_HISTORY_CAP;
            self.session_history.drain(..overflow);
        }
    }

    /// Read the orchestrator record from a task element; a missing record is
    /// the default record.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidMetadata`] if the stored record
    /// fails to deserialize.
    pub fn from_element(el: &Element) -> Result<Self> {
        match el.metadata.get(ORCHESTRATOR_METADATA_KEY) {
            None => Ok(Self::default()),
            Some(raw) => {
                serde_json::from_value(raw.clone()).map_err(|e| StoneforgeError::InvalidMetadata {
                    reason: format!("orchestrator record on '{}' is malformed: {e}", el.id),
                })
            }
        }
    }

    /// Write the record back into the element's metadata.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidMetadata`] if serialization fails.
    pub fn write_to(&self, el: &mut Element) -> Result<()> {
        let value = serde_json::to_value(self).map_err(|e| StoneforgeError::InvalidMetadata {
            reason: format!("orchestrator record is not serializable: {e}"),
        })?;
        el.metadata
            .insert(ORCHESTRATOR_METADATA_KEY.to_owned(), value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task accessors on Element
// ---------------------------------------------------------------------------

impl Element {
    /// Typed task status, if present and well-formed.
    #[must_use]
    pub fn task_status(&self) -> Option<TaskStatus> {
        self.status().and_then(|s| s.parse().ok())
    }

    /// Scheduling priority; higher dispatches first. Defaults to 0.
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.metadata
            .get("priority")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }

    /// Estimated complexity; lower dispatches first. Defaults to 0.
    #[must_use]
    pub fn complexity(&self) -> i64 {
        self.metadata
            .get("complexity")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }

    /// Whether the task is deferred at `now`.
    #[must_use]
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        if self.task_status() == Some(TaskStatus::Deferred) {
            return true;
        }
        self.metadata
            .get("deferredUntil")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .is_some_and(|until| until > now)
    }
}
