//! Built-in steward executors: merge readiness and documentation drift.
//!
//! The merge steward walks every closed task whose branch is still waiting
//! in the merge pipeline and pushes it through a [`MergeBackend`]; the docs
//! steward just spawns a session for its agent and lets the agent figure
//! out what drifted.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use stoneforge_core::model::{
    AgentConfig, Element, ElementType, MergeStatus, StewardFocus, TaskOrchestrator,
};
use stoneforge_core::store::{ElementFilter, ElementPatch, Store};

use crate::session::{SessionManager, StartOptions};

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// What one executor run produced.
#[derive(Clone, Debug)]
pub struct ExecutorReport {
    /// Whether the run counts as a success.
    pub success: bool,
    /// Human-readable summary.
    pub output: String,
    /// Items the steward touched, when countable.
    pub items_processed: Option<u64>,
}

/// A steward's work function. Errors are caught by the scheduler and
/// recorded — one steward's failure must not destabilize its peers.
#[async_trait]
pub trait StewardExecutor: Send + Sync {
    /// Run the steward once.
    ///
    /// # Errors
    /// Anything the steward's work can fail with; the scheduler records it.
    async fn execute(
        &self,
        agent: &Element,
        config: &AgentConfig,
        trigger: &str,
    ) -> Result<ExecutorReport>;
}

// ---------------------------------------------------------------------------
// Merge backend
// ---------------------------------------------------------------------------

/// How one branch merge went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeDisposition {
    /// Branch landed.
    Merged,
    /// Merge conflicts need a human (or a smarter agent).
    Conflict(String),
    /// The pre-merge test command failed.
    TestFailed(String),
    /// Some other failure.
    Failed(String),
}

/// Merges one task's branch. Implemented over git for production and by
/// fakes in tests.
pub trait MergeBackend: Send + Sync {
    /// Attempt the merge for `task`.
    ///
    /// # Errors
    /// Infrastructure failures (backend unreachable); merge-level outcomes
    /// are values, not errors.
    fn merge(&self, task: &Element, orch: &TaskOrchestrator) -> Result<MergeDisposition>;
}

/// Shells out to `git merge --no-ff` in the repository root, optionally
/// running a test command first.
pub struct GitMergeBackend {
    repo_root: PathBuf,
    test_command: Option<String>,
}

impl GitMergeBackend {
    /// Backend over `repo_root`; `test_command` (a shell line) gates the
    /// merge when present.
    #[must_use]
    pub const fn new(repo_root: PathBuf, test_command: Option<String>) -> Self {
        Self {
            repo_root,
            test_command,
        }
    }
}

impl MergeBackend for GitMergeBackend {
    fn merge(&self, task: &Element, orch: &TaskOrchestrator) -> Result<MergeDisposition> {
        let Some(branch) = orch.branch.as_deref() else {
            return Ok(MergeDisposition::Failed(format!(
                "task {} has no branch recorded",
                task.id
            )));
        };

        if let Some(test_command) = &self.test_command {
            let output = Command::new("sh")
                .args(["-c", test_command])
                .current_dir(&self.repo_root)
                .output()?;
            if !output.status.success() {
                return Ok(MergeDisposition::TestFailed(
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ));
            }
        }

        let output = Command::new("git")
            .args(["merge", "--no-ff", "--no-edit", branch])
            .current_dir(&self.repo_root)
            .output()?;
        if output.status.success() {
            return Ok(MergeDisposition::Merged);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Abandon a half-applied merge so the next task starts clean.
        let _ = Command::new("git")
            .args(["merge", "--abort"])
            .current_dir(&self.repo_root)
            .output();

        if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") {
            Ok(MergeDisposition::Conflict(stdout.into_owned()))
        } else {
            Ok(MergeDisposition::Failed(stderr.into_owned()))
        }
    }
}

// ---------------------------------------------------------------------------
// MergeStewardService
// ---------------------------------------------------------------------------

/// Counts from one merge sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    /// Tasks examined.
    pub total_processed: u64,
    /// Branches merged.
    pub merged_count: u64,
    /// Merges stopped by conflicts.
    pub conflict_count: u64,
    /// Merges stopped by failing tests.
    pub test_failed_count: u64,
    /// Everything else that went wrong.
    pub error_count: u64,
}

/// Reconciles merge readiness: closed tasks with pending branches flow
/// through the backend and their orchestrator records are updated.
pub struct MergeStewardService {
    store: Arc<Store>,
    backend: Arc<dyn MergeBackend>,
    actor: String,
}

impl MergeStewardService {
    /// Build over a store and a merge backend.
    #[must_use]
    pub fn new(store: Arc<Store>, backend: Arc<dyn MergeBackend>, actor: &str) -> Self {
        Self {
            store,
            backend,
            actor: actor.to_owned(),
        }
    }

    /// Sweep every pending merge once.
    ///
    /// # Errors
    /// Store failures listing tasks; per-task failures are folded into the
    /// summary instead.
    pub fn process_all_pending(&self) -> Result<MergeSummary> {
        let tasks = self.store.list(&ElementFilter {
            element_type: Some(ElementType::Task),
            ..ElementFilter::default()
        })?;

        let mut summary = MergeSummary::default();
        for task in tasks {
            if !task.is_closed() {
                continue;
            }
            let mut orch = TaskOrchestrator::from_element(&task)?;
            if orch.branch.is_none()
                || !matches!(orch.merge_status, MergeStatus::Pending | MergeStatus::Testing)
            {
                continue;
            }

            summary.total_processed += 1;
            let disposition = match self.backend.merge(&task, &orch) {
                Ok(disposition) => disposition,
                Err(e) => MergeDisposition::Failed(e.to_string()),
            };
            match &disposition {
                MergeDisposition::Merged => {
                    summary.merged_count += 1;
                    orch.merge_status = MergeStatus::Merged;
                    orch.merged_at = Some(Utc::now());
                }
                MergeDisposition::Conflict(detail) => {
                    summary.conflict_count += 1;
                    orch.merge_status = MergeStatus::Conflict;
                    orch.last_sync_result = Some(detail.clone());
                }
                MergeDisposition::TestFailed(detail) => {
                    summary.test_failed_count += 1;
                    orch.merge_status = MergeStatus::TestFailed;
                    orch.last_test_result = Some(detail.clone());
                }
                MergeDisposition::Failed(detail) => {
                    summary.error_count += 1;
                    orch.merge_status = MergeStatus::Failed;
                    orch.last_sync_result = Some(detail.clone());
                }
            }

            let mut scratch = task.clone();
            orch.write_to(&mut scratch)?;
            self.store
                .update(&task.id, &ElementPatch::metadata(scratch.metadata), &self.actor)?;
            tracing::debug!(task = %task.id, status = %orch.merge_status, "merge steward processed task");
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// BuiltinExecutor
// ---------------------------------------------------------------------------

/// Dispatches on steward focus: merge sweeps, docs sessions, and a polite
/// failure for anything it does not recognize.
pub struct BuiltinExecutor {
    merge: Arc<MergeStewardService>,
    sessions: Arc<SessionManager>,
    session_opts: StartOptions,
}

impl BuiltinExecutor {
    /// Build with the session template used for docs stewards.
    #[must_use]
    pub fn new(
        merge: Arc<MergeStewardService>,
        sessions: Arc<SessionManager>,
        session_opts: StartOptions,
    ) -> Self {
        Self {
            merge,
            sessions,
            session_opts,
        }
    }
}

#[async_trait]
impl StewardExecutor for BuiltinExecutor {
    async fn execute(
        &self,
        agent: &Element,
        config: &AgentConfig,
        trigger: &str,
    ) -> Result<ExecutorReport> {
        match config.steward_focus {
            Some(StewardFocus::Merge) => {
                let summary = self.merge.process_all_pending()?;
                let failed =
                    summary.conflict_count + summary.test_failed_count + summary.error_count;
                Ok(ExecutorReport {
                    success: true,
                    output: format!(
                        "processed {} pending merge(s): {} merged, {failed} failed",
                        summary.total_processed, summary.merged_count
                    ),
                    items_processed: Some(summary.total_processed),
                })
            }
            Some(StewardFocus::Docs) => {
                let record = self
                    .sessions
                    .start_session(&agent.id, &self.session_opts)
                    .await?;
                tracing::info!(
                    steward = %agent.id,
                    session = %record.session_id,
                    trigger,
                    "docs steward session spawned"
                );
                Ok(ExecutorReport {
                    success: true,
                    output: format!("spawned 1 docs session ({})", record.session_id),
                    items_processed: Some(1),
                })
            }
            Some(StewardFocus::Custom) | None => Ok(ExecutorReport {
                success: false,
                output: "Unknown steward focus".to_owned(),
                items_processed: None,
            }),
        }
    }
}
