//! Predecessor consultation: resume the most recent session of a role, ask
//! it a question, and suspend it again.
//!
//! Queries are bounded by a timeout in `[10s, 5min]`. On timeout the query
//! is marked `timed_out` and suspension is still attempted. Active queries
//! are listable and cancellable, and are reaped from the active map five
//! seconds after completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use stoneforge_core::model::AgentRole;

use crate::session::{AgentMessage, SessionManager};

/// Lower timeout bound.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper timeout bound.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

const REAP_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Query state
// ---------------------------------------------------------------------------

/// Where a consultation query sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

/// A row in the active-query listing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    /// Query identifier.
    pub query_id: String,
    /// Who asked.
    pub requester: String,
    /// Role consulted.
    pub role: AgentRole,
    /// Current status.
    pub status: QueryStatus,
    /// When the query started.
    pub started_at: DateTime<Utc>,
}

struct ActiveQuery {
    info: QueryInfo,
    cancel: Arc<Notify>,
}

/// Options for one consultation.
#[derive(Clone, Debug)]
pub struct ConsultOptions {
    /// Query timeout, clamped to `[10s, 5min]`.
    pub timeout: Duration,
    /// Suspend the predecessor again once the response is in.
    pub suspend_after_response: bool,
    /// Context prepended to the message.
    pub context: Option<String>,
}

impl Default for ConsultOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            suspend_after_response: true,
            context: None,
        }
    }
}

/// The outcome handed back to the requester.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultResult {
    /// Whether a response was obtained.
    pub success: bool,
    /// Accumulated assistant text.
    pub response: Option<String>,
    /// Session id of the consulted predecessor.
    pub predecessor: Option<String>,
    /// Wall-clock duration of the query.
    pub duration_ms: u64,
    /// Final query status.
    pub status: QueryStatus,
    /// Failure description, when unsuccessful.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// PredecessorConsultation
// ---------------------------------------------------------------------------

/// Runs consultation queries against the session manager.
pub struct PredecessorConsultation {
    manager: Arc<SessionManager>,
    active: Arc<Mutex<HashMap<String, ActiveQuery>>>,
    counter: AtomicU64,
}

impl PredecessorConsultation {
    /// Build over a session manager.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            active: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
        }
    }

    /// Consult the most recent resumable session of `role`.
    ///
    /// Never returns `Err`: every failure mode is folded into the result so
    /// a steward asking for advice cannot crash on a missing predecessor.
    pub async fn consult(
        &self,
        requester: &str,
        role: AgentRole,
        message: &str,
        executable: &str,
        opts: &ConsultOptions,
    ) -> ConsultResult {
        let started = Instant::now();
        let timeout = opts.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);

        let Some(predecessor) = self.manager.find_predecessor(role).await else {
            return ConsultResult {
                success: false,
                response: None,
                predecessor: None,
                duration_ms: ms_since(started),
                status: QueryStatus::Failed,
                error: Some(format!("No predecessor found for role: {role}")),
            };
        };

        let query_id = format!("query-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        let cancel = Arc::new(Notify::new());
        self.register(&query_id, requester, role, Arc::clone(&cancel))
            .await;

        let prompt = opts.context.as_ref().map_or_else(
            || message.to_owned(),
            |context| format!("{context}\n\n{message}"),
        );

        let resumed = self
            .manager
            .resume_with_stream(&predecessor.session_id, executable, Some(prompt))
            .await;
        let (_control, mut messages) = match resumed {
            Ok(pair) => pair,
            Err(e) => {
                let result = ConsultResult {
                    success: false,
                    response: None,
                    predecessor: Some(predecessor.session_id.clone()),
                    duration_ms: ms_since(started),
                    status: QueryStatus::Failed,
                    error: Some(format!("resuming predecessor: {e}")),
                };
                self.finish(&query_id, QueryStatus::Failed).await;
                return result;
            }
        };

        // Accumulate assistant text until a result event, stream end,
        // timeout, or cancellation.
        let deadline = Instant::now() + timeout;
        let mut response = String::new();
        let mut status = QueryStatus::Running;
        while status == QueryStatus::Running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                () = cancel.notified() => status = QueryStatus::Cancelled,
                next = tokio::time::timeout(remaining, messages.recv()) => match next {
                    Err(_) => status = QueryStatus::TimedOut,
                    Ok(None) => status = QueryStatus::Completed,
                    Ok(Some(AgentMessage::Assistant { content })) => response.push_str(&content),
                    Ok(Some(message)) if message.is_turn_end() => {
                        status = QueryStatus::Completed;
                    }
                    Ok(Some(_)) => {}
                },
            }
        }

        // Suspend again unless opted out — including after a timeout or
        // cancel. Cleanup failures are swallowed: the query result is what
        // matters to the caller.
        if opts.suspend_after_response {
            if let Err(e) = self
                .manager
                .suspend_session(&predecessor.session_id, "consultation complete")
                .await
            {
                tracing::debug!(
                    session = %predecessor.session_id,
                    error = %e,
                    "post-consultation suspend failed"
                );
            }
        }

        self.finish(&query_id, status).await;
        let success = status == QueryStatus::Completed && !response.is_empty();
        ConsultResult {
            success,
            response: (!response.is_empty()).then_some(response),
            predecessor: Some(predecessor.session_id),
            duration_ms: ms_since(started),
            status,
            error: match status {
                QueryStatus::TimedOut => Some("consultation timed out".to_owned()),
                QueryStatus::Cancelled => Some("consultation cancelled".to_owned()),
                _ => None,
            },
        }
    }

    /// Active (and recently finished, pre-reap) queries.
    pub async fn list_queries(&self) -> Vec<QueryInfo> {
        self.active
            .lock()
            .await
            .values()
            .map(|q| q.info.clone())
            .collect()
    }

    /// Cancel a running query. Unknown ids are ignored.
    pub async fn cancel_query(&self, query_id: &str) {
        if let Some(query) = self.active.lock().await.get(query_id) {
            query.cancel.notify_waiters();
        }
    }

    async fn register(&self, query_id: &str, requester: &str, role: AgentRole, cancel: Arc<Notify>) {
        self.active.lock().await.insert(
            query_id.to_owned(),
            ActiveQuery {
                info: QueryInfo {
                    query_id: query_id.to_owned(),
                    requester: requester.to_owned(),
                    role,
                    status: QueryStatus::Running,
                    started_at: Utc::now(),
                },
                cancel,
            },
        );
    }

    /// Record the final status and reap the entry after a grace period so
    /// late `list_queries` callers still see the outcome.
    async fn finish(&self, query_id: &str, status: QueryStatus) {
        if let Some(query) = self.active.lock().await.get_mut(query_id) {
            query.info.status = status;
        }
        let active = Arc::clone(&self.active);
        let query_id = query_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(REAP_DELAY).await;
            active.lock().await.remove(&query_id);
        });
    }
}

fn ms_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
