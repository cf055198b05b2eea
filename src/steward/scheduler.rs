//! The steward scheduler: cron ticks, event triggers, and an execution
//! history ring.
//!
//! Every failure path — a missing agent, malformed metadata, an invalid
//! cron expression, an executor panic-equivalent error — folds into a
//! recorded `{success: false, error}` execution. One steward's failure
//! never destabilizes its peers or the scheduler itself.

use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;

use stoneforge_core::model::{
    AgentConfig, Element, ElementId, ElementType, StewardTrigger,
};
use stoneforge_core::store::{ElementFilter, Store};

use crate::steward::executors::StewardExecutor;
use crate::steward::ExecutionRecord;

/// Bound on the execution-history ring.
pub const HISTORY_CAP: usize = 100;

/// How often the cron driver wakes up.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the internal event bus.
const EVENT_BUS_CAPACITY: usize = 64;

/// Schedules and executes stewards.
pub struct StewardScheduler {
    store: Arc<Store>,
    executor: Arc<dyn StewardExecutor>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    events: broadcast::Sender<String>,
}

impl StewardScheduler {
    /// Build over an agent registry (the store) and an executor.
    #[must_use]
    pub fn new(store: Arc<Store>, executor: Arc<dyn StewardExecutor>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            executor,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            events,
        }
    }

    /// Publish a named event on the internal bus (e.g. `task.closed`).
    /// Nothing listens until [`Self::run`] is driving; direct callers can
    /// use [`Self::handle_event`] instead.
    pub fn publish_event(&self, event: &str) {
        // Send only fails with no receivers, which is fine.
        let _ = self.events.send(event.to_owned());
    }

    /// Execute one steward now.
    ///
    /// Never returns `Err`: resolution failures, invalid steward metadata,
    /// and executor errors all land in the returned record (and in
    /// history).
    pub async fn execute_steward(&self, agent_id: &ElementId, trigger: &str) -> ExecutionRecord {
        let started_at = Utc::now();
        let t0 = tokio::time::Instant::now();

        let outcome = self.resolve_and_run(agent_id, trigger).await;
        let duration_ms = u64::try_from(t0.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = match outcome {
            Ok(report) => ExecutionRecord {
                steward_id: agent_id.clone(),
                trigger: trigger.to_owned(),
                started_at,
                duration_ms,
                success: report.success,
                error: None,
                output: Some(report.output),
                items_processed: report.items_processed,
            },
            Err(error) => ExecutionRecord {
                steward_id: agent_id.clone(),
                trigger: trigger.to_owned(),
                started_at,
                duration_ms,
                success: false,
                error: Some(error),
                output: None,
                items_processed: None,
            },
        };

        if record.success {
            tracing::info!(steward = %agent_id, trigger, "steward executed");
        } else {
            tracing::warn!(
                steward = %agent_id,
                trigger,
                error = record.error.as_deref().unwrap_or(""),
                "steward execution failed"
            );
        }

        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record.clone());
        record
    }

    async fn resolve_and_run(
        &self,
        agent_id: &ElementId,
        trigger: &str,
    ) -> Result<crate::steward::executors::ExecutorReport, String> {
        let agent = self
            .store
            .require(agent_id)
            .map_err(|e| e.to_string())?;
        let config = AgentConfig::from_element(&agent)
            .map_err(|_| format!("agent '{agent_id}' is not a steward"))?;
        if !config.is_steward() {
            return Err(format!("agent '{agent_id}' is not a steward"));
        }

        self.executor
            .execute(&agent, &config, trigger)
            .await
            .map_err(|e| e.to_string())
    }

    /// The newest `limit` history entries, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// All registered stewards: entity elements whose agent record has the
    /// steward role and a focus.
    ///
    /// Malformed agent records are skipped — a broken registration must not
    /// take the scheduler down.
    async fn stewards(&self) -> Vec<(Element, AgentConfig)> {
        let entities = match self.store.list(&ElementFilter {
            element_type: Some(ElementType::Entity),
            ..ElementFilter::default()
        }) {
            Ok(entities) => entities,
            Err(e) => {
                tracing::warn!(error = %e, "steward scan failed");
                return Vec::new();
            }
        };

        entities
            .into_iter()
            .filter_map(|el| {
                let config = AgentConfig::from_element(&el).ok()?;
                config.is_steward().then_some((el, config))
            })
            .collect()
    }

    /// Execute every steward whose cron schedule fires in `(from, to]`.
    /// Invalid cron expressions are skipped with a warning.
    pub async fn tick(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<ExecutionRecord> {
        let mut records = Vec::new();
        for (agent, config) in self.stewards().await {
            for trigger in &config.triggers {
                let StewardTrigger::Cron { schedule } = trigger else {
                    continue;
                };
                let parsed = match Schedule::from_str(schedule) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(
                            steward = %agent.id,
                            schedule,
                            error = %e,
                            "skipping invalid cron schedule"
                        );
                        continue;
                    }
                };
                // Cron schedules are evaluated in UTC.
                let due = parsed.after(&from).next().is_some_and(|next| next <= to);
                if due {
                    records
                        .push(self.execute_steward(&agent.id, &trigger.to_string()).await);
                }
            }
        }
        records
    }

    /// Execute every steward with a matching event trigger.
    pub async fn handle_event(&self, event: &str) -> Vec<ExecutionRecord> {
        let mut records = Vec::new();
        for (agent, config) in self.stewards().await {
            for trigger in &config.triggers {
                let StewardTrigger::Event { event: name } = trigger else {
                    continue;
                };
                if name == event {
                    records
                        .push(self.execute_steward(&agent.id, &trigger.to_string()).await);
                }
            }
        }
        records
    }

    /// Drive cron ticks and the event bus until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) {
        let mut rx = self.events.subscribe();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tick = Utc::now();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    self.tick(last_tick, now).await;
                    last_tick = now;
                }
                event = rx.recv() => match event {
                    Ok(event) => {
                        self.handle_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "steward event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("steward scheduler stopped");
    }
}
