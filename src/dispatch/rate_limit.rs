//! Rate-limit fallback across an executable chain.
//!
//! An executable is **limited** while it has an unexpired `resetsAt`. The
//! tracker persists its whole state as one JSON settings value under
//! `rateLimits` and hydrates it back on construction, dropping expired
//! horizons and skipping malformed entries without throwing. Concurrent
//! markers go through an optimistic compare-and-swap loop on the settings
//! row so no update is lost.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stoneforge_core::error::Result;
use stoneforge_core::settings::Settings;
use stoneforge_core::store::Store;

/// Settings key the tracker persists under.
pub const RATE_LIMITS_KEY: &str = "rateLimits";

const CAS_RETRIES: usize = 5;

/// One persisted limit horizon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitEntry {
    /// When the limit lifts.
    pub resets_at: DateTime<Utc>,
    /// When the limit was observed.
    pub recorded_at: DateTime<Utc>,
}

/// Tracks per-executable rate-limit horizons with settings persistence.
pub struct RateLimitTracker<'a> {
    store: &'a Store,
    state: Mutex<HashMap<String, LimitEntry>>,
}

impl<'a> RateLimitTracker<'a> {
    /// Hydrate the tracker from the persisted setting. Entries whose
    /// `resetsAt` has already passed are dropped; unknown or malformed
    /// entries are skipped without throwing.
    ///
    /// # Errors
    /// `Storage` failures reading the setting.
    pub fn new(store: &'a Store) -> Result<Self> {
        let settings = Settings::new(store);
        let now = Utc::now();
        let mut state = HashMap::new();

        if let Some(serde_json::Value::Object(raw)) = settings.get(RATE_LIMITS_KEY)? {
            for (executable, value) in raw {
                match serde_json::from_value::<LimitEntry>(value) {
                    Ok(entry) if entry.resets_at > now => {
                        state.insert(executable, entry);
                    }
                    Ok(_) => {} // expired — drop on hydration
                    Err(e) => {
                        tracing::warn!(
                            executable,
                            error = %e,
                            "skipping malformed rate-limit entry"
                        );
                    }
                }
            }
        }

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// The first member of `chain` without an unexpired limit, if any.
    #[must_use]
    pub fn available_executable(&self, chain: &[String]) -> Option<String> {
        let now = Utc::now();
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        chain
            .iter()
            .find(|exec| {
                state
                    .get(exec.as_str())
                    .is_none_or(|entry| entry.resets_at <= now)
            })
            .cloned()
    }

    /// Record a limit on `executable` until `resets_at`. Upserts, but never
    /// downgrades an existing entry to an earlier reset time.
    ///
    /// # Errors
    /// `Storage` failures persisting the new state.
    pub fn mark_limited(&self, executable: &str, resets_at: DateTime<Utc>) -> Result<()> {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match state.get(executable) {
                Some(existing) if existing.resets_at >= resets_at => {
                    // Keep the later horizon.
                    return Ok(());
                }
                _ => {
                    state.insert(
                        executable.to_owned(),
                        LimitEntry {
                            resets_at,
                            recorded_at: Utc::now(),
                        },
                    );
                }
            }
        }
        self.persist()
    }

    /// Drop an executable's limit (manual reset).
    ///
    /// # Errors
    /// `Storage` failures persisting the new state.
    pub fn clear(&self, executable: &str) -> Result<()> {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.remove(executable).is_none() {
                return Ok(());
            }
        }
        self.persist()
    }

    /// Current snapshot, for status output.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, LimitEntry> {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Write the whole map back through an optimistic CAS loop: re-read the
    /// row, fold our in-memory horizons over it (never downgrading), and
    /// retry on a concurrent write.
    fn persist(&self) -> Result<()> {
        let settings = Settings::new(self.store);
        for _ in 0..CAS_RETRIES {
            let current = settings.get(RATE_LIMITS_KEY)?;
            let mut merged: HashMap<String, LimitEntry> = match &current {
                Some(serde_json::Value::Object(raw)) => raw
                    .iter()
                    .filter_map(|(k, v)| {
                        serde_json::from_value(v.clone()).ok().map(|e| (k.clone(), e))
                    })
                    .collect(),
                _ => HashMap::new(),
            };

            {
                let state = match self.state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for (exec, entry) in &*state {
                    let keep_ours = merged
                        .get(exec)
                        .is_none_or(|theirs| theirs.resets_at < entry.resets_at);
                    if keep_ours {
                        merged.insert(exec.clone(), entry.clone());
                    }
                }
            }

            let value = serde_json::to_value(&merged).map_err(|e| {
                stoneforge_core::StoneforgeError::Database {
                    detail: format!("serializing rate limits: {e}"),
                }
            })?;
            if settings.compare_and_swap(RATE_LIMITS_KEY, current.as_ref(), &value)? {
                return Ok(());
            }
        }
        Err(stoneforge_core::StoneforgeError::Database {
            detail: "rate-limit setting kept changing under us".to_owned(),
        })
    }
}
