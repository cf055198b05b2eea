//! Key-value settings rows with JSON values.
//!
//! Small pieces of process state (rate-limit horizons, the sync baseline)
//! persist here as whole-value writes. Concurrent writers use
//! [`Settings::compare_and_swap`] so updates never silently clobber each
//! other.

use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::error::{Result, StoneforgeError};
use crate::store::Store;

/// Typed accessor over the store's `settings` table.
pub struct Settings<'a> {
    store: &'a Store,
}

impl<'a> Settings<'a> {
    /// Wrap a store.
    #[must_use]
    pub const fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Read a setting; `Ok(None)` if absent.
    ///
    /// # Errors
    /// `Storage` failures, or `IntegrityFailure` on a corrupt value.
    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.store.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            raw.map(|raw| {
                serde_json::from_str(&raw).map_err(|e| StoneforgeError::IntegrityFailure {
                    detail: format!("corrupt setting '{key}': {e}"),
                })
            })
            .transpose()
        })
    }

    /// Write a setting unconditionally.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                rusqlite::params![key, value.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Write a setting only if its current value matches `expected`
    /// (`None` = the row must be absent). Returns whether the write landed.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&serde_json::Value>,
        value: &serde_json::Value,
    ) -> Result<bool> {
        self.store.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = match expected {
                None => conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO NOTHING",
                    rusqlite::params![key, value.to_string(), now],
                )?,
                Some(expected) => conn.execute(
                    "UPDATE settings SET value = ?2, updated_at = ?3
                     WHERE key = ?1 AND value = ?4",
                    rusqlite::params![key, value.to_string(), now, expected.to_string()],
                )?,
            };
            Ok(changed > 0)
        })
    }

    /// Delete a setting; returns whether a row was removed.
    ///
    /// # Errors
    /// `Storage` failures.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_remove_round_trip() {
        let store = Store::open_in_memory().expect("store");
        let settings = Settings::new(&store);

        assert_eq!(settings.get("missing").expect("get"), None);
        settings.set("x", &json!({"a": 1})).expect("set");
        assert_eq!(settings.get("x").expect("get"), Some(json!({"a": 1})));
        assert!(settings.remove("x").expect("remove"));
        assert_eq!(settings.get("x").expect("get"), None);
    }

    #[test]
    fn compare_and_swap_detects_races() {
        let store = Store::open_in_memory().expect("store");
        let settings = Settings::new(&store);

        // Absent row: only the None-expectation insert lands.
        assert!(settings
            .compare_and_swap("k", None, &json!(1))
            .expect("cas"));
        assert!(!settings
            .compare_and_swap("k", None, &json!(2))
            .expect("cas"));

        // Stale expectation loses; fresh expectation wins.
        assert!(!settings
            .compare_and_swap("k", Some(&json!(99)), &json!(2))
            .expect("cas"));
        assert!(settings
            .compare_and_swap("k", Some(&json!(1)), &json!(2))
            .expect("cas"));
        assert_eq!(settings.get("k").expect("get"), Some(json!(2)));
    }
}
