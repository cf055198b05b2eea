//! Agent configuration — a typed view over an `entity` element's metadata.
//!
//! An agent is an [`crate::model::Element`] of type `entity` whose metadata
//! carries a role, an optional worker mode or steward focus, and (for
//! stewards) a trigger list. The view validates on read so malformed
//! metadata surfaces as an error instead of a misbehaving agent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoneforgeError};
use crate::model::{Element, ElementType};

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

/// What an agent does in the workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Supervises work and hands out tasks.
    Director,
    /// Executes tasks in sessions.
    Worker,
    /// Reconciles derived state (merge readiness, documentation drift).
    Steward,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Director => write!(f, "director"),
            Self::Worker => write!(f, "worker"),
            Self::Steward => write!(f, "steward"),
        }
    }
}

impl FromStr for AgentRole {
    type Err = StoneforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "director" => Ok(Self::Director),
            "worker" => Ok(Self::Worker),
            "steward" => Ok(Self::Steward),
            other => Err(StoneforgeError::InvalidInput {
                detail: format!("unknown agent role '{other}'"),
            }),
        }
    }
}

/// Lifetime discipline for worker agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One task, then the session ends.
    Ephemeral,
    /// Stays resident across tasks.
    Persistent,
}

/// What derived state a steward reconciles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StewardFocus {
    Merge,
    Docs,
    Custom,
}

impl fmt::Display for StewardFocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Docs => write!(f, "docs"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

// ---------------------------------------------------------------------------
// StewardTrigger
// ---------------------------------------------------------------------------

/// When a steward fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StewardTrigger {
    /// A cron expression, evaluated in UTC.
    Cron {
        /// Standard five/six-field cron expression.
        schedule: String,
    },
    /// A named event published on the internal bus.
    Event {
        /// The event name, e.g. `task.closed`.
        event: String,
    },
}

impl fmt::Display for StewardTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { schedule } => write!(f, "cron({schedule})"),
            Self::Event { event } => write!(f, "event({event})"),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Typed agent configuration read from an entity element's metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// The agent's role.
    pub role: AgentRole,
    /// Worker lifetime mode; only meaningful for workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_mode: Option<WorkerMode>,
    /// Steward focus; only meaningful for stewards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steward_focus: Option<StewardFocus>,
    /// Steward triggers; empty for non-stewards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<StewardTrigger>,
    /// Channel the agent receives dispatch notifications on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<crate::model::ElementId>,
    /// Executable chain for rate-limit fallback, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executables: Vec<String>,
}

/// Metadata key the agent configuration lives under.
pub(crate) const AGENT_METADATA_KEY: &str = "agent";

impl AgentConfig {
    /// Read the agent configuration from an element.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::EntityNotFound`] if the element is not an
    /// entity or carries no agent record, and [`StoneforgeError::InvalidMetadata`]
    /// if the record fails to deserialize.
    pub fn from_element(el: &Element) -> Result<Self> {
        if el.element_type != ElementType::Entity {
            return Err(StoneforgeError::EntityNotFound {
                what: "agent",
                id: el.id.to_string(),
            });
        }
        let raw = el
            .metadata
            .get(AGENT_METADATA_KEY)
            .ok_or_else(|| StoneforgeError::EntityNotFound {
                what: "agent",
                id: el.id.to_string(),
            })?;
        serde_json::from_value(raw.clone()).map_err(|e| StoneforgeError::InvalidMetadata {
            reason: format!("agent record on '{}' is malformed: {e}", el.id),
        })
    }

    /// Write the configuration back into an element's metadata.
    ///
    /// # Errors
    /// Returns [`StoneforgeError::InvalidMetadata`] if serialization fails.
    pub fn write_to(&self, el: &mut Element) -> Result<()> {
        let value = serde_json::to_value(self).map_err(|e| StoneforgeError::InvalidMetadata {
            reason: format!("agent record is not serializable: {e}"),
        })?;
        el.metadata.insert(AGENT_METADATA_KEY.to_owned(), value);
        Ok(())
    }

    /// Whether this agent is a steward with a valid focus.
    #[must_use]
    pub const fn is_steward(&self) -> bool {
        matches!(self.role, AgentRole::Steward) && self.steward_focus.is_some()
    }
}
