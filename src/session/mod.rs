//! Agent session lifecycle: spawn, stream, suspend, resume, interrupt.
//!
//! A session is an abstract capability set `{send_message, iterate,
//! interrupt, close}` realized by multiple backends. The headless backend
//! drives an out-of-process agent CLI speaking stream-JSON; the interactive
//! backend owns a PTY. Each live session owns one background task draining
//! its provider stream into a bounded queue; consumers iterate the queue.

mod backend;
mod interactive;
mod manager;
mod message;
mod process;
mod server;

pub use backend::{LaunchSpec, LaunchedSession, SessionControl, SessionLauncher};
pub use interactive::{InteractiveSession, PtyEvent};
pub use manager::{SessionManager, SessionRecord, StartOptions};
pub use message::{normalize_event, AgentMessage, DeltaBuffer, ToolCall};
pub use process::{ProcessLauncher, QUEUE_CAPACITY};
pub use server::ServerPool;

use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// SessionMode / SessionStatus
// ---------------------------------------------------------------------------

/// How the session talks to its agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Stream-JSON over pipes.
    Headless,
    /// Raw bytes over a PTY.
    Interactive,
}

/// Where a session sits in its lifecycle.
///
/// ```text
/// starting ──init──► running ──suspend──► suspended ──resume──► running
///     │                 │ close / turn-done                        │
///     ▼                 ▼                                          ▼
///  failed            ended                                      ended
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Suspended,
    Ended,
    Failed,
}

impl SessionStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether the machine permits `self → to`.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        match self {
            Self::Starting => matches!(to, Self::Running | Self::Ended | Self::Failed),
            Self::Running => matches!(to, Self::Suspended | Self::Ended | Self::Failed),
            Self::Suspended => matches!(to, Self::Running | Self::Ended | Self::Failed),
            Self::Ended | Self::Failed => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Ended => write!(f, "ended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
