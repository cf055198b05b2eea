//! The provider-agnostic session contract.
//!
//! A launched headless session splits into two halves: a [`SessionControl`]
//! for imperative calls (send, interrupt, close) and a bounded message
//! receiver the owner's background task drains. Keeping the stream out of
//! the control trait means a consumer waiting on `next` never blocks a
//! concurrent `send_message`.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::session::message::AgentMessage;

/// What to launch and where.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    /// Executable to spawn (`claude`, `gpt-4`, …).
    pub executable: String,
    /// Extra arguments appended after the built-in stream flags.
    pub extra_args: Vec<String>,
    /// Working directory the session is bound to.
    pub working_directory: PathBuf,
    /// Provider session id to resume, if any.
    pub resume: Option<String>,
    /// Initial prompt, sent once the stream is up.
    pub prompt: Option<String>,
}

/// Imperative half of a live session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Queue a user message. Fire-and-forget: transport failures surface as
    /// `error` events on the message stream.
    ///
    /// # Errors
    /// Only if the session is already closed.
    async fn send_message(&self, text: &str) -> Result<()>;

    /// Ask the provider to interrupt the current turn. Idempotent; races
    /// safely with stream completion.
    ///
    /// # Errors
    /// Backends treat post-completion interrupts as no-ops; only transport
    /// setup failures surface.
    async fn interrupt(&self) -> Result<()>;

    /// Tear the session down. Idempotent; always releases any shared
    /// provider server.
    ///
    /// # Errors
    /// Cleanup failures; the session is still considered closed.
    async fn close(&self) -> Result<()>;
}

/// A freshly-launched session: control plus its message stream.
pub struct LaunchedSession {
    /// Imperative half.
    pub control: std::sync::Arc<dyn SessionControl>,
    /// Bounded stream of normalized messages; ends when the provider
    /// stream does.
    pub messages: mpsc::Receiver<AgentMessage>,
}

/// Spawns sessions for a given spec. Implemented by the process backend and
/// by test fakes.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Launch a session.
    ///
    /// # Errors
    /// Spawn or transport failures standing up the provider.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSession>;
}
