//! The session manager: registry, lifecycle transitions, and transcript
//! persistence.
//!
//! Every live session has one background task draining its message stream;
//! the manager persists normalized messages to the store as transcript
//! Messages, captures the provider session id from the `init` event, and
//! walks the state machine. Suspension requires a captured provider session
//! id — without one there is nothing to resume.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};

use stoneforge_core::model::{AgentConfig, AgentRole, Element, ElementId, ElementType};
use stoneforge_core::store::{ElementFilter, Store};

use crate::session::backend::{LaunchSpec, SessionControl, SessionLauncher};
use crate::session::message::AgentMessage;
use crate::session::{SessionMode, SessionStatus};

/// Metadata key on transcript messages holding the session id.
const TRANSCRIPT_SESSION_KEY: &str = "sessionId";

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// Runtime-only state of one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Manager-assigned identifier.
    pub session_id: String,
    /// The agent the session belongs to.
    pub agent_id: ElementId,
    /// The agent's role at start time.
    pub role: AgentRole,
    /// Provider session id, once the `init` event delivered it.
    pub provider_session_id: Option<String>,
    /// Headless or interactive.
    pub mode: SessionMode,
    /// Lifecycle position.
    pub status: SessionStatus,
    /// The directory the session works in.
    pub working_directory: PathBuf,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Why it was suspended, while suspended.
    pub suspend_reason: Option<String>,
}

struct Entry {
    record: SessionRecord,
    control: Option<Arc<dyn SessionControl>>,
}

/// Options for [`SessionManager::start_session`].
#[derive(Clone, Debug)]
pub struct StartOptions {
    /// Executable to spawn.
    pub executable: String,
    /// Working directory for the session.
    pub working_directory: PathBuf,
    /// Initial prompt, if any.
    pub prompt: Option<String>,
    /// Extra args appended to the launch.
    pub extra_args: Vec<String>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Runs and reconciles long-lived agent sessions.
pub struct SessionManager {
    store: Arc<Store>,
    launcher: Arc<dyn SessionLauncher>,
    actor: String,
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    counter: AtomicU64,
}

impl SessionManager {
    /// Build a manager over a store and a launcher.
    #[must_use]
    pub fn new(store: Arc<Store>, launcher: Arc<dyn SessionLauncher>, actor: &str) -> Self {
        Self {
            store,
            launcher,
            actor: actor.to_owned(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            counter: AtomicU64::new(0),
        }
    }

    fn generate_session_id(&self, agent_id: &ElementId, started_at: DateTime<Utc>) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(agent_id.as_str().as_bytes());
        hasher.update(started_at.to_rfc3339().as_bytes());
        hasher.update(n.to_be_bytes());
        let digest = hasher.finalize();
        let mut id = String::from("sess-");
        for byte in digest.iter().take(6) {
            let _ = write!(id, "{byte:02x}");
        }
        id
    }

    /// Spawn a headless session for `agent_id`.
    ///
    /// # Errors
    /// Fails if the agent is missing or is not an agent entity, or the
    /// launch fails.
    pub async fn start_session(
        &self,
        agent_id: &ElementId,
        opts: &StartOptions,
    ) -> Result<SessionRecord> {
        let agent = self
            .store
            .require(agent_id)
            .with_context(|| format!("starting session for {agent_id}"))?;
        let config = AgentConfig::from_element(&agent)?;

        let started_at = Utc::now();
        let session_id = self.generate_session_id(agent_id, started_at);
        let launched = self
            .launcher
            .launch(&LaunchSpec {
                executable: opts.executable.clone(),
                extra_args: opts.extra_args.clone(),
                working_directory: opts.working_directory.clone(),
                resume: None,
                prompt: opts.prompt.clone(),
            })
            .await?;

        let record = SessionRecord {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            role: config.role,
            provider_session_id: None,
            mode: SessionMode::Headless,
            status: SessionStatus::Starting,
            working_directory: opts.working_directory.clone(),
            started_at,
            ended_at: None,
            suspend_reason: None,
        };
        self.sessions.write().await.insert(
            session_id.clone(),
            Entry {
                record: record.clone(),
                control: Some(Arc::clone(&launched.control)),
            },
        );
        self.spawn_drive_task(session_id.clone(), agent_id.clone(), launched.messages);

        tracing::info!(session = %session_id, agent = %agent_id, "session started");
        Ok(record)
    }

    fn spawn_drive_task(
        &self,
        session_id: String,
        agent_id: ElementId,
        mut messages: mpsc::Receiver<AgentMessage>,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let store = Arc::clone(&self.store);
        let actor = self.actor.clone();

        tokio::spawn(async move {
            let mut seq = 0u64;
            while let Some(message) = messages.recv().await {
                seq += 1;
                if let Err(e) =
                    persist_transcript(&store, &actor, &session_id, &agent_id, seq, &message)
                {
                    tracing::warn!(session = %session_id, error = %e, "transcript write failed");
                }

                if let AgentMessage::System {
                    subtype,
                    session_id: provider_id,
                } = &message
                    && subtype == "init"
                {
                    let mut sessions = sessions.write().await;
                    if let Some(entry) = sessions.get_mut(&session_id) {
                        entry.record.provider_session_id.clone_from(provider_id);
                        if entry.record.status == SessionStatus::Starting {
                            entry.record.status = SessionStatus::Running;
                        }
                    }
                }
            }

            // Stream ended: walk to a terminal state unless the session was
            // deliberately suspended (suspension closes the stream).
            let mut sessions = sessions.write().await;
            if let Some(entry) = sessions.get_mut(&session_id) {
                match entry.record.status {
                    SessionStatus::Suspended | SessionStatus::Ended | SessionStatus::Failed => {}
                    SessionStatus::Starting => {
                        entry.record.status = SessionStatus::Failed;
                        entry.record.ended_at = Some(Utc::now());
                        entry.control = None;
                    }
                    SessionStatus::Running => {
                        entry.record.status = SessionStatus::Ended;
                        entry.record.ended_at = Some(Utc::now());
                        entry.control = None;
                    }
                }
            }
            tracing::debug!(session = %session_id, "session stream drained");
        });
    }

    /// Look up one session.
    pub async fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.record.clone())
    }

    /// All known sessions, newest first.
    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// The most recent session for `role` holding a resumable provider
    /// session id.
    pub async fn find_predecessor(&self, role: AgentRole) -> Option<SessionRecord> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| e.record.role == role && e.record.provider_session_id.is_some())
            .max_by_key(|e| e.record.started_at)
            .map(|e| e.record.clone())
    }

    /// Send a message into a running session.
    ///
    /// # Errors
    /// Unknown session, or a session without a live control half.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let control = self.control(session_id).await?;
        control.send_message(text).await
    }

    /// Interrupt a running session (idempotent).
    ///
    /// # Errors
    /// Unknown session.
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let control = self.control(session_id).await?;
        control.interrupt().await
    }

    /// Suspend a running session. Requires a captured provider session id.
    ///
    /// # Errors
    /// Unknown session, wrong state, or a session that never delivered its
    /// provider id.
    pub async fn suspend_session(&self, session_id: &str, reason: &str) -> Result<SessionRecord> {
        let control = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?;
            if !entry.record.status.can_transition(SessionStatus::Suspended) {
                bail!(
                    "cannot suspend session '{session_id}' from state {}",
                    entry.record.status
                );
            }
            if entry.record.provider_session_id.is_none() {
                bail!("cannot suspend session '{session_id}': no provider session id captured");
            }
            entry.record.status = SessionStatus::Suspended;
            entry.record.suspend_reason = Some(reason.to_owned());
            entry.control.take()
        };
        if let Some(control) = control {
            control.close().await?;
        }
        tracing::info!(session = %session_id, reason, "session suspended");
        self.session(session_id)
            .await
            .ok_or_else(|| anyhow!("session '{session_id}' vanished during suspend"))
    }

    /// Resume a suspended session with a fresh provider process, driving
    /// its stream through the manager again.
    ///
    /// # Errors
    /// Unknown session, wrong state, or launch failure.
    pub async fn resume_session(
        &self,
        session_id: &str,
        executable: &str,
    ) -> Result<SessionRecord> {
        let launched = self.relaunch(session_id, executable, None).await?;
        let agent_id = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|e| e.record.agent_id.clone())
                .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?
        };
        self.spawn_drive_task(session_id.to_owned(), agent_id, launched);
        self.session(session_id)
            .await
            .ok_or_else(|| anyhow!("session '{session_id}' vanished during resume"))
    }

    /// Resume a suspended session and hand the stream to the caller instead
    /// of the manager's drive task (predecessor consultation). The caller
    /// is responsible for suspending or ending the session afterwards.
    ///
    /// # Errors
    /// Unknown session, wrong state, or launch failure.
    pub async fn resume_with_stream(
        &self,
        session_id: &str,
        executable: &str,
        prompt: Option<String>,
    ) -> Result<(Arc<dyn SessionControl>, mpsc::Receiver<AgentMessage>)> {
        let messages = self.relaunch(session_id, executable, prompt).await?;
        let control = self.control(session_id).await?;
        Ok((control, messages))
    }

    /// Common resume path: state checks, relaunch with `--resume`, record
    /// updates. Returns the new message stream.
    async fn relaunch(
        &self,
        session_id: &str,
        executable: &str,
        prompt: Option<String>,
    ) -> Result<mpsc::Receiver<AgentMessage>> {
        let (provider_id, working_directory) = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?;
            if !entry.record.status.can_transition(SessionStatus::Running) {
                bail!(
                    "cannot resume session '{session_id}' from state {}",
                    entry.record.status
                );
            }
            let provider_id = entry
                .record
                .provider_session_id
                .clone()
                .ok_or_else(|| anyhow!("session '{session_id}' has no provider session id"))?;
            (provider_id, entry.record.working_directory.clone())
        };

        let launched = self
            .launcher
            .launch(&LaunchSpec {
                executable: executable.to_owned(),
                extra_args: Vec::new(),
                working_directory,
                resume: Some(provider_id),
                prompt,
            })
            .await?;

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session '{session_id}' vanished during resume"))?;
        entry.record.status = SessionStatus::Running;
        entry.record.suspend_reason = None;
        entry.control = Some(Arc::clone(&launched.control));
        Ok(launched.messages)
    }

    /// Close a session and mark it ended.
    ///
    /// # Errors
    /// Unknown session.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionRecord> {
        let control = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?;
            if !entry.record.status.is_terminal() {
                entry.record.status = SessionStatus::Ended;
                entry.record.ended_at = Some(Utc::now());
            }
            entry.control.take()
        };
        if let Some(control) = control {
            control.close().await?;
        }
        self.session(session_id)
            .await
            .ok_or_else(|| anyhow!("session '{session_id}' vanished during end"))
    }

    /// The persisted transcript of a session, in emission order.
    ///
    /// # Errors
    /// Store failures.
    pub fn transcript(&self, session_id: &str) -> Result<Vec<AgentMessage>> {
        let messages = self.store.list(&ElementFilter {
            element_type: Some(ElementType::Message),
            ..ElementFilter::default()
        })?;

        let mut entries: Vec<(i64, u64, AgentMessage)> = Vec::new();
        for el in messages {
            if el.metadata.get(TRANSCRIPT_SESSION_KEY).and_then(serde_json::Value::as_str)
                != Some(session_id)
            {
                continue;
            }
            let Some(event) = el.metadata.get("event") else {
                continue;
            };
            let Ok(message) = serde_json::from_value::<AgentMessage>(event.clone()) else {
                continue;
            };
            let seq = el
                .metadata
                .get("seq")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            entries.push((el.created_at.timestamp_micros(), seq, message));
        }
        // createdAt first; insertion order breaks ties.
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().map(|(_, _, m)| m).collect())
    }

    async fn control(&self, session_id: &str) -> Result<Arc<dyn SessionControl>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?
            .control
            .clone()
            .ok_or_else(|| anyhow!("session '{session_id}' has no live connection"))
    }
}

/// Persist one normalized message as a transcript Message element.
fn persist_transcript(
    store: &Store,
    actor: &str,
    session_id: &str,
    agent_id: &ElementId,
    seq: u64,
    message: &AgentMessage,
) -> Result<()> {
    let now = Utc::now();
    let id = store.mint_id(ElementType::Message, actor, now)?;

    let mut metadata = serde_json::Map::new();
    metadata.insert(TRANSCRIPT_SESSION_KEY.to_owned(), session_id.into());
    metadata.insert("agentId".to_owned(), agent_id.to_string().into());
    metadata.insert("seq".to_owned(), seq.into());
    metadata.insert("event".to_owned(), serde_json::to_value(message)?);
    metadata.insert("suppressInbox".to_owned(), true.into());

    let el = Element::new(id, ElementType::Message, actor, now)?.with_metadata(metadata)?;
    store.create(&el)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::LaunchedSession;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Scripted launcher: each launch hands out the next canned stream.
    struct FakeLauncher {
        scripts: StdMutex<Vec<Vec<AgentMessage>>>,
        launches: StdMutex<Vec<LaunchSpec>>,
    }

    struct FakeControl {
        closed: StdMutex<bool>,
    }

    #[async_trait]
    impl SessionControl for FakeControl {
        async fn send_message(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            *self.closed.lock().expect("lock") = true;
            Ok(())
        }
    }

    #[async_trait]
    impl SessionLauncher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSession> {
            self.launches.lock().expect("lock").push(spec.clone());
            let script = {
                let mut scripts = self.scripts.lock().expect("lock");
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for message in script {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                // Keep the stream open: the fake never closes on its own so
                // lifecycle transitions stay test-driven.
                std::future::pending::<()>().await;
            });
            Ok(LaunchedSession {
                control: Arc::new(FakeControl {
                    closed: StdMutex::new(false),
                }),
                messages: rx,
            })
        }
    }

    fn init_script(provider_id: &str) -> Vec<AgentMessage> {
        vec![
            AgentMessage::System {
                subtype: "init".to_owned(),
                session_id: Some(provider_id.to_owned()),
            },
            AgentMessage::Assistant {
                content: "ready".to_owned(),
            },
        ]
    }

    async fn fixture(scripts: Vec<Vec<AgentMessage>>) -> (SessionManager, ElementId) {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let now = Utc::now();
        let agent_id = store
            .mint_id(ElementType::Entity, "el-boot01", now)
            .expect("id");
        let mut agent =
            Element::new(agent_id.clone(), ElementType::Entity, "el-boot01", now).expect("valid");
        AgentConfig {
            role: AgentRole::Steward,
            worker_mode: None,
            steward_focus: Some(stoneforge_core::model::StewardFocus::Merge),
            triggers: Vec::new(),
            channel: None,
            executables: vec!["claude".to_owned()],
        }
        .write_to(&mut agent)
        .expect("config");
        store.create(&agent).expect("create agent");

        let launcher = Arc::new(FakeLauncher {
            scripts: StdMutex::new(scripts),
            launches: StdMutex::new(Vec::new()),
        });
        (
            SessionManager::new(store, launcher, "el-boot01"),
            agent_id,
        )
    }

    fn opts() -> StartOptions {
        StartOptions {
            executable: "claude".to_owned(),
            working_directory: PathBuf::from("."),
            prompt: None,
            extra_args: Vec::new(),
        }
    }

    async fn wait_for_running(manager: &SessionManager, session_id: &str) {
        for _ in 0..100 {
            if manager.session(session_id).await.map(|r| r.status)
                == Some(SessionStatus::Running)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("session never reached running");
    }

    #[tokio::test]
    async fn init_event_promotes_to_running_and_captures_provider_id() {
        let (manager, agent_id) = fixture(vec![init_script("prov-1")]).await;
        let record = manager.start_session(&agent_id, &opts()).await.expect("start");
        assert_eq!(record.status, SessionStatus::Starting);

        wait_for_running(&manager, &record.session_id).await;
        let record = manager
            .session(&record.session_id)
            .await
            .expect("record");
        assert_eq!(record.provider_session_id.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn suspend_requires_provider_session_id() {
        let (manager, agent_id) = fixture(vec![Vec::new()]).await;
        let record = manager.start_session(&agent_id, &opts()).await.expect("start");

        // Still starting, no init seen: suspension is refused.
        let err = manager
            .suspend_session(&record.session_id, "parked")
            .await
            .expect_err("no provider id");
        assert!(err.to_string().contains("cannot suspend"));
    }

    #[tokio::test]
    async fn suspend_then_resume_walks_the_state_machine() {
        let (manager, agent_id) =
            fixture(vec![init_script("prov-9"), init_script("prov-9")]).await;
        let record = manager.start_session(&agent_id, &opts()).await.expect("start");
        wait_for_running(&manager, &record.session_id).await;

        let suspended = manager
            .suspend_session(&record.session_id, "waiting on review")
            .await
            .expect("suspend");
        assert_eq!(suspended.status, SessionStatus::Suspended);
        assert_eq!(suspended.suspend_reason.as_deref(), Some("waiting on review"));

        let resumed = manager
            .resume_session(&record.session_id, "claude")
            .await
            .expect("resume");
        assert_eq!(resumed.status, SessionStatus::Running);
        assert!(resumed.suspend_reason.is_none());
    }

    #[tokio::test]
    async fn predecessor_is_latest_resumable_session_of_role() {
        let (manager, agent_id) =
            fixture(vec![init_script("prov-a"), init_script("prov-b")]).await;
        let first = manager.start_session(&agent_id, &opts()).await.expect("start");
        wait_for_running(&manager, &first.session_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = manager.start_session(&agent_id, &opts()).await.expect("start");
        wait_for_running(&manager, &second.session_id).await;

        let predecessor = manager
            .find_predecessor(AgentRole::Steward)
            .await
            .expect("predecessor");
        assert_eq!(predecessor.session_id, second.session_id);
        assert!(manager.find_predecessor(AgentRole::Worker).await.is_none());
    }

    #[tokio::test]
    async fn transcript_preserves_emission_order() {
        let (manager, agent_id) = fixture(vec![init_script("prov-1")]).await;
        let record = manager.start_session(&agent_id, &opts()).await.expect("start");
        wait_for_running(&manager, &record.session_id).await;
        // Give the drive task a beat to persist both messages.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let transcript = manager.transcript(&record.session_id).expect("transcript");
        assert_eq!(transcript.len(), 2);
        assert!(matches!(transcript[0], AgentMessage::System { .. }));
        assert!(matches!(transcript[1], AgentMessage::Assistant { .. }));
    }

    #[tokio::test]
    async fn end_session_is_terminal() {
        let (manager, agent_id) = fixture(vec![init_script("prov-1")]).await;
        let record = manager.start_session(&agent_id, &opts()).await.expect("start");
        wait_for_running(&manager, &record.session_id).await;

        let ended = manager
            .end_session(&record.session_id)
            .await
            .expect("end");
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());

        assert!(manager
            .suspend_session(&record.session_id, "late")
            .await
            .is_err());
    }
}
