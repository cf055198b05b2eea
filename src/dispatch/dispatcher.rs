//! The dispatch transaction: assign a ready task to an agent and notify the
//! agent's channel, atomically.
//!
//! Ordering inside the transaction is deliberate: the channel is resolved
//! *before* the assignment write so a missing channel can never leave an
//! orphaned assignment behind, and the notification is only observable once
//! the assignment has committed.

use chrono::{DateTime, Utc};

use stoneforge_core::error::{Result, StoneforgeError};
use stoneforge_core::model::{AgentConfig, Element, ElementId, ElementType};
use stoneforge_core::store::{Isolation, Store};

use crate::dispatch::assign::{assign_to_agent, AssignOptions};

/// Tag stamped on every dispatch notification document.
pub const DISPATCH_NOTIFICATION_TAG: &str = "dispatch-notification";

/// Options for one dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Priority recorded on the notification message.
    pub priority: Option<i64>,
    /// Assignment overrides.
    pub assign: AssignOptions,
}

/// What a successful dispatch produced.
#[derive(Clone, Debug)]
pub struct DispatchResult {
    /// The task after assignment.
    pub task: Element,
    /// The agent the task went to.
    pub agent: Element,
    /// The notification message posted to the channel.
    pub notification: Element,
    /// The channel it was posted to.
    pub channel: Element,
    /// Whether the assignee changed.
    pub is_new_assignment: bool,
    /// When the dispatch committed.
    pub dispatched_at: DateTime<Utc>,
}

/// Issues atomic assign+notify transactions against one store.
pub struct Dispatcher<'a> {
    store: &'a Store,
    actor: String,
}

impl<'a> Dispatcher<'a> {
    /// A dispatcher acting as `actor`.
    #[must_use]
    pub fn new(store: &'a Store, actor: &str) -> Self {
        Self {
            store,
            actor: actor.to_owned(),
        }
    }

    /// Dispatch `task` to `agent`.
    ///
    /// # Errors
    /// `NotFound` if the task or agent is missing, `EntityNotFound` if the
    /// agent has no channel, plus assignment and store failures. On any
    /// error nothing is written.
    pub fn dispatch(
        &self,
        task_id: &ElementId,
        agent_id: &ElementId,
        opts: &DispatchOptions,
    ) -> Result<DispatchResult> {
        let now = Utc::now();
        // Ids are minted outside the transaction (minting takes the store
        // lock itself).
        let document_id = self
            .store
            .mint_id(ElementType::Document, &self.actor, now)?;
        let message_id = self.store.mint_id(ElementType::Message, &self.actor, now)?;

        let result = self.store.transaction(Isolation::Immediate, |tx| {
            // 1-2. Fetch both parties and resolve the channel before any
            // write.
            let task = tx.require(task_id)?;
            let agent = tx.require(agent_id)?;
            let config = AgentConfig::from_element(&agent)?;
            let channel_id = config.channel.ok_or_else(|| StoneforgeError::EntityNotFound {
                what: "channel",
                id: agent_id.to_string(),
            })?;
            let channel = tx.require(&channel_id)?;

            // 3. Assign.
            let assignment = assign_to_agent(tx, task_id, agent_id, &self.actor, &opts.assign)?;

            // 4. Compose the notification document and message.
            let document = self.notification_document(&task, &agent, document_id.clone(), now)?;
            tx.create(&document)?;
            let notification = self.notification_message(
                message_id.clone(),
                task_id,
                &channel_id,
                &document.id,
                opts.priority,
                now,
            )?;
            tx.create(&notification)?;

            Ok(DispatchResult {
                task: assignment.task,
                agent,
                notification,
                channel,
                is_new_assignment: assignment.is_new_assignment,
                dispatched_at: now,
            })
        });

        match &result {
            Ok(r) => tracing::info!(
                task = %task_id,
                agent = %agent_id,
                new = r.is_new_assignment,
                "dispatched task"
            ),
            Err(e) => tracing::warn!(task = %task_id, agent = %agent_id, error = %e, "dispatch failed"),
        }
        result
    }

    fn notification_document(
        &self,
        task: &Element,
        agent: &Element,
        id: ElementId,
        now: DateTime<Utc>,
    ) -> Result<Element> {
        let title = task
            .metadata
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("(untitled)");
        let body = format!(
            "Task {} assigned to {}.\n\n{title}",
            task.id, agent.id
        );

        let mut metadata = serde_json::Map::new();
        metadata.insert("contentType".to_owned(), "text".into());
        metadata.insert("content".to_owned(), body.into());

        Element::new(id, ElementType::Document, &self.actor, now)?
            .with_tags(vec![DISPATCH_NOTIFICATION_TAG.to_owned()])?
            .with_metadata(metadata)
    }

    fn notification_message(
        &self,
        id: ElementId,
        task_id: &ElementId,
        channel_id: &ElementId,
        document_id: &ElementId,
        priority: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Element> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("type".to_owned(), "task-assignment".into());
        metadata.insert("taskId".to_owned(), task_id.to_string().into());
        if let Some(priority) = priority {
            metadata.insert("priority".to_owned(), priority.into());
        }
        // Channel members should not accumulate inbox entries for routine
        // dispatch traffic.
        metadata.insert("suppressInbox".to_owned(), true.into());
        metadata.insert("channel".to_owned(), channel_id.to_string().into());
        metadata.insert("document".to_owned(), document_id.to_string().into());

        Element::new(id, ElementType::Message, &self.actor, now)?.with_metadata(metadata)
    }
}
