//! Provider-agnostic agent messages and wire-event normalization.
//!
//! Providers bundle several block types into one wire message; normalization
//! **decomposes** them: text blocks coalesce into a single `assistant`/`user`
//! event preceding the tool blocks, empty bundles are dropped, and a bundle
//! with no text and no tool blocks is suppressed entirely. Streaming tool
//! deltas are buffered per item id and flushed at the item's completion
//! boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

/// One tool invocation inside a message stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Provider-assigned invocation id, matched by `tool_result`.
    pub id: String,
    /// Tool input payload.
    pub input: Value,
}

/// Normalized, provider-agnostic message emitted by a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Provider lifecycle event; `subtype = "init"` carries the
    /// freshly-minted provider session id.
    System {
        /// Event subtype.
        subtype: String,
        /// Provider session id, when the event carries one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Text from the model.
    Assistant {
        /// Coalesced text content.
        content: String,
    },
    /// A user turn.
    User {
        /// Coalesced text content.
        content: String,
    },
    /// One invoked tool.
    ToolUse {
        /// The invocation.
        tool: ToolCall,
    },
    /// A tool's result; may arrive out of order relative to other tools.
    ToolResult {
        /// Result content, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// The invocation this result answers.
        tool_id: String,
    },
    /// Terminal marker for a turn.
    Result {
        /// Result subtype (`success`, `error`, …).
        subtype: String,
        /// Final content, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Provider or transport failure.
    Error {
        /// Human-readable description.
        content: String,
        /// Raw wire payload, when one exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },
}

impl AgentMessage {
    /// Whether this message ends a turn.
    #[must_use]
    pub const fn is_turn_end(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

// ---------------------------------------------------------------------------
// Delta buffering
// ---------------------------------------------------------------------------

/// Buffers streamed tool-input fragments per item id until the item
/// completes.
#[derive(Debug, Default)]
pub struct DeltaBuffer {
    partial: HashMap<String, String>,
}

impl DeltaBuffer {
    /// Append a fragment for `id`.
    pub fn push(&mut self, id: &str, fragment: &str) {
        self.partial.entry(id.to_owned()).or_default().push_str(fragment);
    }

    /// Take the accumulated input for `id`, if any was buffered.
    pub fn flush(&mut self, id: &str) -> Option<String> {
        self.partial.remove(id)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize one provider wire event into zero or more [`AgentMessage`]s.
///
/// Recognized shapes (the stream-JSON dialect spoken by headless agent
/// CLIs):
///
/// - `{"type":"system","subtype":…,"session_id":…}`
/// - `{"type":"assistant"|"user","message":{"content":[blocks…]}}` where a
///   block is `text`, `tool_use`, or `tool_result`
/// - `{"type":"result","subtype":…,"result":…}`
/// - `{"type":"error","message":…}`
/// - `{"type":"tool_delta","id":…,"partial":…}` /
///   `{"type":"tool_stop","id":…,"name":…}` — buffered through `deltas`
///
/// Unrecognized event types yield nothing (forward compatibility).
pub fn normalize_event(event: &Value, deltas: &mut DeltaBuffer) -> Vec<AgentMessage> {
    let Some(event_type) = event.get("type").and_then(Value::as_str) else {
        return vec![AgentMessage::Error {
            content: "wire event without a type".to_owned(),
            raw: Some(event.clone()),
        }];
    };

    match event_type {
        "system" => vec![AgentMessage::System {
            subtype: event
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            session_id: event
                .get("session_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        }],
        "assistant" => decompose_bundle(event, true),
        "user" => decompose_bundle(event, false),
        "result" => vec![AgentMessage::Result {
            subtype: event
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("success")
                .to_owned(),
            content: event
                .get("result")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        }],
        "error" => vec![AgentMessage::Error {
            content: event
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider error")
                .to_owned(),
            raw: Some(event.clone()),
        }],
        "tool_delta" => {
            if let (Some(id), Some(partial)) = (
                event.get("id").and_then(Value::as_str),
                event.get("partial").and_then(Value::as_str),
            ) {
                deltas.push(id, partial);
            }
            Vec::new()
        }
        "tool_stop" => normalize_tool_stop(event, deltas),
        other => {
            tracing::debug!(event_type = other, "ignoring unrecognized wire event");
            Vec::new()
        }
    }
}

/// Decompose an assistant/user bundle: coalesced text first, then tool
/// blocks in order.
fn decompose_bundle(event: &Value, assistant: bool) -> Vec<AgentMessage> {
    let content = event.get("message").and_then(|m| m.get("content"));

    let mut text = String::new();
    let mut tools = Vec::new();

    match content {
        // Some providers send plain-string content.
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        tools.push(AgentMessage::ToolUse {
                            tool: ToolCall {
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_owned(),
                                id: block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_owned(),
                                input: block.get("input").cloned().unwrap_or(Value::Null),
                            },
                        });
                    }
                    Some("tool_result") => {
                        tools.push(AgentMessage::ToolResult {
                            content: block
                                .get("content")
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned),
                            tool_id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut out = Vec::with_capacity(tools.len() + 1);
    if !text.is_empty() {
        out.push(if assistant {
            AgentMessage::Assistant { content: text }
        } else {
            AgentMessage::User { content: text }
        });
    }
    out.extend(tools);
    out
}

fn normalize_tool_stop(event: &Value, deltas: &mut DeltaBuffer) -> Vec<AgentMessage> {
    let Some(id) = event.get("id").and_then(Value::as_str) else {
        return Vec::new();
    };
    let buffered = deltas.flush(id).unwrap_or_default();
    let input = serde_json::from_str(&buffered).unwrap_or(Value::String(buffered));
    vec![AgentMessage::ToolUse {
        tool: ToolCall {
            name: event
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            id: id.to_owned(),
            input,
        },
    }]
}
