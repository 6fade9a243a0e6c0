//! World event system.
//!
//! Every world owns one [`WorldEventBus`] with five logical channels:
//!
//! - **message** — finalized chat messages (human, agent, system senders)
//! - **sse** — fine-grained streaming lifecycle (`start`/`chunk`/`complete`/`error`)
//! - **world** — tool lifecycle and activity transitions
//! - **system** — generic envelope used by HITL requests and chat-title updates
//! - **tool** — inbound tool-approval decisions from a transport back into
//!   the pipeline
//!
//! Events fan out to attached [`EventSink`]s (agent runtimes, realtime
//! subscriptions). Delivery is best-effort: a sink failure is logged and
//! swallowed, never propagated to the emitter.
//!
//! # The chatId contract
//!
//! Every event carries a `chatId`. When an emitter passes `None` on a
//! chat-scoped channel the bus fills in the world's current chat *at
//! emission time*; the value is pinned from then on and never changes when
//! the current-chat pointer moves. Activity events (`response-start`,
//! `response-end`, `idle`) are world-level and keep `chatId = null`.

use crate::worldllm::chat_completion::{Role, ToolCall, ToolCallStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Payload of a finalized chat message on the `message` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEventPayload {
    pub content: String,
    pub sender: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(rename = "replyToMessageId", skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "tool_call_id", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(
        rename = "toolCallStatus",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub tool_call_status: HashMap<String, ToolCallStatus>,
}

impl MessageEventPayload {
    /// A plain text message from `sender`, with a fresh message id.
    pub fn text(content: impl Into<String>, sender: impl Into<String>, chat_id: Option<String>) -> Self {
        MessageEventPayload {
            content: content.into(),
            sender: sender.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            chat_id,
            reply_to_message_id: None,
            role: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_call_status: HashMap::new(),
        }
    }
}

/// Streaming lifecycle stage on the `sse` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SseEventType {
    Start,
    Chunk,
    Complete,
    Error,
}

/// Payload of one streaming event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEventPayload {
    #[serde(rename = "type")]
    pub event_type: SseEventType,
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

/// Kind discriminator for `world`-channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldEventType {
    #[serde(rename = "tool-start")]
    ToolStart,
    #[serde(rename = "tool-progress")]
    ToolProgress,
    #[serde(rename = "tool-result")]
    ToolResult,
    #[serde(rename = "tool-error")]
    ToolError,
    #[serde(rename = "response-start")]
    ResponseStart,
    #[serde(rename = "response-end")]
    ResponseEnd,
    #[serde(rename = "idle")]
    Idle,
}

impl WorldEventType {
    /// Activity transitions are world-level; tool lifecycle events are
    /// chat-scoped.
    pub fn is_activity(self) -> bool {
        matches!(
            self,
            WorldEventType::ResponseStart | WorldEventType::ResponseEnd | WorldEventType::Idle
        )
    }
}

/// Payload of a `world`-channel event (tool lifecycle or activity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldActivityPayload {
    #[serde(rename = "type")]
    pub event_type: WorldEventType,
    /// Originator, e.g. `"agent:alice"` or `"world"`.
    pub source: String,
    #[serde(rename = "agentName", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    /// Tool name / call id / error details for tool lifecycle events.
    #[serde(rename = "toolExecution", skip_serializing_if = "Option::is_none")]
    pub tool_execution: Option<serde_json::Value>,
    #[serde(rename = "pendingOperations", skip_serializing_if = "Option::is_none")]
    pub pending_operations: Option<u64>,
    #[serde(rename = "activityId", skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<u64>,
    #[serde(rename = "activeSources", skip_serializing_if = "Option::is_none")]
    pub active_sources: Option<Vec<String>>,
}

/// Generic `system`-channel envelope. The `kind` discriminates consumers
/// (e.g. `"hitl-option-request"`, `"chat-title-updated"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventPayload {
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

/// A transport's verdict on a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// How long an approval stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    /// Valid for exactly this call. Deprecated for reuse purposes: never
    /// cached by the session-approval matcher.
    Once,
    /// Cached in agent memory and reused by future matching calls.
    Session,
}

/// Inbound `tool`-channel payload: a decision from the transport addressed
/// to a pending tool call inside some agent's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponsePayload {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub decision: ApprovalDecision,
    pub scope: ApprovalScope,
    #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(rename = "toolArgs", skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(rename = "workingDirectory", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

/// One event on a world's bus: a tagged union over the five channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload", rename_all = "lowercase")]
pub enum WorldEvent {
    Message(MessageEventPayload),
    Sse(SseEventPayload),
    World(WorldActivityPayload),
    System(SystemEventPayload),
    Tool(ToolResponsePayload),
}

impl WorldEvent {
    /// The chat this event is tagged with, if any.
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            WorldEvent::Message(p) => p.chat_id.as_deref(),
            WorldEvent::Sse(p) => p.chat_id.as_deref(),
            WorldEvent::World(p) => p.chat_id.as_deref(),
            WorldEvent::System(p) => p.chat_id.as_deref(),
            WorldEvent::Tool(p) => p.chat_id.as_deref(),
        }
    }

    /// Wire name of the channel this event travels on.
    pub fn channel(&self) -> &'static str {
        match self {
            WorldEvent::Message(_) => "message",
            WorldEvent::Sse(_) => "sse",
            WorldEvent::World(_) => "world",
            WorldEvent::System(_) => "system",
            WorldEvent::Tool(_) => "tool",
        }
    }

    /// World-level activity transitions bypass chat filtering.
    pub fn is_activity(&self) -> bool {
        matches!(self, WorldEvent::World(p) if p.event_type.is_activity())
    }

    fn set_chat_id(&mut self, chat_id: Option<String>) {
        match self {
            WorldEvent::Message(p) => p.chat_id = chat_id,
            WorldEvent::Sse(p) => p.chat_id = chat_id,
            WorldEvent::World(p) => p.chat_id = chat_id,
            WorldEvent::System(p) => p.chat_id = chat_id,
            WorldEvent::Tool(p) => p.chat_id = chat_id,
        }
    }
}

/// Decide whether an event passes a subscription's chat scope.
///
/// A subscription with no chat scope receives everything. A chat-scoped
/// subscription receives chat-tagged events on exact `chatId` match, plus
/// world-level events (activity transitions, untagged system events); it
/// only drops events tagged with a *different, non-null* chat.
pub fn event_matches_chat(event: &WorldEvent, scope_chat_id: Option<&str>) -> bool {
    let scope = match scope_chat_id {
        None => return true,
        Some(s) => s,
    };
    match event {
        WorldEvent::World(p) if p.event_type.is_activity() => {
            p.chat_id.as_deref().map_or(true, |c| c == scope)
        }
        WorldEvent::System(p) => p.chat_id.as_deref().map_or(true, |c| c == scope),
        _ => event.chat_id() == Some(scope),
    }
}

/// Receiver side of the bus: agent runtimes and realtime subscriptions
/// implement this to observe a world's events.
///
/// Implementations must be `Send + Sync`; delivery happens from whatever
/// task emitted the event. Errors are logged by the bus and swallowed;
/// the emitter's correctness never depends on delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &WorldEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Opaque handle returned by [`WorldEventBus::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Per-world multi-channel event emitter.
pub struct WorldEventBus {
    world_id: String,
    current_chat_id: RwLock<Option<String>>,
    sinks: RwLock<HashMap<u64, Arc<dyn EventSink>>>,
    next_sink_id: AtomicU64,
}

impl WorldEventBus {
    pub fn new(world_id: impl Into<String>) -> Self {
        WorldEventBus {
            world_id: world_id.into(),
            current_chat_id: RwLock::new(None),
            sinks: RwLock::new(HashMap::new()),
            next_sink_id: AtomicU64::new(1),
        }
    }

    /// The world this bus belongs to.
    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    /// Update the default chat used when emitters pass no explicit chatId.
    /// Already-emitted events keep whatever value they were pinned with.
    pub async fn set_current_chat(&self, chat_id: Option<String>) {
        *self.current_chat_id.write().await = chat_id;
    }

    pub async fn current_chat(&self) -> Option<String> {
        self.current_chat_id.read().await.clone()
    }

    /// Attach a sink; it receives every subsequent event until detached.
    pub async fn attach(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = self.next_sink_id.fetch_add(1, Ordering::SeqCst);
        self.sinks.write().await.insert(id, sink);
        SinkId(id)
    }

    /// Detach a previously attached sink. Unknown ids are a no-op.
    pub async fn detach(&self, id: SinkId) {
        self.sinks.write().await.remove(&id.0);
    }

    /// Number of currently attached sinks.
    pub async fn sink_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    /// Emit an event to every attached sink and return the event as pinned.
    ///
    /// Events on chat-scoped channels with `chatId = None` get the world's
    /// current chat filled in; activity transitions keep `None`. Sink
    /// failures are logged and swallowed.
    pub async fn emit(&self, mut event: WorldEvent) -> WorldEvent {
        if event.chat_id().is_none() && !event.is_activity() {
            let current = self.current_chat_id.read().await.clone();
            if current.is_some() {
                event.set_chat_id(current);
            }
        }

        let sinks: Vec<Arc<dyn EventSink>> =
            self.sinks.read().await.values().cloned().collect();
        for sink in sinks {
            if let Err(e) = sink.deliver(&event).await {
                log::warn!(
                    "world '{}': event sink failed on {} event: {}",
                    self.world_id,
                    event.channel(),
                    e
                );
            }
        }
        event
    }
}
