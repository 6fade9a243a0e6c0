//! Shared primitives for provider-agnostic LLM access.
//!
//! The runtime never talks to a concrete vendor SDK.  Everything it needs
//! from an LLM is expressed by the [`ChatCompletion`] trait plus the
//! lightweight data types in this module: chat messages with native tool
//! calls in the OpenAI-compatible shape, streaming chunks, and tool schema
//! definitions.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worldllm::chat_completion::{AgentMessage, ChatCompletion, Role};
//!
//! # async fn example(client: Arc<dyn ChatCompletion>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let response = client
//!     .complete(&[AgentMessage::user("Who are you?", "human")], &[])
//!     .await?;
//! println!("Assistant: {}", response.content);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::pin::Pin;

/// The role attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (human participants and cross-agent messages).
    User,
    /// An assistant authored message (LLM responses, possibly with tool calls).
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool,
}

/// The function half of a native tool call, OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// JSON-encoded arguments exactly as the provider returned them.
    pub arguments: String,
}

/// A single tool call returned by the LLM in a native function-calling
/// response: `{id, type: "function", function: {name, arguments}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Always `"function"` for the providers the runtime targets.
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function name and raw JSON arguments.
    pub function: ToolFunction,
}

impl ToolCall {
    /// Build a `type: "function"` call from a name and JSON arguments.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the call's arguments as JSON, returning `{}` when the provider
    /// sent an empty string.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

/// Completion bookkeeping for one tool call inside an agent's memory.
///
/// `complete` flips to `true` once a decision (approve/deny) arrived and the
/// call was resolved; `result` then carries the decision scope and outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallStatus {
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// One entry in an agent's memory: a chat message plus the correlation
/// fields the runtime needs to route, filter, and replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
    /// Who published the message (`"human"`, an agent id, or `"system"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// The chat the message belongs to. `None` is a valid key (pre-chat
    /// messages), not a wildcard.
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "replyToMessageId", skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    /// Native tool calls requested by the assistant. Empty for all other
    /// message kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `role: tool` results to correlate with the assistant call.
    #[serde(rename = "tool_call_id", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Per-call completion bookkeeping, keyed by tool-call id.
    #[serde(
        rename = "toolCallStatus",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub tool_call_status: HashMap<String, ToolCallStatus>,
}

impl AgentMessage {
    /// A bare message with the given role, content, and sender.
    pub fn new(role: Role, content: impl Into<String>, sender: impl Into<String>) -> Self {
        AgentMessage {
            role,
            content: content.into(),
            sender: Some(sender.into()),
            chat_id: None,
            created_at: Utc::now(),
            message_id: None,
            reply_to_message_id: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_call_status: HashMap::new(),
        }
    }

    /// A user-role message, the shape incoming human and cross-agent turns
    /// take inside agent memory.
    pub fn user(content: impl Into<String>, sender: impl Into<String>) -> Self {
        AgentMessage::new(Role::User, content, sender)
    }

    /// An assistant-role message.
    pub fn assistant(content: impl Into<String>, sender: impl Into<String>) -> Self {
        AgentMessage::new(Role::Assistant, content, sender)
    }

    /// A tool-result message correlated to `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        let mut msg = AgentMessage::new(Role::Tool, content, sender);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Builder-style chat tag.
    pub fn with_chat_id(mut self, chat_id: Option<String>) -> Self {
        self.chat_id = chat_id;
        self
    }

    /// Builder-style message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Provider-agnostic tool schema passed to the LLM along with a request.
///
/// Serialized as an OpenAI-compatible `tools` array entry before
/// transmission by whatever concrete client implements [`ChatCompletion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// The assistant output of one completed LLM round-trip.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Final assistant text. May be empty when the provider answered with
    /// tool calls only.
    pub content: String,
    /// Native tool calls selected by the provider, in request order.
    pub tool_calls: Vec<ToolCall>,
}

/// A chunk of content in a streaming response.
#[derive(Clone, Debug, Default)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk. May be empty for chunks
    /// that carry only a finish reason.
    pub content: String,
    /// Provider completion status (e.g. `"stop"`, `"tool_calls"`).
    pub finish_reason: Option<String>,
    /// Fully accumulated tool calls, delivered by implementations on the
    /// final chunk once all argument deltas have been assembled.
    pub tool_calls: Vec<ToolCall>,
}

impl MessageChunk {
    /// A plain content delta.
    pub fn delta(content: impl Into<String>) -> Self {
        MessageChunk {
            content: content.into(),
            ..MessageChunk::default()
        }
    }
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Type alias for the future returned by [`ChatCompletion::complete_stream`].
pub type ChunkStreamFuture<'a> = Pin<
    Box<
        dyn std::future::Future<Output = Result<Option<ChunkStream>, Box<dyn Error + Send + Sync>>>
            + Send
            + 'a,
    >,
>;

/// Trait-driven abstraction over a concrete chat-completion provider.
///
/// Implementations translate the runtime's messages into the provider wire
/// format and return responses in a uniform shape.  The abstraction
/// deliberately excludes conversation bookkeeping: memory ordering, chat
/// filtering, and tool-loop control all live in the processing pipeline.
///
/// All implementations must be thread-safe (`Send + Sync`) so a single
/// client can serve every agent in a world concurrently.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// `messages` must already include any system priming message.  `tools`
    /// carries the native [`ToolDefinition`]s advertised for this call; an
    /// empty slice means the plain chat path.  On success the returned
    /// [`CompletionResponse`] may carry tool calls, text, or both.
    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolDefinition],
    ) -> Result<CompletionResponse, Box<dyn Error + Send + Sync>>;

    /// Request a streaming response from the provider.
    ///
    /// Implementors in front of providers without streaming support inherit
    /// the default implementation, which resolves to `Ok(None)`; callers then
    /// fall back to [`complete`](ChatCompletion::complete). A returned stream
    /// must yield [`MessageChunk`]s mirroring the provider's incremental
    /// tokens; the final accumulated text is re-assembled by the caller.
    fn complete_stream<'a>(
        &'a self,
        _messages: &'a [AgentMessage],
        _tools: &'a [ToolDefinition],
    ) -> ChunkStreamFuture<'a> {
        Box::pin(async { Ok(None) })
    }

    /// Identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}
