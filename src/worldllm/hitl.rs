//! Human-in-the-loop coordination.
//!
//! Three modalities share this module:
//!
//! 1. **Option requests** — a generic "pick one" question emitted as a
//!    `system` event and awaited by the caller. Resolution comes from a
//!    transport (`submit_option_response`), from the timeout (default
//!    option, if any), or from cancellation.
//! 2. **Tool approval requests** — an assistant `human_intervention.request`
//!    tool call is transformed into a client-addressed synthetic
//!    `client.humanIntervention` call; the pipeline persists the resulting
//!    approval message and halts its turn.
//! 3. **Approval requests for ordinary tools** — when no session approval
//!    covers a tool call, a synthetic `client.requestApproval` call asks
//!    the transport for a decision.
//!
//! Responses arrive on the `tool` channel and are handled by the pipeline;
//! the security gate there verifies the addressed `toolCallId` exists in
//! the target agent's memory before anything executes.

use crate::worldllm::chat_completion::{AgentMessage, Role, ToolCall, ToolCallStatus};
use crate::worldllm::error::WorldError;
use crate::worldllm::event::{SystemEventPayload, WorldEvent, WorldEventBus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Name of the provider-visible tool an agent calls to request intervention.
pub const HUMAN_INTERVENTION_TOOL: &str = "human_intervention.request";
/// Client-addressed synthetic call carrying an intervention request.
pub const CLIENT_HUMAN_INTERVENTION: &str = "client.humanIntervention";
/// Client-addressed synthetic call asking for a tool approval decision.
pub const CLIENT_REQUEST_APPROVAL: &str = "client.requestApproval";

/// One selectable option in a HITL request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlOption {
    pub id: String,
    pub label: String,
}

/// What the caller wants to ask.
#[derive(Debug, Clone)]
pub struct HitlRequestSpec {
    pub world_id: String,
    pub chat_id: Option<String>,
    pub title: String,
    pub message: String,
    pub options: Vec<HitlOption>,
    pub default_option_id: Option<String>,
    /// `None` uses the coordinator's default.
    pub timeout_ms: Option<u64>,
}

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlSource {
    User,
    Timeout,
    Cancel,
}

/// The answer to a HITL request.
#[derive(Debug, Clone)]
pub struct HitlResolution {
    /// `None` when the request timed out without a default option or was
    /// canceled.
    pub option_id: Option<String>,
    pub source: HitlSource,
    pub chat_id: Option<String>,
}

struct PendingRequest {
    world_id: String,
    chat_id: Option<String>,
    default_option_id: Option<String>,
    sender: oneshot::Sender<HitlResolution>,
}

/// Awaitable handle returned by [`HitlCoordinator::request_option`].
pub struct HitlTicket {
    pub request_id: String,
    receiver: oneshot::Receiver<HitlResolution>,
}

impl HitlTicket {
    /// Wait for the request to resolve (user, timeout, or cancel).
    pub async fn resolved(self) -> HitlResolution {
        self.receiver.await.unwrap_or(HitlResolution {
            option_id: None,
            source: HitlSource::Cancel,
            chat_id: None,
        })
    }
}

/// Tracks pending option requests and resolves them exactly once.
pub struct HitlCoordinator {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    default_timeout_ms: u64,
}

impl HitlCoordinator {
    pub fn new(default_timeout_ms: u64) -> Self {
        HitlCoordinator {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout_ms,
        }
    }

    /// Emit a `hitl-option-request` system event and return an awaitable
    /// ticket. The timeout timer starts immediately.
    pub async fn request_option(&self, bus: &WorldEventBus, spec: HitlRequestSpec) -> HitlTicket {
        let request_id = uuid::Uuid::new_v4().to_string();
        let timeout_ms = spec.timeout_ms.unwrap_or(self.default_timeout_ms);
        let (sender, receiver) = oneshot::channel();

        self.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                world_id: spec.world_id.clone(),
                chat_id: spec.chat_id.clone(),
                default_option_id: spec.default_option_id.clone(),
                sender,
            },
        );

        bus.emit(WorldEvent::System(SystemEventPayload {
            kind: "hitl-option-request".to_string(),
            data: serde_json::json!({
                "requestId": request_id,
                "title": spec.title,
                "message": spec.message,
                "options": spec.options,
                "defaultOptionId": spec.default_option_id,
                "timeoutMs": timeout_ms,
            }),
            chat_id: spec.chat_id.clone(),
        }))
        .await;

        let pending = Arc::clone(&self.pending);
        let timer_request_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let entry = pending.lock().await.remove(&timer_request_id);
            if let Some(entry) = entry {
                let resolution = HitlResolution {
                    option_id: entry.default_option_id.clone(),
                    source: HitlSource::Timeout,
                    chat_id: entry.chat_id.clone(),
                };
                let _ = entry.sender.send(resolution);
            }
        });

        HitlTicket {
            request_id,
            receiver,
        }
    }

    /// Resolve a pending request with a user-picked option.
    ///
    /// A `chat_id` that differs from the request's stored chat is rejected
    /// without resolving; the request stays pending.
    pub async fn submit_option_response(
        &self,
        world_id: &str,
        request_id: &str,
        option_id: &str,
        chat_id: Option<&str>,
    ) -> Result<(), WorldError> {
        let mut pending = self.pending.lock().await;
        let entry = pending
            .remove(request_id)
            .ok_or_else(|| WorldError::NotFound(format!("HITL request '{}'", request_id)))?;

        if entry.world_id != world_id {
            let err = WorldError::NotFound(format!(
                "HITL request '{}' in world '{}'",
                request_id, world_id
            ));
            pending.insert(request_id.to_string(), entry);
            return Err(err);
        }
        if let Some(submitted_chat) = chat_id {
            if entry.chat_id.as_deref() != Some(submitted_chat) {
                let err = WorldError::Validation(format!(
                    "Request '{}' belongs to chat '{}'",
                    request_id,
                    entry.chat_id.as_deref().unwrap_or("<none>")
                ));
                pending.insert(request_id.to_string(), entry);
                return Err(err);
            }
        }

        let chat = entry.chat_id.clone();
        let _ = entry.sender.send(HitlResolution {
            option_id: Some(option_id.to_string()),
            source: HitlSource::User,
            chat_id: chat,
        });
        Ok(())
    }

    /// Resolve every pending request for `world_id` as canceled. Used when
    /// a world is deleted.
    pub async fn cancel_world(&self, world_id: &str) {
        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.world_id == world_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(entry) = pending.remove(&id) {
                let chat = entry.chat_id.clone();
                let _ = entry.sender.send(HitlResolution {
                    option_id: None,
                    source: HitlSource::Cancel,
                    chat_id: chat,
                });
            }
        }
    }

    /// Number of unresolved requests (test and introspection hook).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Result of transforming an intervention/approval tool call.
#[derive(Debug, Clone)]
pub struct HitlToolTransform {
    /// The assistant message carrying the client-addressed synthetic call;
    /// the pipeline persists it (idempotently) and halts the turn.
    pub approval_message: AgentMessage,
    /// Always `true`: the turn must not call the LLM again until a decision
    /// arrives on the `tool` channel.
    pub stop_processing: bool,
}

/// Transform an assistant `human_intervention.request` call into a
/// client-addressed `client.humanIntervention` synthetic call.
///
/// The synthetic call id is `hitl_<originalId>` so its eventual tool result
/// is filtered from prepared LLM requests. The pending original call keeps
/// `toolCallStatus[originalId] = {complete: false}` until a decision lands.
pub fn transform_human_intervention(
    original: &ToolCall,
    agent_id: &str,
    chat_id: Option<&str>,
) -> HitlToolTransform {
    let args = original.parsed_arguments().unwrap_or_else(|_| serde_json::json!({}));
    let synthetic_args = serde_json::json!({
        "originalToolCall": original,
        "prompt": args.get("prompt").cloned().unwrap_or(serde_json::Value::Null),
        "options": args.get("options").cloned().unwrap_or(serde_json::Value::Null),
        "context": args.get("context").cloned().unwrap_or(serde_json::Value::Null),
    });
    let synthetic = ToolCall::function(
        format!("hitl_{}", original.id),
        CLIENT_HUMAN_INTERVENTION,
        synthetic_args.to_string(),
    );
    HitlToolTransform {
        approval_message: approval_carrier(synthetic, &original.id, agent_id, chat_id),
        stop_processing: true,
    }
}

/// Build the `client.requestApproval` synthetic message for an ordinary
/// tool call that lacks a session approval.
pub fn build_approval_request(
    original: &ToolCall,
    agent_id: &str,
    chat_id: Option<&str>,
    working_directory: Option<&str>,
) -> AgentMessage {
    let args = original.parsed_arguments().unwrap_or_else(|_| serde_json::json!({}));
    let synthetic_args = serde_json::json!({
        "toolName": original.function.name,
        "toolArgs": args,
        "workingDirectory": working_directory,
        "originalToolCall": original,
    });
    let synthetic = ToolCall::function(
        format!("approval_{}", original.id),
        CLIENT_REQUEST_APPROVAL,
        synthetic_args.to_string(),
    );
    approval_carrier(synthetic, &original.id, agent_id, chat_id)
}

fn approval_carrier(
    synthetic: ToolCall,
    original_call_id: &str,
    agent_id: &str,
    chat_id: Option<&str>,
) -> AgentMessage {
    let mut message = AgentMessage::new(Role::Assistant, "", agent_id)
        .with_chat_id(chat_id.map(|s| s.to_string()))
        .with_message_id(uuid::Uuid::new_v4().to_string());
    message.tool_calls.push(synthetic);
    message.tool_call_status.insert(
        original_call_id.to_string(),
        ToolCallStatus {
            complete: false,
            result: None,
        },
    );
    message
}

/// Duplicate-save prevention: a `client.humanIntervention` carrier is only
/// appended when the agent's latest memory entry does not already carry the
/// same outer `messageId`.
pub fn should_persist_approval(memory: &[AgentMessage], approval_message: &AgentMessage) -> bool {
    let carries_intervention = approval_message
        .tool_calls
        .iter()
        .any(|c| c.function.name == CLIENT_HUMAN_INTERVENTION);
    if !carries_intervention {
        return true;
    }
    match (memory.last().and_then(|m| m.message_id.as_deref()), approval_message.message_id.as_deref()) {
        (Some(last), Some(new)) => last != new,
        _ => true,
    }
}
