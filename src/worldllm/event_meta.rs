//! Persistence metadata for message events.
//!
//! Before a message event is appended to event storage, the runtime derives
//! who it is addressed to, which agents' memories own it, and how it sits in
//! the reply thread. The derivation is pure: it looks only at the payload
//! and the world's agent directory, never at mutable runtime state.

use crate::worldllm::chat_completion::Role;
use crate::worldllm::event::MessageEventPayload;
use crate::worldllm::ids::{extract_paragraph_mention, id_eq};
use serde::{Deserialize, Serialize};

/// Well-known sender aliases for the human participant.
const HUMAN_SENDERS: &[&str] = &["human", "user", "you"];
/// Well-known sender aliases for the runtime itself.
const SYSTEM_SENDERS: &[&str] = &["system", "world"];

/// Who published a message, as far as routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCategory {
    Human,
    Agent,
    System,
}

/// Broadcast direction recorded with each persisted message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    /// No resolved recipient: the message goes to every agent.
    Broadcast,
    /// Addressed into the agent pool (a specific agent will process it).
    Incoming,
    /// Leaving the agent pool (an agent addressing the human).
    Outgoing,
}

/// Minimal read-only view of a world's agents used for mention resolution.
#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    /// `(id, name)` pairs; ids are kebab-case, names free-form.
    entries: Vec<(String, String)>,
}

impl AgentDirectory {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        AgentDirectory { entries }
    }

    /// Resolve a mention or sender string to an agent id, accepting either
    /// the stable id or the display name, case-insensitively.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(id, display)| id_eq(id, name) || id_eq(display, name))
            .map(|(id, _)| id.as_str())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classify a sender string against the agent directory.
pub fn classify_sender(sender: &str, agents: &AgentDirectory) -> SenderCategory {
    if SYSTEM_SENDERS.iter().any(|s| id_eq(s, sender)) {
        return SenderCategory::System;
    }
    if agents.resolve(sender).is_some() {
        return SenderCategory::Agent;
    }
    if HUMAN_SENDERS.iter().any(|s| id_eq(s, sender)) {
        return SenderCategory::Human;
    }
    // Unrecognized senders are treated as human participants: transports may
    // use arbitrary display names for connected users.
    SenderCategory::Human
}

/// Derived flags stored alongside each persisted message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Agent addressed by the first paragraph-begin mention, when it
    /// resolves to an agent in the world.
    #[serde(rename = "recipientAgentId")]
    pub recipient_agent_id: Option<String>,
    /// Agents whose memory will store this message.
    #[serde(rename = "ownerAgentIds")]
    pub owner_agent_ids: Vec<String>,
    #[serde(rename = "isHumanMessage")]
    pub is_human_message: bool,
    #[serde(rename = "isCrossAgentMessage")]
    pub is_cross_agent_message: bool,
    /// Tool-role entries and tool results live only in memory, never in the
    /// chat transcript shown to clients.
    #[serde(rename = "isMemoryOnly")]
    pub is_memory_only: bool,
    #[serde(rename = "isReply")]
    pub is_reply: bool,
    /// 1 for a direct reply, 0 otherwise.
    #[serde(rename = "threadDepth")]
    pub thread_depth: u32,
    /// The replied-to message for replies; the message's own id otherwise.
    #[serde(rename = "threadRootId")]
    pub thread_root_id: String,
    #[serde(rename = "hasToolCalls")]
    pub has_tool_calls: bool,
    #[serde(rename = "toolCallCount")]
    pub tool_call_count: usize,
    #[serde(rename = "messageDirection")]
    pub message_direction: MessageDirection,
    /// Mirrors `owner_agent_ids`; kept separate so delivery accounting can
    /// diverge from ownership in the future without a schema change.
    #[serde(rename = "deliveredToAgents")]
    pub delivered_to_agents: Vec<String>,
}

/// Compute the persistence metadata for one message event.
pub fn derive_event_meta(payload: &MessageEventPayload, agents: &AgentDirectory) -> EventMeta {
    let sender_category = classify_sender(&payload.sender, agents);
    let sender_agent_id = agents.resolve(&payload.sender).map(|s| s.to_string());

    let mention = extract_paragraph_mention(&payload.content);
    let recipient_agent_id = mention
        .as_deref()
        .and_then(|m| agents.resolve(m))
        .map(|s| s.to_string());

    let owner_agent_ids: Vec<String> = match sender_category {
        SenderCategory::Human => agents.ids(),
        SenderCategory::Agent => match &recipient_agent_id {
            Some(target) => {
                let mut owners = Vec::with_capacity(2);
                if let Some(sender_id) = &sender_agent_id {
                    owners.push(sender_id.clone());
                }
                if !owners.iter().any(|o| o == target) {
                    owners.push(target.clone());
                }
                owners
            }
            None => agents.ids(),
        },
        SenderCategory::System => recipient_agent_id.iter().cloned().collect(),
    };

    let is_reply = payload.reply_to_message_id.is_some();
    let is_tool_role = payload.role == Some(Role::Tool) || payload.tool_call_id.is_some();

    let message_direction = if recipient_agent_id.is_some() {
        MessageDirection::Incoming
    } else if sender_category == SenderCategory::Agent && mention.is_some() {
        // Directed at someone outside the agent pool, e.g. `@human`.
        MessageDirection::Outgoing
    } else {
        MessageDirection::Broadcast
    };

    EventMeta {
        recipient_agent_id,
        delivered_to_agents: owner_agent_ids.clone(),
        owner_agent_ids,
        is_human_message: sender_category == SenderCategory::Human,
        is_cross_agent_message: sender_category == SenderCategory::Agent
            && sender_agent_id.is_some()
            && mention
                .as_deref()
                .map_or(false, |m| agents.resolve(m).is_some()),
        is_memory_only: is_tool_role,
        is_reply,
        thread_depth: if is_reply { 1 } else { 0 },
        thread_root_id: payload
            .reply_to_message_id
            .clone()
            .unwrap_or_else(|| payload.message_id.clone()),
        has_tool_calls: !payload.tool_calls.is_empty(),
        tool_call_count: payload.tool_calls.len(),
        message_direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldllm::chat_completion::ToolCall;

    fn directory() -> AgentDirectory {
        AgentDirectory::new(vec![
            ("alice".to_string(), "Alice".to_string()),
            ("bob".to_string(), "Bob".to_string()),
        ])
    }

    fn payload(content: &str, sender: &str) -> MessageEventPayload {
        MessageEventPayload::text(content, sender, Some("chat-1".to_string()))
    }

    #[test]
    fn human_broadcast_owned_by_all_agents() {
        let meta = derive_event_meta(&payload("Hello everyone", "human"), &directory());
        assert!(meta.is_human_message);
        assert_eq!(meta.owner_agent_ids, vec!["alice", "bob"]);
        assert_eq!(meta.message_direction, MessageDirection::Broadcast);
        assert_eq!(meta.recipient_agent_id, None);
    }

    #[test]
    fn agent_to_agent_owned_by_sender_and_target() {
        let meta = derive_event_meta(&payload("@alice take a look", "bob"), &directory());
        assert_eq!(meta.recipient_agent_id.as_deref(), Some("alice"));
        assert_eq!(meta.owner_agent_ids, vec!["bob", "alice"]);
        assert!(meta.is_cross_agent_message);
        assert_eq!(meta.message_direction, MessageDirection::Incoming);
    }

    #[test]
    fn agent_to_human_is_outgoing() {
        let meta = derive_event_meta(&payload("@human all done", "alice"), &directory());
        assert_eq!(meta.recipient_agent_id, None);
        assert_eq!(meta.message_direction, MessageDirection::Outgoing);
        // No agent recipient resolved: broadcast ownership.
        assert_eq!(meta.owner_agent_ids, vec!["alice", "bob"]);
    }

    #[test]
    fn mention_resolution_is_case_insensitive_and_tolerates_interjection() {
        let meta = derive_event_meta(&payload("Hey @Alice, ready?", "human"), &directory());
        assert_eq!(meta.recipient_agent_id.as_deref(), Some("alice"));
    }

    #[test]
    fn unresolved_mention_is_no_recipient() {
        let meta = derive_event_meta(&payload("@charlie hello?", "human"), &directory());
        assert_eq!(meta.recipient_agent_id, None);
        assert_eq!(meta.message_direction, MessageDirection::Broadcast);
    }

    #[test]
    fn reply_sets_thread_fields() {
        let mut p = payload("@alice thanks", "bob");
        p.reply_to_message_id = Some("msg-root".to_string());
        let meta = derive_event_meta(&p, &directory());
        assert!(meta.is_reply);
        assert_eq!(meta.thread_depth, 1);
        assert_eq!(meta.thread_root_id, "msg-root");
    }

    #[test]
    fn non_reply_roots_at_itself() {
        let p = payload("standalone", "human");
        let meta = derive_event_meta(&p, &directory());
        assert_eq!(meta.thread_depth, 0);
        assert_eq!(meta.thread_root_id, p.message_id);
    }

    #[test]
    fn tool_calls_counted() {
        let mut p = payload("", "alice");
        p.tool_calls.push(ToolCall::function("c1", "grep", "{}"));
        p.tool_calls.push(ToolCall::function("c2", "list_files", "{}"));
        let meta = derive_event_meta(&p, &directory());
        assert!(meta.has_tool_calls);
        assert_eq!(meta.tool_call_count, 2);
    }

    #[test]
    fn system_sender_owns_nothing_without_agent_recipient() {
        let meta = derive_event_meta(
            &payload("@human alice is passing control to you", "system"),
            &directory(),
        );
        assert!(meta.owner_agent_ids.is_empty());
        assert!(!meta.is_human_message);
    }
}
