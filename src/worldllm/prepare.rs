//! Assembly of the message list sent to the LLM.
//!
//! The preparer owns one contract with the pipeline: *load history first,
//! persist current last*. It receives history that does NOT yet contain the
//! current message and appends the current message itself, exactly once, at
//! the end. It deliberately performs no deduplication: identical
//! consecutive entries mean a caller persisted the current message before
//! loading history, and hiding that bug here would let it spread.
//!
//! Client-addressed synthetic tool calls (`client.requestApproval`,
//! `client.humanIntervention`) and their `approval_`/`hitl_` results exist
//! for transports, not for providers; they are filtered out of every
//! prepared request.

use crate::worldllm::chat_completion::{AgentMessage, Role};

/// Prefix of tool-call function names addressed to the client, never the LLM.
pub const CLIENT_TOOL_PREFIX: &str = "client.";

/// `tool_call_id` prefixes of synthetic approval results.
const SYNTHETIC_RESULT_PREFIXES: &[&str] = &["approval_", "hitl_"];

/// Which slice of history to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFilter<'a> {
    /// Keep every entry.
    All,
    /// Keep entries whose `chatId` equals this key exactly. `None` is a
    /// valid key (pre-chat messages), not a wildcard.
    Chat(Option<&'a str>),
}

impl<'a> HistoryFilter<'a> {
    fn keeps(&self, message: &AgentMessage) -> bool {
        match self {
            HistoryFilter::All => true,
            HistoryFilter::Chat(chat_id) => message.chat_id.as_deref() == *chat_id,
        }
    }
}

/// Drop client-addressed synthetic content from one history entry.
///
/// Returns `None` when the whole entry must be hidden from the LLM:
/// assistant messages left with nothing but `client.*` calls, and tool
/// results correlated to synthetic approval ids.
fn filter_synthetic(message: &AgentMessage) -> Option<AgentMessage> {
    if message.role == Role::Tool {
        if let Some(call_id) = &message.tool_call_id {
            if SYNTHETIC_RESULT_PREFIXES
                .iter()
                .any(|p| call_id.starts_with(p))
            {
                return None;
            }
        }
        return Some(message.clone());
    }

    if message.tool_calls.is_empty() {
        return Some(message.clone());
    }

    let kept: Vec<_> = message
        .tool_calls
        .iter()
        .filter(|c| !c.function.name.starts_with(CLIENT_TOOL_PREFIX))
        .cloned()
        .collect();
    if kept.is_empty() {
        // Only client-addressed calls remained: the entry never goes to the
        // provider.
        return None;
    }
    let mut filtered = message.clone();
    filtered.tool_calls = kept;
    Some(filtered)
}

/// Build the ordered request: `[system?, ...history, current?]`.
///
/// The system prompt is prepended iff non-empty. History order is preserved
/// (callers supply it chronologically). When `current` is `Some`, it is
/// appended last and appears exactly once; the caller guarantees it is not
/// already inside `history`.
pub fn prepare_messages_for_llm(
    system_prompt: &str,
    history: &[AgentMessage],
    current: Option<&AgentMessage>,
    filter: HistoryFilter<'_>,
) -> Vec<AgentMessage> {
    let mut prepared = Vec::with_capacity(history.len() + 2);
    if !system_prompt.trim().is_empty() {
        prepared.push(AgentMessage::new(Role::System, system_prompt, "system"));
    }
    for message in history {
        if !filter.keeps(message) {
            continue;
        }
        if let Some(kept) = filter_synthetic(message) {
            prepared.push(kept);
        }
    }
    if let Some(current) = current {
        prepared.push(current.clone());
    }
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldllm::chat_completion::ToolCall;

    fn chat(msg: AgentMessage, chat_id: &str) -> AgentMessage {
        msg.with_chat_id(Some(chat_id.to_string()))
    }

    #[test]
    fn system_prompt_prepended_iff_non_empty() {
        let current = AgentMessage::user("hi", "human");
        let with = prepare_messages_for_llm("Be helpful.", &[], Some(&current), HistoryFilter::All);
        assert_eq!(with.len(), 2);
        assert_eq!(with[0].role, Role::System);

        let without = prepare_messages_for_llm("   ", &[], Some(&current), HistoryFilter::All);
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].role, Role::User);
    }

    #[test]
    fn current_message_is_last_and_appears_once() {
        let history = vec![
            AgentMessage::user("earlier", "human"),
            AgentMessage::assistant("reply", "alice"),
        ];
        let current = AgentMessage::user("now", "human");
        let prepared =
            prepare_messages_for_llm("sys", &history, Some(&current), HistoryFilter::All);
        assert_eq!(prepared.last().unwrap().content, "now");
        assert_eq!(
            prepared.iter().filter(|m| m.content == "now").count(),
            1
        );
    }

    #[test]
    fn history_filtered_by_exact_chat_id() {
        let history = vec![
            chat(AgentMessage::user("in a", "human"), "chat-a"),
            chat(AgentMessage::user("in b", "human"), "chat-b"),
            AgentMessage::user("untagged", "human"),
        ];
        let prepared =
            prepare_messages_for_llm("", &history, None, HistoryFilter::Chat(Some("chat-a")));
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].content, "in a");

        // `None` is a valid chat key, not a wildcard.
        let untagged = prepare_messages_for_llm("", &history, None, HistoryFilter::Chat(None));
        assert_eq!(untagged.len(), 1);
        assert_eq!(untagged[0].content, "untagged");
    }

    #[test]
    fn duplicates_are_not_removed() {
        let history = vec![
            AgentMessage::user("same", "human"),
            AgentMessage::user("same", "human"),
        ];
        let prepared = prepare_messages_for_llm("", &history, None, HistoryFilter::All);
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn client_only_assistant_entries_are_dropped() {
        let mut assistant = AgentMessage::assistant("", "alice");
        assistant.tool_calls.push(ToolCall::function(
            "approval_c1",
            "client.requestApproval",
            "{}",
        ));
        let prepared = prepare_messages_for_llm("", &[assistant], None, HistoryFilter::All);
        assert!(prepared.is_empty());
    }

    #[test]
    fn mixed_tool_calls_keep_only_provider_calls() {
        let mut assistant = AgentMessage::assistant("working on it", "alice");
        assistant
            .tool_calls
            .push(ToolCall::function("c1", "grep", "{}"));
        assistant.tool_calls.push(ToolCall::function(
            "hitl_c2",
            "client.humanIntervention",
            "{}",
        ));
        let prepared = prepare_messages_for_llm("", &[assistant], None, HistoryFilter::All);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].tool_calls.len(), 1);
        assert_eq!(prepared[0].tool_calls[0].function.name, "grep");
    }

    #[test]
    fn synthetic_tool_results_are_dropped() {
        let history = vec![
            AgentMessage::tool_result("approval_c1", "{\"decision\":\"approve\"}", "human"),
            AgentMessage::tool_result("hitl_c2", "{\"optionId\":\"yes\"}", "human"),
            AgentMessage::tool_result("call_3", "real result", "alice"),
        ];
        let prepared = prepare_messages_for_llm("", &history, None, HistoryFilter::All);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].content, "real result");
    }
}
