//! Auto-mention normalization of LLM responses.
//!
//! Agents address each other with `@name` mentions. The runtime keeps the
//! conversation legible by normalizing every assistant response before it is
//! published: leading self-mentions are stripped (models like to echo their
//! own handle), and a reply that does not already open with a mention of the
//! sender gets one prepended so the recipient is unambiguous.
//!
//! The `<world>pass</world>` marker short-circuits all of this: the agent is
//! ceding control back to the human and the response is recorded verbatim.

use crate::worldllm::ids::{extract_paragraph_mention, id_eq};

/// Marker an agent embeds to pass control back to the human.
pub const PASS_MARKER: &str = "<world>pass</world>";

/// True when the response contains the pass-through marker (case-insensitive).
pub fn is_pass_through(response: &str) -> bool {
    response.to_lowercase().contains(PASS_MARKER)
}

/// Remove *leading* consecutive mentions of the agent itself.
///
/// Only the run of `@self_id` tokens at the very start of the response is
/// stripped (case-insensitive); self-mentions elsewhere in the text are
/// preserved. Whitespace between stripped tokens collapses.
///
/// ```
/// use worldllm::auto_mention::remove_self_mentions;
/// assert_eq!(remove_self_mentions("@alice @alice I agree", "alice"), "I agree");
/// assert_eq!(remove_self_mentions("I agree with @alice", "alice"), "I agree with @alice");
/// ```
pub fn remove_self_mentions(response: &str, self_id: &str) -> String {
    let mut rest = response.trim_start();
    loop {
        if !rest.starts_with('@') {
            break;
        }
        let token: String = rest[1..]
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
            .collect();
        if token.is_empty() || !id_eq(&token, self_id) {
            break;
        }
        rest = rest[1 + token.len()..].trim_start();
    }
    rest.to_string()
}

/// True when the first non-empty paragraph of `response` opens with a
/// mention of `sender` (case-insensitive, tolerant of one interjection word
/// and trailing punctuation).
pub fn has_sender_mention_at_beginning(response: &str, sender: &str) -> bool {
    extract_paragraph_mention(response)
        .map_or(false, |mention| id_eq(&mention, sender))
}

/// Prepend `@sender ` unless the response already opens with that mention.
///
/// The sender's original casing is preserved in the prefix. Empty or
/// whitespace-only responses come back empty; the caller must not publish
/// them. Applying this twice is a no-op.
///
/// ```
/// use worldllm::auto_mention::add_auto_mention;
/// assert_eq!(add_auto_mention("Sure, happy to help!", "bob"), "@bob Sure, happy to help!");
/// assert_eq!(add_auto_mention("@BOB already addressed", "bob"), "@BOB already addressed");
/// ```
pub fn add_auto_mention(response: &str, sender: &str) -> String {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if has_sender_mention_at_beginning(trimmed, sender) {
        return trimmed.to_string();
    }
    format!("@{} {}", sender, trimmed)
}
