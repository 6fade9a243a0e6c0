//! Session-approval matching over agent memory.
//!
//! When a user approves a tool with `scope: "session"`, the decision is
//! persisted as a tool-role memory entry. Before prompting again for the
//! same tool, the pipeline scans memory backwards for a stored approval
//! that authorizes the exact `(toolName, toolArgs, workingDirectory)`
//! triple being attempted.
//!
//! Denials are never cached. One-time (`scope: "once"`) approvals are a
//! deprecated legacy form: the parser still recognizes them, but they are
//! explicitly inert for reuse purposes.

use crate::worldllm::chat_completion::{AgentMessage, Role};
use serde_json::Value;

/// A decoded approval record from a tool-result memory entry.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub decision: String,
    pub scope: String,
    pub tool_name: String,
    /// When set, only calls with deeply equal arguments match.
    pub tool_args: Option<Value>,
    /// When set, only calls from exactly this directory match.
    pub working_directory: Option<String>,
}

/// Parse a memory entry as an approval record.
///
/// The canonical form is a tool-role message whose content is
/// `{"__type": "tool_result", "content": "<json of the approval>"}`.
/// The inner payload is usually string-encoded; an already-decoded object
/// is accepted too.
pub fn parse_approval_record(message: &AgentMessage) -> Option<ApprovalRecord> {
    if message.role != Role::Tool {
        return None;
    }
    let outer: Value = serde_json::from_str(&message.content).ok()?;
    if outer.get("__type").and_then(Value::as_str) != Some("tool_result") {
        return None;
    }
    let inner = match outer.get("content")? {
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?,
        object @ Value::Object(_) => object.clone(),
        _ => return None,
    };

    Some(ApprovalRecord {
        decision: inner.get("decision")?.as_str()?.to_string(),
        scope: inner.get("scope").and_then(Value::as_str)?.to_string(),
        tool_name: inner.get("toolName").and_then(Value::as_str)?.to_string(),
        tool_args: inner.get("toolArgs").filter(|v| !v.is_null()).cloned(),
        working_directory: inner
            .get("workingDirectory")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    })
}

/// Deep structural equality for tool arguments: object key order is
/// irrelevant, arrays are ordered, primitives compare strictly.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, va)| b.get(k).map_or(false, |vb| deep_equal(va, vb)))
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(va, vb)| deep_equal(va, vb))
        }
        _ => a == b,
    }
}

fn record_authorizes(
    record: &ApprovalRecord,
    tool_name: &str,
    tool_args: &Value,
    working_directory: Option<&str>,
) -> bool {
    if !record.decision.eq_ignore_ascii_case("approve") {
        return false;
    }
    // One-time approvals are deprecated and never reused.
    if !record.scope.eq_ignore_ascii_case("session") {
        return false;
    }
    if !record.tool_name.eq_ignore_ascii_case(tool_name) {
        return false;
    }
    if let Some(approved_dir) = &record.working_directory {
        if working_directory != Some(approved_dir.as_str()) {
            return false;
        }
    }
    if let Some(approved_args) = &record.tool_args {
        if !deep_equal(approved_args, tool_args) {
            return false;
        }
    }
    true
}

/// Legacy free-form fallback: `"approve_session for <toolName>"` inside a
/// tool-role message whose content is not valid approval JSON.
fn legacy_text_authorizes(message: &AgentMessage, tool_name: &str) -> bool {
    if message.role != Role::Tool {
        return false;
    }
    let lowered = message.content.to_lowercase();
    lowered.contains(&format!("approve_session for {}", tool_name.to_lowercase()))
}

/// Scan `memory` backwards for a session approval authorizing
/// `(tool_name, tool_args, working_directory)`.
///
/// The scan is read-only and stable: re-running it over the same memory
/// yields the same answer.
pub fn find_session_approval(
    memory: &[AgentMessage],
    tool_name: &str,
    tool_args: &Value,
    working_directory: Option<&str>,
) -> bool {
    for message in memory.iter().rev() {
        if message.role != Role::Tool {
            continue;
        }
        match parse_approval_record(message) {
            Some(record) => {
                if record_authorizes(&record, tool_name, tool_args, working_directory) {
                    return true;
                }
            }
            None => {
                if legacy_text_authorizes(message, tool_name) {
                    return true;
                }
            }
        }
    }
    false
}
