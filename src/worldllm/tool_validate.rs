//! Validation and normalization of raw tool calls from the LLM.
//!
//! Providers occasionally return tool calls with no name, aliased parameter
//! keys, or loosely typed values. The validator splits raw calls into
//! executable ones and synthetic error results, rewrites known aliases, and
//! coerces parameter values toward the tool's JSON schema. It never throws:
//! the pipeline branches on the returned split, and any event-publish
//! failure inside the helper paths is swallowed.

use crate::worldllm::chat_completion::{AgentMessage, ToolCall};
use crate::worldllm::event::{WorldActivityPayload, WorldEvent, WorldEventBus, WorldEventType};
use serde_json::{Map, Value};

/// Error text used for tool calls that arrive without a usable name.
pub const MALFORMED_TOOL_CALL: &str = "Malformed tool call: empty or missing tool name";

/// Outcome of splitting raw tool calls.
#[derive(Debug, Default)]
pub struct ToolCallSplit {
    /// Calls worth executing (possibly after alias/coercion rewrites).
    pub valid: Vec<ToolCall>,
    /// Synthetic `role: tool` error results for the rejected calls, ready to
    /// append to memory so the LLM sees why its call went nowhere.
    pub tool_results: Vec<AgentMessage>,
}

/// Split raw calls into `valid` and synthetic error results.
///
/// A call is invalid iff its function name is missing, empty, or
/// whitespace. Each invalid call produces a tool-role result carrying
/// [`MALFORMED_TOOL_CALL`] (with a generated `tc-…` id when the provider
/// sent none) and a `tool-error` world event. Publish failures never reach
/// the caller.
pub async fn split_valid_tool_calls(
    raw_calls: &[ToolCall],
    bus: &WorldEventBus,
    agent_name: &str,
    chat_id: Option<&str>,
) -> ToolCallSplit {
    let mut split = ToolCallSplit::default();

    for call in raw_calls {
        if !call.function.name.trim().is_empty() {
            split.valid.push(call.clone());
            continue;
        }

        let call_id = if call.id.trim().is_empty() {
            format!("tc-{}", uuid::Uuid::new_v4())
        } else {
            call.id.clone()
        };

        log::warn!(
            "agent '{}': rejecting tool call '{}' with empty tool name",
            agent_name,
            call_id
        );
        split.tool_results.push(AgentMessage::tool_result(
            call_id.clone(),
            MALFORMED_TOOL_CALL,
            agent_name,
        ));

        bus.emit(WorldEvent::World(WorldActivityPayload {
            event_type: WorldEventType::ToolError,
            source: format!("agent:{}", agent_name),
            agent_name: Some(agent_name.to_string()),
            chat_id: chat_id.map(|s| s.to_string()),
            tool_execution: Some(serde_json::json!({
                "toolName": "",
                "toolCallId": call_id,
                "error": "empty tool name from LLM",
            })),
            pending_operations: None,
            activity_id: None,
            active_sources: None,
        }))
        .await;
    }

    split
}

/// Per-tool parameter aliases: `(tool, alias, canonical)`.
///
/// When both keys are present the canonical one wins and the alias is
/// dropped; otherwise the alias value moves under the canonical key.
const PARAMETER_ALIASES: &[(&str, &str, &str)] = &[
    ("list_files", "directory", "path"),
    ("grep", "directory", "directoryPath"),
    ("create_agent", "auto-reply", "autoReply"),
    ("create_agent", "next agent", "nextAgent"),
];

/// Rewrite known parameter aliases for `tool_name` in place.
pub fn normalize_aliases(tool_name: &str, args: &mut Value) {
    let obj = match args.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };
    for (tool, alias, canonical) in PARAMETER_ALIASES {
        if !tool.eq_ignore_ascii_case(tool_name) {
            continue;
        }
        if let Some(value) = obj.remove(*alias) {
            if !obj.contains_key(*canonical) {
                obj.insert((*canonical).to_string(), value);
            }
            // Canonical already present: alias value is discarded.
        }
    }
}

/// Coerce `args` toward `schema` (a JSON Schema object) and return the
/// corrected copy. Applying the function to its own output is a fixed
/// point.
///
/// Rules:
/// - optional parameters with `null` values are omitted
/// - `string → number` via float parsing when the schema demands a number
/// - `string → array` wraps the value as a single-element array
/// - empty-string or `null` values for enum-typed parameters are omitted
/// - enum values match case-insensitively and are rewritten to the schema's
///   canonical casing
pub fn validate_tool_parameters(args: &Value, schema: &Value) -> Value {
    let obj = match args.as_object() {
        Some(obj) => obj,
        None => return args.clone(),
    };
    let properties = schema.get("properties").and_then(Value::as_object);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut corrected = Map::new();
    for (key, value) in obj {
        let prop = properties.and_then(|p| p.get(key));
        match coerce_value(key, value, prop, &required) {
            Some(coerced) => {
                corrected.insert(key.clone(), coerced);
            }
            None => {}
        }
    }
    Value::Object(corrected)
}

fn coerce_value(
    key: &str,
    value: &Value,
    prop: Option<&Value>,
    required: &[&str],
) -> Option<Value> {
    let prop = match prop {
        Some(prop) => prop,
        // Unknown parameter: passed through untouched (the tool decides).
        None => return Some(value.clone()),
    };

    let enum_values = prop.get("enum").and_then(Value::as_array);
    if let Some(enum_values) = enum_values {
        return coerce_enum(value, enum_values);
    }

    if value.is_null() {
        if required.contains(&key) {
            return Some(value.clone());
        }
        return None;
    }

    let schema_type = prop.get("type").and_then(Value::as_str);
    match (schema_type, value) {
        (Some("number"), Value::String(s)) | (Some("integer"), Value::String(s)) => {
            match parse_float(s) {
                Some(n) => serde_json::Number::from_f64(n).map(Value::Number),
                None => Some(value.clone()),
            }
        }
        (Some("array"), v) if !v.is_array() => Some(Value::Array(vec![v.clone()])),
        _ => Some(value.clone()),
    }
}

fn coerce_enum(value: &Value, enum_values: &[Value]) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => {
            for candidate in enum_values {
                if let Some(canonical) = candidate.as_str() {
                    if canonical.eq_ignore_ascii_case(s) {
                        return Some(Value::String(canonical.to_string()));
                    }
                }
            }
            Some(value.clone())
        }
        other => Some(other.clone()),
    }
}

/// JavaScript-`parseFloat` flavored parse: accepts a leading numeric prefix.
fn parse_float(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        return Some(n);
    }
    let mut end = 0;
    for (i, ch) in trimmed.char_indices() {
        if ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+' || ch == 'e' || ch == 'E' {
            end = i + ch.len_utf8();
        } else {
            break;
        }
    }
    if end == 0 {
        return None;
    }
    trimmed[..end].parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn empty_name_becomes_error_result() {
        let bus = WorldEventBus::new("w1");
        let calls = vec![
            ToolCall::function("call_1", "  ", "{}"),
            ToolCall::function("call_2", "grep", "{}"),
        ];
        let split = split_valid_tool_calls(&calls, &bus, "alice", Some("c1")).await;
        assert_eq!(split.valid.len(), 1);
        assert_eq!(split.valid[0].function.name, "grep");
        assert_eq!(split.tool_results.len(), 1);
        assert_eq!(split.tool_results[0].content, MALFORMED_TOOL_CALL);
        assert_eq!(
            split.tool_results[0].tool_call_id.as_deref(),
            Some("call_1")
        );
    }

    #[tokio::test]
    async fn missing_id_gets_generated_tc_prefix() {
        let bus = WorldEventBus::new("w1");
        let calls = vec![ToolCall::function("", "", "{}")];
        let split = split_valid_tool_calls(&calls, &bus, "alice", None).await;
        assert!(split.tool_results[0]
            .tool_call_id
            .as_deref()
            .unwrap()
            .starts_with("tc-"));
    }

    #[test]
    fn alias_moves_to_canonical_key() {
        let mut args = json!({"directory": "/tmp"});
        normalize_aliases("list_files", &mut args);
        assert_eq!(args, json!({"path": "/tmp"}));

        let mut args = json!({"directory": "/src"});
        normalize_aliases("grep", &mut args);
        assert_eq!(args, json!({"directoryPath": "/src"}));
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let mut args = json!({"directory": "/ignored", "path": "/kept"});
        normalize_aliases("list_files", &mut args);
        assert_eq!(args, json!({"path": "/kept"}));
    }

    #[test]
    fn create_agent_aliases() {
        let mut args = json!({"auto-reply": true, "next agent": "bob"});
        normalize_aliases("create_agent", &mut args);
        assert_eq!(args, json!({"autoReply": true, "nextAgent": "bob"}));
    }

    #[test]
    fn null_optional_params_are_omitted() {
        let schema = json!({
            "type": "object",
            "properties": {"limit": {"type": "number"}},
        });
        let corrected = validate_tool_parameters(&json!({"limit": null}), &schema);
        assert_eq!(corrected, json!({}));
    }

    #[test]
    fn string_to_number_coercion() {
        let schema = json!({
            "type": "object",
            "properties": {"limit": {"type": "number"}},
        });
        let corrected = validate_tool_parameters(&json!({"limit": "42.5"}), &schema);
        assert_eq!(corrected, json!({"limit": 42.5}));
    }

    #[test]
    fn string_to_array_wrapping() {
        let schema = json!({
            "type": "object",
            "properties": {"tags": {"type": "array"}},
        });
        let corrected = validate_tool_parameters(&json!({"tags": "urgent"}), &schema);
        assert_eq!(corrected, json!({"tags": ["urgent"]}));
    }

    #[test]
    fn enum_matches_case_insensitively_and_canonicalizes() {
        let schema = json!({
            "type": "object",
            "properties": {"mode": {"type": "string", "enum": ["Fast", "Thorough"]}},
        });
        let corrected = validate_tool_parameters(&json!({"mode": "fast"}), &schema);
        assert_eq!(corrected, json!({"mode": "Fast"}));

        let empty = validate_tool_parameters(&json!({"mode": ""}), &schema);
        assert_eq!(empty, json!({}));
        let null = validate_tool_parameters(&json!({"mode": null}), &schema);
        assert_eq!(null, json!({}));
    }

    #[test]
    fn validation_is_a_fixed_point() {
        let schema = json!({
            "type": "object",
            "properties": {
                "limit": {"type": "number"},
                "tags": {"type": "array"},
                "mode": {"type": "string", "enum": ["Fast"]},
            },
        });
        let args = json!({"limit": "3", "tags": "a", "mode": "FAST", "extra": 1});
        let once = validate_tool_parameters(&args, &schema);
        let twice = validate_tool_parameters(&once, &schema);
        assert_eq!(once, twice);
        assert_eq!(
            once,
            json!({"limit": 3.0, "tags": ["a"], "mode": "Fast", "extra": 1})
        );
    }
}
