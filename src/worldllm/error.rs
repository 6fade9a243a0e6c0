//! Runtime error kinds.
//!
//! Errors are grouped by how the runtime reacts to them rather than by the
//! subsystem that raised them: validation failures become typed responses or
//! tool-role error results, stale subscription attempts are reported without
//! raising, and security violations are dropped silently after logging.

use std::error::Error;
use std::fmt;

/// Error kinds surfaced by the world runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Malformed input: bad identifier, malformed tool call, unknown command.
    /// Converted to a typed `{success: false, error}` response or a tool-role
    /// error result; never fatal.
    Validation(String),

    /// Unknown world, agent, chat, or message id.
    NotFound(String),

    /// Duplicate id where uniqueness is required, including reuse of a
    /// tombstoned subscription id. Raised loudly.
    Conflict(String),

    /// A subscription's version counter moved while the installer was
    /// suspended. Reported as `{stale: true, canceled: true}`, not raised.
    Stale(String),

    /// Storage or LLM failure from an external collaborator.
    External(String),

    /// A tool result addressed a `toolCallId` absent from the target agent's
    /// memory. Dropped without executing anything.
    Security(String),

    /// A HITL request or LLM call ran out of time.
    Timeout(String),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::Validation(msg) => write!(f, "Validation error: {}", msg),
            WorldError::NotFound(msg) => write!(f, "Not found: {}", msg),
            WorldError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            WorldError::Stale(msg) => write!(f, "Stale subscription: {}", msg),
            WorldError::External(msg) => write!(f, "External failure: {}", msg),
            WorldError::Security(msg) => write!(f, "Security violation: {}", msg),
            WorldError::Timeout(msg) => write!(f, "Timed out: {}", msg),
        }
    }
}

impl Error for WorldError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = WorldError::NotFound("world 'atlantis'".to_string());
        assert_eq!(err.to_string(), "Not found: world 'atlantis'");

        let err = WorldError::Conflict("subscription id 'tab-1' reused".to_string());
        assert!(err.to_string().starts_with("Conflict:"));
    }
}
