// src/lib.rs

// Import the top-level `worldllm` module.
pub mod worldllm;

// Re-exporting key items for easier external access.
pub use worldllm::api::TransportApi;
pub use worldllm::chat_completion::{AgentMessage, ChatCompletion, Role, ToolCall};
pub use worldllm::event::{WorldEvent, WorldEventBus};
pub use worldllm::world::{Agent, World, WorldManager};
// Frequently used leaf modules, re-exported at the crate root so tests and
// transports can use worldllm::ids::to_kebab_case directly.
pub use worldllm::{
    activity, api, approval, auto_mention, chat_completion, config, error, event, event_meta,
    hitl, ids, pipeline, prepare, skills, storage, subscription, tool_validate, world,
};
