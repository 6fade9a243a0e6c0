//! The agent message-processing pipeline.
//!
//! One [`AgentRuntime`] per world listens on the bus and drives every agent
//! turn:
//!
//! ```text
//! message event
//!   └─ should_respond? ──> per-agent turn (serialized by a turn lock)
//!        ├─ prepare messages   (history WITHOUT the current message)
//!        ├─ LLM call           (SSE start/chunk/complete, chatId pinned)
//!        ├─ pass-through?      (verbatim persist + system notice, stop)
//!        ├─ normalize          (strip self-mentions, auto-mention sender)
//!        ├─ persist            (incoming current first, then assistant)
//!        └─ tool loop          (validate → approval gate → execute → loop)
//! tool event (decision from transport)
//!   └─ security gate ──> approve: record + execute, deny: record
//!        └─ resume the LLM loop with updated memory
//! ```
//!
//! Memory ordering within a turn is strict: the preparer sees history that
//! does not yet contain the current message; the current message is
//! persisted exactly once, after the LLM completes, followed by the
//! assistant entry and any tool results. No two turns for the same agent
//! interleave.

use crate::worldllm::approval::find_session_approval;
use crate::worldllm::auto_mention::{add_auto_mention, is_pass_through, remove_self_mentions};
use crate::worldllm::chat_completion::{
    AgentMessage, ChatCompletion, CompletionResponse, Role, ToolCall, ToolDefinition,
};
use crate::worldllm::event::{
    EventSink, MessageEventPayload, SseEventPayload, SseEventType, ToolResponsePayload,
    WorldActivityPayload, WorldEvent, WorldEventType,
};
use crate::worldllm::event_meta::{classify_sender, SenderCategory};
use crate::worldllm::hitl::{
    build_approval_request, should_persist_approval, transform_human_intervention,
    HUMAN_INTERVENTION_TOOL,
};
use crate::worldllm::ids::{extract_paragraph_mention, id_eq};
use crate::worldllm::prepare::{prepare_messages_for_llm, HistoryFilter};
use crate::worldllm::tool_validate::{
    normalize_aliases, split_valid_tool_calls, validate_tool_parameters,
};
use crate::worldllm::world::{Agent, World};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cap on LLM round-trips within one turn; a misbehaving model that keeps
/// requesting tools gets cut off here.
const MAX_TOOL_ITERATIONS: usize = 5;

/// Result text appended when the user denies a tool call.
pub const TOOL_DENIED_RESULT: &str = "Tool execution was denied by the user.";

/// Capability for executing approved tool calls.
///
/// Execution environments (shells, filesystems, HTTP fetchers) live outside
/// the runtime; the pipeline only needs schemas for advertising and a way
/// to run an approved call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool schemas advertised to the LLM on every call.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Execute an approved call and return its JSON result.
    async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        working_directory: Option<&str>,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;

    /// The parameter schema for one tool, used for argument coercion.
    fn schema_for(&self, name: &str) -> Option<serde_json::Value> {
        self.definitions()
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.parameters_schema)
    }
}

/// A no-tool executor for worlds that only converse.
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(
        &self,
        name: &str,
        _args: &serde_json::Value,
        _working_directory: Option<&str>,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        Err(format!("no executor registered for tool '{}'", name).into())
    }
}

/// Decide whether `agent` responds to a message event.
///
/// Rules: never to self, never to system senders. A paragraph-begin mention
/// addresses exactly one agent (nobody responds when it does not resolve).
/// Without a mention, human messages broadcast to every agent and agent
/// messages go unanswered. Replying to un-addressed agent chatter is how
/// worlds melt into infinite loops.
pub fn should_respond(
    agent: &Agent,
    payload: &MessageEventPayload,
    directory: &crate::worldllm::event_meta::AgentDirectory,
) -> bool {
    if id_eq(&payload.sender, &agent.id) {
        return false;
    }
    let sender_category = classify_sender(&payload.sender, directory);
    if sender_category == SenderCategory::System {
        return false;
    }
    match extract_paragraph_mention(&payload.content) {
        Some(mention) => directory
            .resolve(&mention)
            .map_or(false, |id| id_eq(id, &agent.id)),
        None => sender_category == SenderCategory::Human,
    }
}

/// Per-world driver that turns bus events into agent work.
pub struct AgentRuntime {
    world: Arc<World>,
    llm: Arc<dyn ChatCompletion>,
    tools: Arc<dyn ToolExecutor>,
    /// Working directory reported with approval requests and handed to the
    /// executor.
    working_directory: Option<String>,
    /// Client used for chat-title summarization; `None` disables titles.
    title_llm: Option<Arc<dyn ChatCompletion>>,
    /// One lock per agent: turns never interleave within an agent.
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(
        world: Arc<World>,
        llm: Arc<dyn ChatCompletion>,
        tools: Arc<dyn ToolExecutor>,
        working_directory: Option<String>,
    ) -> Arc<Self> {
        Arc::new(AgentRuntime {
            world,
            llm,
            tools,
            working_directory,
            title_llm: None,
            turn_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Like [`new`](AgentRuntime::new), with chat-title generation enabled
    /// through `title_llm`.
    pub fn with_title_llm(
        world: Arc<World>,
        llm: Arc<dyn ChatCompletion>,
        tools: Arc<dyn ToolExecutor>,
        working_directory: Option<String>,
        title_llm: Arc<dyn ChatCompletion>,
    ) -> Arc<Self> {
        Arc::new(AgentRuntime {
            world,
            llm,
            tools,
            working_directory,
            title_llm: Some(title_llm),
            turn_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a runtime to its world's bus so message and tool events
    /// start driving turns. The bus holds the runtime weakly; keep the
    /// returned `Arc` alive for as long as the world should process.
    pub async fn attach(runtime: &Arc<Self>) -> crate::worldllm::event::SinkId {
        let sink: Arc<dyn EventSink> = Arc::new(RuntimeSink {
            runtime: Arc::downgrade(runtime),
        });
        runtime.world.bus().attach(sink).await
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    async fn turn_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        Arc::clone(
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // ---- Message dispatch ----

    async fn dispatch_message(self: Arc<Self>, payload: MessageEventPayload) {
        let directory = self.world.agent_directory().await;
        let sender_category = classify_sender(&payload.sender, &directory);

        // Human messages drive chat-title generation; agent and system
        // traffic never does.
        if sender_category == SenderCategory::Human && self.title_llm.is_some() {
            if let Some(chat_id) = self.world.current_chat_id().await {
                let runtime = Arc::clone(&self);
                let content = payload.content.clone();
                tokio::spawn(async move {
                    runtime.generate_chat_title(&chat_id, &content).await;
                });
            }
        }

        // Turn-limit enforcement counts agent-to-agent hops once per
        // message, before any responder is scheduled.
        if sender_category == SenderCategory::Agent {
            let mention = extract_paragraph_mention(&payload.content);
            let targets_agent = mention
                .as_deref()
                .map_or(false, |m| directory.resolve(m).is_some());
            if targets_agent {
                let hops = self.world.note_agent_hop(payload.chat_id.as_deref()).await;
                let limit = self.world.turn_limit().await;
                if limit > 0 && hops > limit {
                    log::info!(
                        "world '{}': turn limit {} reached in chat {:?}",
                        self.world.id,
                        limit,
                        payload.chat_id
                    );
                    self.world
                        .publish_message(MessageEventPayload::text(
                            format!(
                                "@human Turn limit of {} consecutive agent replies reached; control returned to you",
                                limit
                            ),
                            "system",
                            payload.chat_id.clone(),
                        ))
                        .await;
                    return;
                }
            }
        }

        // Owners that do not respond still remember the message; the
        // responder's own append happens inside its turn, after the LLM.
        let meta = crate::worldllm::event_meta::derive_event_meta(&payload, &directory);

        for handle in self.world.agent_handles().await {
            let (agent_id, respond) = {
                let agent = handle.lock().await;
                (agent.id.clone(), should_respond(&agent, &payload, &directory))
            };
            if respond {
                let runtime = Arc::clone(&self);
                let payload = payload.clone();
                tokio::spawn(async move {
                    runtime.process_agent_message(handle, payload).await;
                });
                continue;
            }
            let owns = meta.owner_agent_ids.iter().any(|o| o == &agent_id);
            if owns && !id_eq(&payload.sender, &agent_id) {
                {
                    let mut agent = handle.lock().await;
                    agent.memory.push(AgentMessage {
                        role: Role::User,
                        content: payload.content.clone(),
                        sender: Some(payload.sender.clone()),
                        chat_id: payload.chat_id.clone(),
                        created_at: payload.timestamp,
                        message_id: Some(payload.message_id.clone()),
                        reply_to_message_id: payload.reply_to_message_id.clone(),
                        tool_calls: Vec::new(),
                        tool_call_id: None,
                        tool_call_status: HashMap::new(),
                    });
                }
                self.persist(&handle).await;
            }
        }
    }

    /// Ask the chat LLM for a short summary title and persist it via the
    /// world's chat manager. Failures are logged and dropped.
    async fn generate_chat_title(&self, chat_id: &str, content: &str) {
        let llm = match &self.title_llm {
            Some(llm) => Arc::clone(llm),
            None => return,
        };
        let prompt = vec![
            AgentMessage::new(
                Role::System,
                "Summarize the conversation topic as a chat title of at most five words. \
                 Reply with the title only.",
                "system",
            ),
            AgentMessage::user(content, "human"),
        ];
        let title = match llm.complete(&prompt, &[]).await {
            Ok(response) => response.content.trim().trim_matches('"').to_string(),
            Err(e) => {
                log::debug!(
                    "world '{}': chat title generation failed: {}",
                    self.world.id,
                    e
                );
                return;
            }
        };
        if title.is_empty() {
            return;
        }
        if let Err(e) = self.world.rename_chat(chat_id, &title).await {
            log::debug!("world '{}': chat title persist failed: {}", self.world.id, e);
        }
    }

    // ---- The turn algorithm ----

    /// Run one agent turn for an incoming message event.
    pub async fn process_agent_message(
        self: Arc<Self>,
        handle: Arc<Mutex<Agent>>,
        payload: MessageEventPayload,
    ) {
        let lock = {
            let agent = handle.lock().await;
            self.turn_lock(&agent.id).await
        };
        let _turn = lock.lock().await;

        let chat_id = payload.chat_id.clone();
        if self.world.stop_requested(chat_id.as_deref()).await {
            log::debug!("world '{}': stop requested, dropping turn", self.world.id);
            return;
        }

        let (agent_id, agent_name, system_prompt, history, skip_incoming_save) = {
            let agent = handle.lock().await;
            (
                agent.id.clone(),
                agent.name.clone(),
                agent.system_prompt.clone(),
                agent.memory.clone(),
                id_eq(&payload.sender, &agent.id),
            )
        };

        let source = format!("agent:{}", agent_id);
        let activity_id = self
            .world
            .activity()
            .response_start(self.world.bus(), &source)
            .await;

        // The current incoming turn, persisted only after the LLM answers.
        let current = AgentMessage {
            role: Role::User,
            content: payload.content.clone(),
            sender: Some(payload.sender.clone()),
            chat_id: chat_id.clone(),
            created_at: payload.timestamp,
            message_id: Some(payload.message_id.clone()),
            reply_to_message_id: payload.reply_to_message_id.clone(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_call_status: HashMap::new(),
        };

        let prepared = prepare_messages_for_llm(
            &system_prompt,
            &history,
            Some(&current),
            HistoryFilter::Chat(chat_id.as_deref()),
        );

        let response = match self
            .call_llm(&agent_name, &prepared, chat_id.as_deref())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::error!(
                    "world '{}': LLM call failed for agent '{}': {}",
                    self.world.id,
                    agent_id,
                    e
                );
                self.world
                    .activity()
                    .response_end(self.world.bus(), &source, activity_id)
                    .await;
                return;
            }
        };

        {
            let mut agent = handle.lock().await;
            agent.llm_call_count += 1;
            agent.last_active = Utc::now();
        }

        // Pass-through: verbatim memory, system notice, no normalization.
        if is_pass_through(&response.content) {
            {
                let mut agent = handle.lock().await;
                if !skip_incoming_save {
                    agent.memory.push(current.clone());
                }
                let mut verbatim =
                    AgentMessage::assistant(response.content.clone(), agent_id.clone())
                        .with_chat_id(chat_id.clone())
                        .with_message_id(uuid::Uuid::new_v4().to_string());
                verbatim.tool_calls = response.tool_calls.clone();
                agent.memory.push(verbatim);
            }
            self.persist(&handle).await;
            self.world
                .publish_message(MessageEventPayload::text(
                    format!("@human {} is passing control to you", agent_id),
                    "system",
                    chat_id.clone(),
                ))
                .await;
            self.world
                .activity()
                .response_end(self.world.bus(), &source, activity_id)
                .await;
            return;
        }

        // Normalize: strip leading self-mentions, prefix the sender.
        let directory = self.world.agent_directory().await;
        let sender_category = classify_sender(&payload.sender, &directory);
        let stripped = remove_self_mentions(&response.content, &agent_id);
        let final_content = if sender_category != SenderCategory::System
            && !id_eq(&payload.sender, &agent_id)
        {
            add_auto_mention(&stripped, &payload.sender)
        } else {
            stripped.trim().to_string()
        };

        // Required order: history was loaded first; persist the current
        // incoming turn now, then the assistant entry.
        {
            let mut agent = handle.lock().await;
            if !skip_incoming_save {
                agent.memory.push(current);
            }
        }

        let assistant_message_id = uuid::Uuid::new_v4().to_string();
        if !final_content.is_empty() || !response.tool_calls.is_empty() {
            let mut entry = AgentMessage::assistant(final_content.clone(), agent_id.clone())
                .with_chat_id(chat_id.clone())
                .with_message_id(assistant_message_id.clone());
            entry.tool_calls = response.tool_calls.clone();
            handle.lock().await.memory.push(entry);
        }
        self.persist(&handle).await;

        if !final_content.is_empty() {
            let mut publish = MessageEventPayload::text(
                final_content.clone(),
                agent_id.clone(),
                chat_id.clone(),
            );
            publish.message_id = assistant_message_id;
            publish.role = Some(Role::Assistant);
            self.world.publish_message(publish).await;
        }

        // Tool loop.
        self.run_tool_loop(&handle, response, chat_id.clone(), Some(payload.sender))
            .await;

        self.world
            .activity()
            .response_end(self.world.bus(), &source, activity_id)
            .await;
    }

    /// Run LLM round-trips until the assistant stops requesting tools, an
    /// approval is required, or the iteration cap is hit. The first
    /// response (already persisted by the caller) is passed in.
    async fn run_tool_loop(
        &self,
        handle: &Arc<Mutex<Agent>>,
        first_response: CompletionResponse,
        chat_id: Option<String>,
        reply_to_sender: Option<String>,
    ) {
        let (agent_id, agent_name) = {
            let agent = handle.lock().await;
            (agent.id.clone(), agent.name.clone())
        };

        let mut response = first_response;
        let mut iteration = 0usize;

        loop {
            if response.tool_calls.is_empty() {
                return;
            }
            iteration += 1;
            if iteration > MAX_TOOL_ITERATIONS {
                log::warn!(
                    "world '{}': agent '{}' hit the tool iteration cap",
                    self.world.id,
                    agent_id
                );
                handle.lock().await.memory.push(
                    AgentMessage::assistant(
                        "[Warning: Maximum tool iterations reached]",
                        agent_id.clone(),
                    )
                    .with_chat_id(chat_id.clone()),
                );
                self.persist(handle).await;
                return;
            }

            let split = split_valid_tool_calls(
                &response.tool_calls,
                self.world.bus(),
                &agent_name,
                chat_id.as_deref(),
            )
            .await;

            if !split.tool_results.is_empty() {
                let mut agent = handle.lock().await;
                for mut result in split.tool_results {
                    result.chat_id = chat_id.clone();
                    agent.memory.push(result);
                }
            }

            for call in &split.valid {
                if self.world.stop_requested(chat_id.as_deref()).await {
                    log::debug!("world '{}': stop requested mid tool loop", self.world.id);
                    self.persist(handle).await;
                    return;
                }
                let halted = self
                    .handle_tool_call(handle, &agent_id, call, chat_id.as_deref())
                    .await;
                if halted {
                    // Awaiting a human decision; the tool-channel handler
                    // resumes the loop.
                    self.persist(handle).await;
                    return;
                }
            }
            self.persist(handle).await;

            response = match self
                .follow_up_llm_call(handle, &agent_name, chat_id.as_deref())
                .await
            {
                Some(response) => response,
                None => return,
            };
            if is_pass_through(&response.content) {
                {
                    let mut agent = handle.lock().await;
                    let mut verbatim =
                        AgentMessage::assistant(response.content.clone(), agent_id.clone())
                            .with_chat_id(chat_id.clone())
                            .with_message_id(uuid::Uuid::new_v4().to_string());
                    verbatim.tool_calls = response.tool_calls.clone();
                    agent.memory.push(verbatim);
                }
                self.persist(handle).await;
                self.world
                    .publish_message(MessageEventPayload::text(
                        format!("@human {} is passing control to you", agent_id),
                        "system",
                        chat_id.clone(),
                    ))
                    .await;
                return;
            }
            self.finalize_response(handle, &agent_id, &response, &chat_id, &reply_to_sender)
                .await;
        }
    }

    /// One validated tool call: session-approval gate, then execute or ask.
    /// Returns `true` when the turn must halt awaiting a decision.
    async fn handle_tool_call(
        &self,
        handle: &Arc<Mutex<Agent>>,
        agent_id: &str,
        call: &ToolCall,
        chat_id: Option<&str>,
    ) -> bool {
        let mut args = call
            .parsed_arguments()
            .unwrap_or_else(|_| serde_json::json!({}));
        normalize_aliases(&call.function.name, &mut args);
        if let Some(schema) = self.tools.schema_for(&call.function.name) {
            args = validate_tool_parameters(&args, &schema);
        }

        if id_eq(&call.function.name, HUMAN_INTERVENTION_TOOL) {
            let transform = transform_human_intervention(call, agent_id, chat_id);
            let persist = {
                let agent = handle.lock().await;
                should_persist_approval(&agent.memory, &transform.approval_message)
            };
            if persist {
                let mut carrier = transform.approval_message.clone();
                carrier.chat_id = chat_id.map(|s| s.to_string());
                handle.lock().await.memory.push(carrier);
                self.publish_carrier(&transform.approval_message, agent_id, chat_id)
                    .await;
            }
            return true;
        }

        let approved = {
            let agent = handle.lock().await;
            find_session_approval(
                &agent.memory,
                &call.function.name,
                &args,
                self.working_directory.as_deref(),
            )
        };

        if approved {
            self.execute_tool(handle, agent_id, call, &args, chat_id)
                .await;
            false
        } else {
            let carrier = build_approval_request(
                call,
                agent_id,
                chat_id,
                self.working_directory.as_deref(),
            );
            handle.lock().await.memory.push(carrier.clone());
            self.publish_carrier(&carrier, agent_id, chat_id).await;
            true
        }
    }

    /// Execute an approved call: tool lifecycle events + memory result.
    async fn execute_tool(
        &self,
        handle: &Arc<Mutex<Agent>>,
        agent_id: &str,
        call: &ToolCall,
        args: &serde_json::Value,
        chat_id: Option<&str>,
    ) {
        self.emit_tool_event(
            WorldEventType::ToolStart,
            agent_id,
            chat_id,
            serde_json::json!({
                "toolName": call.function.name,
                "toolCallId": call.id,
                "args": args,
            }),
        )
        .await;

        let outcome = self
            .tools
            .execute(&call.function.name, args, self.working_directory.as_deref())
            .await;

        let (content, event_type, detail) = match outcome {
            Ok(result) => (
                serde_json::to_string(&result).unwrap_or_else(|_| result.to_string()),
                WorldEventType::ToolResult,
                serde_json::json!({
                    "toolName": call.function.name,
                    "toolCallId": call.id,
                    "result": result,
                }),
            ),
            Err(e) => (
                format!("Tool '{}' failed: {}", call.function.name, e),
                WorldEventType::ToolError,
                serde_json::json!({
                    "toolName": call.function.name,
                    "toolCallId": call.id,
                    "error": e.to_string(),
                }),
            ),
        };

        self.emit_tool_event(event_type, agent_id, chat_id, detail).await;

        let mut result_entry = AgentMessage::tool_result(call.id.clone(), content, agent_id);
        result_entry.chat_id = chat_id.map(|s| s.to_string());
        handle.lock().await.memory.push(result_entry);
    }

    // ---- Tool-channel decisions ----

    async fn dispatch_tool_response(self: Arc<Self>, payload: ToolResponsePayload) {
        // Security gate: the decision must address a call present in some
        // agent's memory; otherwise it is dropped without side effects.
        let mut owner: Option<Arc<Mutex<Agent>>> = None;
        for handle in self.world.agent_handles().await {
            let owns = {
                let agent = handle.lock().await;
                agent.owns_tool_call(&payload.tool_call_id)
            };
            if owns {
                owner = Some(handle);
                break;
            }
        }
        let handle = match owner {
            Some(handle) => handle,
            None => {
                log::warn!(
                    "world '{}': dropping tool decision for unknown toolCallId '{}'",
                    self.world.id,
                    payload.tool_call_id
                );
                return;
            }
        };

        let runtime = Arc::clone(&self);
        tokio::spawn(async move {
            runtime.handle_tool_decision(handle, payload).await;
        });
    }

    /// Apply an approve/deny decision and resume the halted turn.
    pub async fn handle_tool_decision(
        self: Arc<Self>,
        handle: Arc<Mutex<Agent>>,
        payload: ToolResponsePayload,
    ) {
        let lock = {
            let agent = handle.lock().await;
            self.turn_lock(&agent.id).await
        };
        let _turn = lock.lock().await;

        let (agent_id, agent_name, original) = {
            let agent = handle.lock().await;
            (
                agent.id.clone(),
                agent.name.clone(),
                agent.find_tool_call(&payload.tool_call_id),
            )
        };
        let original = match original {
            Some(call) => call,
            None => {
                log::warn!(
                    "world '{}': tool decision raced memory for '{}'",
                    self.world.id,
                    payload.tool_call_id
                );
                return;
            }
        };

        let chat_id = payload.chat_id.clone();
        let tool_name = payload
            .tool_name
            .clone()
            .unwrap_or_else(|| original.function.name.clone());
        let mut tool_args = payload.tool_args.clone().unwrap_or_else(|| {
            original
                .parsed_arguments()
                .unwrap_or_else(|_| serde_json::json!({}))
        });
        normalize_aliases(&tool_name, &mut tool_args);
        if let Some(schema) = self.tools.schema_for(&tool_name) {
            tool_args = validate_tool_parameters(&tool_args, &schema);
        }

        match payload.decision {
            crate::worldllm::event::ApprovalDecision::Approve => {
                if payload.scope == crate::worldllm::event::ApprovalScope::Session {
                    // Persist the reusable approval record; it is hidden
                    // from prepared LLM requests by its `approval_` id.
                    let inner = serde_json::json!({
                        "decision": "approve",
                        "scope": "session",
                        "toolName": tool_name,
                        "toolArgs": tool_args,
                        "workingDirectory": payload.working_directory,
                    });
                    let record = serde_json::json!({
                        "__type": "tool_result",
                        "content": inner.to_string(),
                    });
                    let mut entry = AgentMessage::tool_result(
                        format!("approval_{}", payload.tool_call_id),
                        record.to_string(),
                        "human",
                    );
                    entry.chat_id = chat_id.clone();
                    handle.lock().await.memory.push(entry);
                }

                self.execute_tool(&handle, &agent_id, &original, &tool_args, chat_id.as_deref())
                    .await;
                self.mark_call_complete(&handle, &payload, "approve").await;
            }
            crate::worldllm::event::ApprovalDecision::Deny => {
                let mut entry = AgentMessage::tool_result(
                    payload.tool_call_id.clone(),
                    TOOL_DENIED_RESULT,
                    "human",
                );
                entry.chat_id = chat_id.clone();
                handle.lock().await.memory.push(entry);
                self.mark_call_complete(&handle, &payload, "deny").await;
            }
        }
        self.persist(&handle).await;

        // Resume: follow-up LLM call with the decision in memory, then keep
        // looping until the assistant settles.
        let response = match self
            .follow_up_llm_call(&handle, &agent_name, chat_id.as_deref())
            .await
        {
            Some(response) => response,
            None => return,
        };
        let reply_to = self.last_user_sender(&handle, chat_id.as_deref()).await;
        self.finalize_response(&handle, &agent_id, &response, &chat_id, &reply_to)
            .await;
        self.run_tool_loop(&handle, response, chat_id, reply_to).await;
    }

    async fn mark_call_complete(
        &self,
        handle: &Arc<Mutex<Agent>>,
        payload: &ToolResponsePayload,
        decision: &str,
    ) {
        let mut agent = handle.lock().await;
        for message in agent.memory.iter_mut().rev() {
            if let Some(status) = message.tool_call_status.get_mut(&payload.tool_call_id) {
                status.complete = true;
                status.result = Some(serde_json::json!({
                    "decision": decision,
                    "scope": payload.scope,
                }));
                return;
            }
        }
    }

    // ---- LLM plumbing ----

    /// Issue one LLM round-trip, streaming SSE events pinned to `chat_id`.
    async fn call_llm(
        &self,
        agent_name: &str,
        prepared: &[AgentMessage],
        chat_id: Option<&str>,
    ) -> Result<CompletionResponse, Box<dyn Error + Send + Sync>> {
        let message_id = format!("msg-{}", uuid::Uuid::new_v4());
        let tools = self.tools.definitions();

        self.emit_sse(SseEventType::Start, agent_name, None, &message_id, chat_id)
            .await;

        let streamed = self.llm.complete_stream(prepared, &tools).await;
        let result = match streamed {
            Ok(Some(mut stream)) => {
                let mut content = String::new();
                let mut tool_calls = Vec::new();
                let mut failed: Option<Box<dyn Error + Send + Sync>> = None;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if !chunk.content.is_empty() {
                                content.push_str(&chunk.content);
                                self.emit_sse(
                                    SseEventType::Chunk,
                                    agent_name,
                                    Some(chunk.content.clone()),
                                    &message_id,
                                    chat_id,
                                )
                                .await;
                            }
                            tool_calls.extend(chunk.tool_calls);
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                match failed {
                    Some(e) => Err(e),
                    None => Ok(CompletionResponse {
                        content,
                        tool_calls,
                    }),
                }
            }
            Ok(None) => match self.llm.complete(prepared, &tools).await {
                Ok(response) => {
                    if !response.content.is_empty() {
                        self.emit_sse(
                            SseEventType::Chunk,
                            agent_name,
                            Some(response.content.clone()),
                            &message_id,
                            chat_id,
                        )
                        .await;
                    }
                    Ok(response)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                self.emit_sse(
                    SseEventType::Complete,
                    agent_name,
                    None,
                    &message_id,
                    chat_id,
                )
                .await;
            }
            Err(e) => {
                self.emit_sse(
                    SseEventType::Error,
                    agent_name,
                    Some(e.to_string()),
                    &message_id,
                    chat_id,
                )
                .await;
            }
        }
        result
    }

    /// Follow-up round: full chat-filtered memory, no separate current.
    async fn follow_up_llm_call(
        &self,
        handle: &Arc<Mutex<Agent>>,
        agent_name: &str,
        chat_id: Option<&str>,
    ) -> Option<CompletionResponse> {
        if self.world.stop_requested(chat_id).await {
            return None;
        }
        let (system_prompt, memory) = {
            let agent = handle.lock().await;
            (agent.system_prompt.clone(), agent.memory.clone())
        };
        let prepared = prepare_messages_for_llm(
            &system_prompt,
            &memory,
            None,
            HistoryFilter::Chat(chat_id),
        );
        match self.call_llm(agent_name, &prepared, chat_id).await {
            Ok(response) => {
                let mut agent = handle.lock().await;
                agent.llm_call_count += 1;
                agent.last_active = Utc::now();
                Some(response)
            }
            Err(e) => {
                log::error!(
                    "world '{}': follow-up LLM call failed: {}",
                    self.world.id,
                    e
                );
                None
            }
        }
    }

    /// Normalize, persist, and publish a follow-up assistant response.
    async fn finalize_response(
        &self,
        handle: &Arc<Mutex<Agent>>,
        agent_id: &str,
        response: &CompletionResponse,
        chat_id: &Option<String>,
        reply_to_sender: &Option<String>,
    ) {
        let stripped = remove_self_mentions(&response.content, agent_id);
        let final_content = match reply_to_sender {
            Some(sender) if !id_eq(sender, agent_id) => add_auto_mention(&stripped, sender),
            _ => stripped.trim().to_string(),
        };

        if final_content.is_empty() && response.tool_calls.is_empty() {
            return;
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        {
            let mut entry = AgentMessage::assistant(final_content.clone(), agent_id)
                .with_chat_id(chat_id.clone())
                .with_message_id(message_id.clone());
            entry.tool_calls = response.tool_calls.clone();
            handle.lock().await.memory.push(entry);
        }
        self.persist(handle).await;

        if !final_content.is_empty() {
            let mut publish =
                MessageEventPayload::text(final_content, agent_id, chat_id.clone());
            publish.message_id = message_id;
            publish.role = Some(Role::Assistant);
            self.world.publish_message(publish).await;
        }
    }

    /// Publish the approval carrier so transports see the pending request.
    async fn publish_carrier(
        &self,
        carrier: &AgentMessage,
        agent_id: &str,
        chat_id: Option<&str>,
    ) {
        let mut publish = MessageEventPayload::text(
            carrier.content.clone(),
            agent_id,
            chat_id.map(|s| s.to_string()),
        );
        if let Some(message_id) = &carrier.message_id {
            publish.message_id = message_id.clone();
        }
        publish.role = Some(Role::Assistant);
        publish.tool_calls = carrier.tool_calls.clone();
        publish.tool_call_status = carrier.tool_call_status.clone();
        self.world.publish_message(publish).await;
    }

    /// Sender of the most recent user turn in this chat, for auto-mention
    /// on resumed turns.
    async fn last_user_sender(
        &self,
        handle: &Arc<Mutex<Agent>>,
        chat_id: Option<&str>,
    ) -> Option<String> {
        let agent = handle.lock().await;
        agent
            .memory
            .iter()
            .rev()
            .find(|m| m.role == Role::User && m.chat_id.as_deref() == chat_id)
            .and_then(|m| m.sender.clone())
    }

    async fn emit_sse(
        &self,
        event_type: SseEventType,
        agent_name: &str,
        content: Option<String>,
        message_id: &str,
        chat_id: Option<&str>,
    ) {
        self.world
            .bus()
            .emit(WorldEvent::Sse(SseEventPayload {
                event_type,
                agent_name: agent_name.to_string(),
                content,
                message_id: Some(message_id.to_string()),
                chat_id: chat_id.map(|s| s.to_string()),
            }))
            .await;
    }

    async fn emit_tool_event(
        &self,
        event_type: WorldEventType,
        agent_id: &str,
        chat_id: Option<&str>,
        detail: serde_json::Value,
    ) {
        self.world
            .bus()
            .emit(WorldEvent::World(WorldActivityPayload {
                event_type,
                source: format!("agent:{}", agent_id),
                agent_name: Some(agent_id.to_string()),
                chat_id: chat_id.map(|s| s.to_string()),
                tool_execution: Some(detail),
                pending_operations: None,
                activity_id: None,
                active_sources: None,
            }))
            .await;
    }

    async fn persist(&self, handle: &Arc<Mutex<Agent>>) {
        let snapshot = handle.lock().await.clone();
        if let Err(e) = self.world.persist_agent(&snapshot).await {
            log::warn!(
                "world '{}': failed to persist agent '{}': {}",
                self.world.id,
                snapshot.id,
                e
            );
        }
    }
}

/// Bus-facing adapter: holds the runtime weakly so a dropped world does not
/// keep its pipeline alive through the sink registry.
struct RuntimeSink {
    runtime: std::sync::Weak<AgentRuntime>,
}

#[async_trait]
impl EventSink for RuntimeSink {
    async fn deliver(&self, event: &WorldEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        let runtime = match self.runtime.upgrade() {
            Some(runtime) => runtime,
            None => return Ok(()),
        };
        // Spawn real work so emission never blocks on a turn.
        match event {
            WorldEvent::Message(payload) => {
                let payload = payload.clone();
                tokio::spawn(async move {
                    runtime.dispatch_message(payload).await;
                });
            }
            WorldEvent::Tool(payload) => {
                let payload = payload.clone();
                tokio::spawn(async move {
                    runtime.dispatch_tool_response(payload).await;
                });
            }
            _ => {}
        }
        Ok(())
    }
}
