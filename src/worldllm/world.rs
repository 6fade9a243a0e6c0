//! Worlds, agents, and chats.
//!
//! A [`World`] is the unit of isolation: it owns its agents, its chats, its
//! event bus, its activity tracker, and its storage handles. Agents and
//! chats live in id-keyed arenas inside the world; nothing holds a
//! reference back to the world except by id.
//!
//! The [`WorldManager`] is the process-wide registry of live worlds. CRUD
//! operations on worlds, agents, and chats are persisted both as entity
//! records (via [`StorageAPI`]) and as append-only `crud` events (via
//! [`EventStorage`]).

use crate::worldllm::activity::ActivityTracker;
use crate::worldllm::chat_completion::{AgentMessage, Role};
use crate::worldllm::config::NewChatConfig;
use crate::worldllm::error::WorldError;
use crate::worldllm::event::{MessageEventPayload, SystemEventPayload, WorldEvent, WorldEventBus};
use crate::worldllm::event_meta::{derive_event_meta, AgentDirectory, SenderCategory};
use crate::worldllm::ids::{id_eq, to_kebab_case};
use crate::worldllm::storage::{
    AgentData, ChatData, ChatUpdate, EventStorage, StorageAPI, StoredEvent, StoredEventType,
    WorldData,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A live agent: persistent identity plus in-memory conversation state.
///
/// Memory is append-only during a turn and has a single writer, the
/// processing pipeline for this agent. The agent id is stable across
/// renames; `name` may diverge from it.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub memory: Vec<AgentMessage>,
    pub llm_call_count: u64,
    pub status: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub last_active: chrono::DateTime<Utc>,
}

impl Agent {
    pub fn from_data(data: AgentData, memory: Vec<AgentMessage>) -> Self {
        Agent {
            id: data.id,
            name: data.name,
            agent_type: data.agent_type,
            provider: data.provider,
            model: data.model,
            system_prompt: data.system_prompt,
            memory,
            llm_call_count: data.llm_call_count,
            status: data.status,
            created_at: data.created_at,
            last_active: data.last_active,
        }
    }

    pub fn to_data(&self) -> AgentData {
        AgentData {
            id: self.id.clone(),
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            llm_call_count: self.llm_call_count,
            status: self.status.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    /// True when some assistant entry in memory carries a tool call with
    /// this id. This is the security gate for inbound tool decisions.
    pub fn owns_tool_call(&self, tool_call_id: &str) -> bool {
        self.memory.iter().any(|m| {
            m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == tool_call_id)
        })
    }

    /// The assistant tool call with the given id, if present in memory.
    pub fn find_tool_call(&self, tool_call_id: &str) -> Option<crate::worldllm::chat_completion::ToolCall> {
        self.memory.iter().rev().find_map(|m| {
            m.tool_calls.iter().find(|c| c.id == tool_call_id).cloned()
        })
    }
}

/// Parameters for registering a new agent.
#[derive(Debug, Clone)]
pub struct AgentParams {
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
}

struct WorldState {
    name: String,
    description: String,
    turn_limit: u32,
    current_chat_id: Option<String>,
    chats: HashMap<String, ChatData>,
}

/// A named container grouping agents, chats, a current-chat pointer, an
/// event bus, and storage handles.
pub struct World {
    pub id: String,
    state: Mutex<WorldState>,
    agents: RwLock<HashMap<String, Arc<Mutex<Agent>>>>,
    bus: Arc<WorldEventBus>,
    activity: ActivityTracker,
    storage: Arc<dyn StorageAPI>,
    event_storage: Arc<dyn EventStorage>,
    /// Chats with a stop requested; cleared when the next message arrives.
    stop_requests: Mutex<HashSet<Option<String>>>,
    /// Consecutive agent-to-agent hops per chat since the last human turn.
    turn_hops: Mutex<HashMap<Option<String>, u32>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World").field("id", &self.id).finish()
    }
}

impl World {
    /// Create a new world with an auto-created current chat, persisting
    /// both and recording `crud` events.
    pub async fn create(
        name: &str,
        description: &str,
        turn_limit: u32,
        storage: Arc<dyn StorageAPI>,
        event_storage: Arc<dyn EventStorage>,
        new_chat: &NewChatConfig,
    ) -> Result<Arc<World>, WorldError> {
        let id = to_kebab_case(name);
        if id.is_empty() {
            return Err(WorldError::Validation(format!(
                "world name '{}' normalizes to an empty id",
                name
            )));
        }

        let world = Arc::new(World {
            id: id.clone(),
            state: Mutex::new(WorldState {
                name: name.to_string(),
                description: description.to_string(),
                turn_limit,
                current_chat_id: None,
                chats: HashMap::new(),
            }),
            agents: RwLock::new(HashMap::new()),
            bus: Arc::new(WorldEventBus::new(id.clone())),
            activity: ActivityTracker::new(),
            storage,
            event_storage,
            stop_requests: Mutex::new(HashSet::new()),
            turn_hops: Mutex::new(HashMap::new()),
        });

        world.save().await?;
        world.record_crud("create", "world", &world.id, None).await;
        world.create_chat(None, new_chat).await?;
        Ok(world)
    }

    /// Rebuild a live world from storage.
    pub async fn from_storage(
        world_id: &str,
        storage: Arc<dyn StorageAPI>,
        event_storage: Arc<dyn EventStorage>,
    ) -> Result<Arc<World>, WorldError> {
        let data = storage
            .load_world(world_id)
            .await
            .map_err(|e| match e {
                crate::worldllm::storage::StorageError::NotFound(msg) => WorldError::NotFound(msg),
                other => WorldError::External(other.to_string()),
            })?;

        let chats = storage
            .list_chats(world_id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut agents = HashMap::new();
        let agent_list = storage
            .list_agents(world_id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        for agent_data in agent_list {
            let loaded = crate::worldllm::storage::load_agent_with_retry(
                storage.as_ref(),
                world_id,
                &agent_data.id,
                3,
            )
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
            agents.insert(
                agent_data.id.clone(),
                Arc::new(Mutex::new(Agent::from_data(loaded.agent, loaded.memory))),
            );
        }

        let bus = Arc::new(WorldEventBus::new(data.id.clone()));
        bus.set_current_chat(data.current_chat_id.clone()).await;

        Ok(Arc::new(World {
            id: data.id.clone(),
            state: Mutex::new(WorldState {
                name: data.name,
                description: data.description,
                turn_limit: data.turn_limit,
                current_chat_id: data.current_chat_id,
                chats,
            }),
            agents: RwLock::new(agents),
            bus,
            activity: ActivityTracker::new(),
            storage,
            event_storage,
            stop_requests: Mutex::new(HashSet::new()),
            turn_hops: Mutex::new(HashMap::new()),
        }))
    }

    /// Reload chats, agents, and the current-chat pointer from storage,
    /// keeping the bus (and everything attached to it) intact.
    pub async fn refresh(&self) -> Result<(), WorldError> {
        let data = self
            .storage
            .load_world(&self.id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        let chats: HashMap<String, ChatData> = self
            .storage
            .list_chats(&self.id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut fresh_agents = HashMap::new();
        let agent_list = self
            .storage
            .list_agents(&self.id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        for agent_data in agent_list {
            let loaded = crate::worldllm::storage::load_agent_with_retry(
                self.storage.as_ref(),
                &self.id,
                &agent_data.id,
                3,
            )
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
            fresh_agents.insert(
                agent_data.id.clone(),
                Arc::new(Mutex::new(Agent::from_data(loaded.agent, loaded.memory))),
            );
        }

        {
            let mut state = self.state.lock().await;
            state.name = data.name;
            state.description = data.description;
            state.turn_limit = data.turn_limit;
            state.current_chat_id = data.current_chat_id.clone();
            state.chats = chats;
        }
        *self.agents.write().await = fresh_agents;
        self.bus.set_current_chat(data.current_chat_id).await;
        Ok(())
    }

    pub fn bus(&self) -> &Arc<WorldEventBus> {
        &self.bus
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn storage(&self) -> &Arc<dyn StorageAPI> {
        &self.storage
    }

    pub fn event_storage(&self) -> &Arc<dyn EventStorage> {
        &self.event_storage
    }

    /// Serializable summary of the world's persistent fields.
    pub async fn snapshot(&self) -> WorldData {
        let state = self.state.lock().await;
        WorldData {
            id: self.id.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            turn_limit: state.turn_limit,
            current_chat_id: state.current_chat_id.clone(),
        }
    }

    async fn save(&self) -> Result<(), WorldError> {
        let data = self.snapshot().await;
        self.storage
            .save_world(&data)
            .await
            .map_err(|e| WorldError::External(e.to_string()))
    }

    // ---- Agents ----

    /// Register a new agent. The id is the kebab-case of the name and must
    /// be unique within the world.
    pub async fn register_agent(&self, params: AgentParams) -> Result<Arc<Mutex<Agent>>, WorldError> {
        let id = to_kebab_case(&params.name);
        if id.is_empty() {
            return Err(WorldError::Validation(format!(
                "agent name '{}' normalizes to an empty id",
                params.name
            )));
        }
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(WorldError::Conflict(format!(
                "agent '{}' already exists in world '{}'",
                id, self.id
            )));
        }

        let now = Utc::now();
        let agent = Agent {
            id: id.clone(),
            name: params.name,
            agent_type: params.agent_type,
            provider: params.provider,
            model: params.model,
            system_prompt: params.system_prompt,
            memory: Vec::new(),
            llm_call_count: 0,
            status: None,
            created_at: now,
            last_active: now,
        };
        self.storage
            .save_agent(&self.id, &agent.to_data())
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        self.record_crud("create", "agent", &id, Some(serde_json::to_value(agent.to_data()).unwrap_or_default()))
            .await;

        let handle = Arc::new(Mutex::new(agent));
        agents.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Resolve an agent by stable id or display name, case-insensitively.
    pub async fn resolve_agent(&self, name_or_id: &str) -> Option<Arc<Mutex<Agent>>> {
        let agents = self.agents.read().await;
        if let Some(agent) = agents.get(name_or_id) {
            return Some(Arc::clone(agent));
        }
        for handle in agents.values() {
            let agent = handle.lock().await;
            if id_eq(&agent.id, name_or_id) || id_eq(&agent.name, name_or_id) {
                drop(agent);
                return Some(Arc::clone(handle));
            }
        }
        None
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), WorldError> {
        let removed = self.agents.write().await.remove(agent_id);
        if removed.is_none() {
            return Err(WorldError::NotFound(format!(
                "agent '{}' in world '{}'",
                agent_id, self.id
            )));
        }
        self.storage
            .delete_agent(&self.id, agent_id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        self.record_crud("delete", "agent", agent_id, None).await;
        Ok(())
    }

    pub async fn agent_handles(&self) -> Vec<Arc<Mutex<Agent>>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// `(id, name)` pairs for mention resolution.
    pub async fn agent_directory(&self) -> AgentDirectory {
        let agents = self.agents.read().await;
        let mut entries = Vec::with_capacity(agents.len());
        for handle in agents.values() {
            let agent = handle.lock().await;
            entries.push((agent.id.clone(), agent.name.clone()));
        }
        entries.sort();
        AgentDirectory::new(entries)
    }

    /// Persist an agent's record and memory after a pipeline mutation.
    pub async fn persist_agent(&self, agent: &Agent) -> Result<(), WorldError> {
        self.storage
            .save_agent(&self.id, &agent.to_data())
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        self.storage
            .save_agent_memory(&self.id, &agent.id, &agent.memory)
            .await
            .map_err(|e| WorldError::External(e.to_string()))
    }

    // ---- Chats ----

    /// Create (or reuse) a chat and make it current.
    ///
    /// With the optimization enabled, the newest chat is reused instead when
    /// it still carries the reusable sentinel title, has no messages, and is
    /// younger than the configured age.
    pub async fn create_chat(
        &self,
        name: Option<String>,
        config: &NewChatConfig,
    ) -> Result<ChatData, WorldError> {
        let mut state = self.state.lock().await;

        if config.enable_optimization && name.is_none() {
            let newest = state
                .chats
                .values()
                .max_by_key(|c| c.created_at)
                .cloned();
            if let Some(chat) = newest {
                let age_ms = (Utc::now() - chat.created_at).num_milliseconds();
                if chat.name == config.reusable_title
                    && chat.message_count == 0
                    && age_ms >= 0
                    && (age_ms as u64) <= config.max_reusable_age_ms
                {
                    state.current_chat_id = Some(chat.id.clone());
                    drop(state);
                    self.bus.set_current_chat(Some(chat.id.clone())).await;
                    self.save().await?;
                    return Ok(chat);
                }
            }
        }

        let now = Utc::now();
        let chat = ChatData {
            id: format!("chat-{}", uuid::Uuid::new_v4()),
            world_id: self.id.clone(),
            name: name.unwrap_or_else(|| config.reusable_title.clone()),
            description: None,
            created_at: now,
            updated_at: now,
            message_count: 0,
        };
        state.chats.insert(chat.id.clone(), chat.clone());
        state.current_chat_id = Some(chat.id.clone());
        drop(state);

        self.bus.set_current_chat(Some(chat.id.clone())).await;
        self.storage
            .save_chat_data(&chat)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        self.save().await?;
        self.record_crud(
            "create",
            "chat",
            &chat.id,
            Some(serde_json::to_value(&chat).unwrap_or_default()),
        )
        .await;
        Ok(chat)
    }

    /// Delete a chat; clears the current-chat pointer when it pointed here.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), WorldError> {
        let mut state = self.state.lock().await;
        if state.chats.remove(chat_id).is_none() {
            return Err(WorldError::NotFound(format!(
                "chat '{}' in world '{}'",
                chat_id, self.id
            )));
        }
        let cleared = state.current_chat_id.as_deref() == Some(chat_id);
        if cleared {
            state.current_chat_id = None;
        }
        drop(state);

        if cleared {
            self.bus.set_current_chat(None).await;
        }
        self.storage
            .delete_chat_data(&self.id, chat_id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        self.save().await?;
        self.record_crud("delete", "chat", chat_id, None).await;
        Ok(())
    }

    /// Point the world at an existing chat.
    pub async fn set_current_chat(&self, chat_id: &str) -> Result<(), WorldError> {
        let mut state = self.state.lock().await;
        if !state.chats.contains_key(chat_id) {
            return Err(WorldError::NotFound(format!(
                "chat '{}' in world '{}'",
                chat_id, self.id
            )));
        }
        state.current_chat_id = Some(chat_id.to_string());
        drop(state);
        self.bus.set_current_chat(Some(chat_id.to_string())).await;
        self.save().await
    }

    pub async fn current_chat_id(&self) -> Option<String> {
        self.state.lock().await.current_chat_id.clone()
    }

    pub async fn list_chats(&self) -> Vec<ChatData> {
        let state = self.state.lock().await;
        let mut chats: Vec<ChatData> = state.chats.values().cloned().collect();
        chats.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        chats
    }

    pub async fn turn_limit(&self) -> u32 {
        self.state.lock().await.turn_limit
    }

    // ---- Stop / turn accounting ----

    /// Request a best-effort stop of in-flight work scoped to `chat_id`.
    pub async fn request_stop(&self, chat_id: Option<&str>) {
        self.stop_requests
            .lock()
            .await
            .insert(chat_id.map(|s| s.to_string()));
    }

    /// Consult and keep the stop flag; the pipeline checks this between
    /// suspension points.
    pub async fn stop_requested(&self, chat_id: Option<&str>) -> bool {
        self.stop_requests
            .lock()
            .await
            .contains(&chat_id.map(|s| s.to_string()))
    }

    pub async fn clear_stop(&self, chat_id: Option<&str>) {
        self.stop_requests
            .lock()
            .await
            .remove(&chat_id.map(|s| s.to_string()));
    }

    /// Record one agent-to-agent hop; returns the updated consecutive count.
    pub async fn note_agent_hop(&self, chat_id: Option<&str>) -> u32 {
        let mut hops = self.turn_hops.lock().await;
        let counter = hops.entry(chat_id.map(|s| s.to_string())).or_insert(0);
        *counter += 1;
        *counter
    }

    /// A human turn resets the hop counter for its chat.
    pub async fn reset_turn_hops(&self, chat_id: Option<&str>) {
        self.turn_hops
            .lock()
            .await
            .remove(&chat_id.map(|s| s.to_string()));
    }

    // ---- Publishing ----

    /// Publish a message event: derive persistence metadata, emit on the
    /// bus (pinning the chatId), append to event storage, and bump the
    /// chat's message count.
    ///
    /// Returns the payload as pinned by the bus.
    pub async fn publish_message(&self, payload: MessageEventPayload) -> MessageEventPayload {
        let directory = self.agent_directory().await;
        let sender_category =
            crate::worldllm::event_meta::classify_sender(&payload.sender, &directory);

        if sender_category == SenderCategory::Human {
            self.reset_turn_hops(payload.chat_id.as_deref()).await;
            self.clear_stop(payload.chat_id.as_deref()).await;
        }

        let pinned = self
            .bus
            .emit(WorldEvent::Message(payload))
            .await;
        let payload = match pinned {
            WorldEvent::Message(p) => p,
            _ => unreachable!("emitted a message event"),
        };

        let meta = derive_event_meta(&payload, &directory);
        let stored = StoredEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: StoredEventType::Message,
            world_id: self.id.clone(),
            chat_id: payload.chat_id.clone(),
            timestamp: payload.timestamp,
            payload: serde_json::to_value(&payload).unwrap_or_default(),
            meta: Some(meta),
        };
        if let Err(e) = self.event_storage.append_event(&stored).await {
            log::warn!("world '{}': failed to persist message event: {}", self.id, e);
        }

        if let Some(chat_id) = payload.chat_id.clone() {
            self.bump_message_count(&chat_id).await;
        }

        payload
    }

    /// Persist a non-message event (sse/tool/system) to the event log.
    pub async fn persist_event(&self, event_type: StoredEventType, event: &WorldEvent) {
        let stored = StoredEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            world_id: self.id.clone(),
            chat_id: event.chat_id().map(|s| s.to_string()),
            timestamp: Utc::now(),
            payload: serde_json::to_value(event).unwrap_or_default(),
            meta: None,
        };
        if let Err(e) = self.event_storage.append_event(&stored).await {
            log::warn!("world '{}': failed to persist {} event: {}", self.id, stored_type_name(event_type), e);
        }
    }

    async fn bump_message_count(&self, chat_id: &str) {
        let update = {
            let mut state = self.state.lock().await;
            match state.chats.get_mut(chat_id) {
                Some(chat) => {
                    chat.message_count += 1;
                    chat.updated_at = Utc::now();
                    Some(ChatUpdate {
                        message_count: Some(chat.message_count),
                        ..Default::default()
                    })
                }
                None => None,
            }
        };
        if let Some(update) = update {
            if let Err(e) = self.storage.update_chat_data(&self.id, chat_id, &update).await {
                log::debug!("world '{}': chat count update failed: {}", self.id, e);
            }
        }
    }

    /// Rename a chat: in-memory state, stored record, and a
    /// `chat-title-updated` system event.
    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), WorldError> {
        {
            let mut state = self.state.lock().await;
            let chat = state.chats.get_mut(chat_id).ok_or_else(|| {
                WorldError::NotFound(format!("chat '{}' in world '{}'", chat_id, self.id))
            })?;
            chat.name = title.to_string();
            chat.updated_at = Utc::now();
        }
        let update = ChatUpdate {
            name: Some(title.to_string()),
            ..Default::default()
        };
        self.storage
            .update_chat_data(&self.id, chat_id, &update)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        let event = self
            .bus
            .emit(WorldEvent::System(SystemEventPayload {
                kind: "chat-title-updated".to_string(),
                data: serde_json::json!({ "chatId": chat_id, "title": title }),
                chat_id: Some(chat_id.to_string()),
            }))
            .await;
        self.persist_event(StoredEventType::System, &event).await;
        Ok(())
    }

    /// Append a `crud` event for an entity operation in this world.
    pub async fn record_crud(
        &self,
        operation: &str,
        entity_type: &str,
        entity_id: &str,
        entity_data: Option<serde_json::Value>,
    ) {
        let now = Utc::now();
        let stored = StoredEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: StoredEventType::Crud,
            world_id: self.id.clone(),
            chat_id: None,
            timestamp: now,
            payload: serde_json::json!({
                "operation": operation,
                "entityType": entity_type,
                "entityId": entity_id,
                "entityData": entity_data,
                "timestamp": now,
            }),
            meta: None,
        };
        if let Err(e) = self.event_storage.append_event(&stored).await {
            log::warn!("world '{}': failed to persist crud event: {}", self.id, e);
        }
    }
}

fn stored_type_name(event_type: StoredEventType) -> &'static str {
    match event_type {
        StoredEventType::Message => "message",
        StoredEventType::Sse => "sse",
        StoredEventType::Tool => "tool",
        StoredEventType::System => "system",
        StoredEventType::Crud => "crud",
    }
}

/// Process-wide registry of live worlds.
pub struct WorldManager {
    storage: Arc<dyn StorageAPI>,
    event_storage: Arc<dyn EventStorage>,
    new_chat: NewChatConfig,
    worlds: RwLock<HashMap<String, Arc<World>>>,
}

impl WorldManager {
    pub fn new(
        storage: Arc<dyn StorageAPI>,
        event_storage: Arc<dyn EventStorage>,
        new_chat: NewChatConfig,
    ) -> Self {
        WorldManager {
            storage,
            event_storage,
            new_chat,
            worlds: RwLock::new(HashMap::new()),
        }
    }

    pub fn new_chat_config(&self) -> &NewChatConfig {
        &self.new_chat
    }

    pub async fn create_world(
        &self,
        name: &str,
        description: &str,
        turn_limit: u32,
    ) -> Result<Arc<World>, WorldError> {
        let id = to_kebab_case(name);
        {
            let worlds = self.worlds.read().await;
            if worlds.contains_key(&id) {
                return Err(WorldError::Conflict(format!("world '{}' already exists", id)));
            }
        }
        let world = World::create(
            name,
            description,
            turn_limit,
            Arc::clone(&self.storage),
            Arc::clone(&self.event_storage),
            &self.new_chat,
        )
        .await?;
        self.worlds
            .write()
            .await
            .insert(world.id.clone(), Arc::clone(&world));
        Ok(world)
    }

    /// Fetch a live world by id, or by the kebab-case of its name.
    pub async fn get_world(&self, id_or_name: &str) -> Option<Arc<World>> {
        let worlds = self.worlds.read().await;
        if let Some(world) = worlds.get(id_or_name) {
            return Some(Arc::clone(world));
        }
        let alias = to_kebab_case(id_or_name);
        worlds.get(&alias).cloned()
    }

    /// Load a world from storage into the registry if not already live.
    pub async fn ensure_world(&self, world_id: &str) -> Result<Arc<World>, WorldError> {
        if let Some(world) = self.get_world(world_id).await {
            return Ok(world);
        }
        let world = World::from_storage(
            world_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.event_storage),
        )
        .await?;
        self.worlds
            .write()
            .await
            .insert(world.id.clone(), Arc::clone(&world));
        Ok(world)
    }

    /// Remove a world from the registry and storage.
    pub async fn delete_world(&self, world_id: &str) -> Result<(), WorldError> {
        let world = self
            .worlds
            .write()
            .await
            .remove(world_id)
            .ok_or_else(|| WorldError::NotFound(format!("world '{}'", world_id)))?;
        self.storage
            .delete_world(world_id)
            .await
            .map_err(|e| WorldError::External(e.to_string()))?;
        world.record_crud("delete", "world", world_id, None).await;
        Ok(())
    }

    pub async fn list_worlds(&self) -> Vec<Arc<World>> {
        self.worlds.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldllm::storage::MemoryStorage;

    fn stores() -> (Arc<MemoryStorage>, Arc<dyn StorageAPI>, Arc<dyn EventStorage>) {
        let backing = Arc::new(MemoryStorage::new());
        (
            Arc::clone(&backing),
            backing.clone() as Arc<dyn StorageAPI>,
            backing as Arc<dyn EventStorage>,
        )
    }

    fn params(name: &str) -> AgentParams {
        AgentParams {
            name: name.to_string(),
            agent_type: "assistant".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            system_prompt: "You are helpful.".to_string(),
        }
    }

    #[tokio::test]
    async fn create_world_auto_creates_current_chat() {
        let (_, storage, events) = stores();
        let world = World::create("My World", "", 5, storage, events, &NewChatConfig::default())
            .await
            .unwrap();
        assert_eq!(world.id, "my-world");
        let current = world.current_chat_id().await;
        assert!(current.is_some());
        assert_eq!(world.list_chats().await.len(), 1);
        assert_eq!(world.bus().current_chat().await, current);
    }

    #[tokio::test]
    async fn reusable_new_chat_is_reused() {
        let (_, storage, events) = stores();
        let config = NewChatConfig::default();
        let world = World::create("w", "", 5, storage, events, &config)
            .await
            .unwrap();
        let first = world.current_chat_id().await.unwrap();

        // Fresh, empty, sentinel-titled chat: creating again reuses it.
        let chat = world.create_chat(None, &config).await.unwrap();
        assert_eq!(chat.id, first);
        assert_eq!(world.list_chats().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_optimization_always_creates() {
        let (_, storage, events) = stores();
        let config = NewChatConfig {
            enable_optimization: false,
            ..NewChatConfig::default()
        };
        let world = World::create("w", "", 5, storage, events, &config)
            .await
            .unwrap();
        let first = world.current_chat_id().await.unwrap();
        let chat = world.create_chat(None, &config).await.unwrap();
        assert_ne!(chat.id, first);
        assert_eq!(world.list_chats().await.len(), 2);
    }

    #[tokio::test]
    async fn chat_with_messages_is_not_reused() {
        let (_, storage, events) = stores();
        let config = NewChatConfig::default();
        let world = World::create("w", "", 5, storage, events, &config)
            .await
            .unwrap();
        let first = world.current_chat_id().await.unwrap();

        world
            .publish_message(MessageEventPayload::text("hello", "human", None))
            .await;

        let chat = world.create_chat(None, &config).await.unwrap();
        assert_ne!(chat.id, first);
    }

    #[tokio::test]
    async fn delete_chat_clears_current_pointer() {
        let (_, storage, events) = stores();
        let config = NewChatConfig::default();
        let world = World::create("w", "", 5, storage, events, &config)
            .await
            .unwrap();
        let chat_id = world.current_chat_id().await.unwrap();
        world.delete_chat(&chat_id).await.unwrap();
        assert_eq!(world.current_chat_id().await, None);
        assert_eq!(world.bus().current_chat().await, None);
    }

    #[tokio::test]
    async fn agent_registration_and_resolution() {
        let (_, storage, events) = stores();
        let world = World::create("w", "", 5, storage, events, &NewChatConfig::default())
            .await
            .unwrap();
        world.register_agent(params("Alice Smith")).await.unwrap();

        assert!(world.resolve_agent("alice-smith").await.is_some());
        assert!(world.resolve_agent("Alice Smith").await.is_some());
        assert!(world.resolve_agent("ALICE-SMITH").await.is_some());
        assert!(world.resolve_agent("bob").await.is_none());

        let err = world.register_agent(params("alice smith")).await.unwrap_err();
        assert!(matches!(err, WorldError::Conflict(_)));
    }

    #[tokio::test]
    async fn publish_message_pins_chat_and_persists_with_meta() {
        let (backing, storage, events) = stores();
        let world = World::create("w", "", 5, storage, events, &NewChatConfig::default())
            .await
            .unwrap();
        world.register_agent(params("alice")).await.unwrap();
        let chat_id = world.current_chat_id().await.unwrap();

        let pinned = world
            .publish_message(MessageEventPayload::text("Hello @alice", "human", None))
            .await;
        assert_eq!(pinned.chat_id.as_deref(), Some(chat_id.as_str()));

        let stored = backing
            .get_events_by_world_and_chat("w", Some(&chat_id))
            .await
            .unwrap();
        let message_events: Vec<_> = stored
            .iter()
            .filter(|e| e.event_type == StoredEventType::Message)
            .collect();
        assert_eq!(message_events.len(), 1);
        let meta = message_events[0].meta.as_ref().unwrap();
        assert_eq!(meta.recipient_agent_id.as_deref(), Some("alice"));
        assert!(meta.is_human_message);
    }

    #[tokio::test]
    async fn world_roundtrips_through_storage() {
        let (_, storage, events) = stores();
        {
            let world = World::create(
                "Round Trip",
                "desc",
                7,
                Arc::clone(&storage),
                Arc::clone(&events),
                &NewChatConfig::default(),
            )
            .await
            .unwrap();
            world.register_agent(params("alice")).await.unwrap();
        }

        let reloaded = World::from_storage("round-trip", storage, events)
            .await
            .unwrap();
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.name, "Round Trip");
        assert_eq!(snapshot.turn_limit, 7);
        assert!(reloaded.resolve_agent("alice").await.is_some());
        assert!(reloaded.current_chat_id().await.is_some());
    }

    #[tokio::test]
    async fn manager_alias_lookup_and_conflicts() {
        let (_, storage, events) = stores();
        let manager = WorldManager::new(storage, events, NewChatConfig::default());
        manager.create_world("My World", "", 5).await.unwrap();

        assert!(manager.get_world("my-world").await.is_some());
        assert!(manager.get_world("My World").await.is_some());
        let err = manager.create_world("my world", "", 5).await.unwrap_err();
        assert!(matches!(err, WorldError::Conflict(_)));
    }

    #[tokio::test]
    async fn human_message_resets_agent_hops() {
        let (_, storage, events) = stores();
        let world = World::create("w", "", 2, storage, events, &NewChatConfig::default())
            .await
            .unwrap();
        let chat = world.current_chat_id().await;
        assert_eq!(world.note_agent_hop(chat.as_deref()).await, 1);
        assert_eq!(world.note_agent_hop(chat.as_deref()).await, 2);
        world
            .publish_message(MessageEventPayload::text("hi", "human", None))
            .await;
        assert_eq!(world.note_agent_hop(chat.as_deref()).await, 1);
    }
}
