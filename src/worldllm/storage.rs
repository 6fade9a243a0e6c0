//! Storage capability consumed by the world runtime.
//!
//! The core never touches a database or the filesystem directly; it depends
//! on the [`StorageAPI`] and [`EventStorage`] traits. Concrete SQL and file
//! backends live outside this crate. The in-process [`MemoryStorage`]
//! backend ships here because the runtime needs *some* backend to exist
//! (`STORAGE_TYPE=memory`) and the test suite is built on it.
//!
//! Event storage is append-only, keyed by `(worldId, chatId)`; queries
//! return events in append order.

use crate::worldllm::chat_completion::AgentMessage;
use crate::worldllm::event_meta::EventMeta;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// Failure modes a storage backend may surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested world/agent/chat does not exist.
    NotFound(String),
    /// A uniqueness constraint was violated (duplicate id on create).
    Conflict(String),
    /// Stored bytes could not be decoded.
    Corrupted(String),
    /// Underlying I/O or driver failure; candidates for retry.
    Io(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StorageError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            StorageError::Corrupted(msg) => write!(f, "Corrupted data: {}", msg),
            StorageError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl Error for StorageError {}

/// Persistent record of a world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Cap on consecutive agent-to-agent hops within one human exchange.
    #[serde(rename = "turnLimit")]
    pub turn_limit: u32,
    #[serde(rename = "currentChatId")]
    pub current_chat_id: Option<String>,
}

/// Persistent record of an agent (memory is stored separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentData {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: String,
    #[serde(rename = "llmCallCount", default)]
    pub llm_call_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActive")]
    pub last_active: DateTime<Utc>,
}

/// Persistent record of a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatData {
    pub id: String,
    #[serde(rename = "worldId")]
    pub world_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "messageCount", default)]
    pub message_count: u64,
}

/// Patch applied by `update_chat_data`; `None` fields stay untouched.
#[derive(Debug, Clone, Default)]
pub struct ChatUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub message_count: Option<u64>,
}

/// Discriminator for persisted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredEventType {
    Message,
    Sse,
    Tool,
    System,
    Crud,
}

/// One append-only event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: StoredEventType,
    #[serde(rename = "worldId")]
    pub world_id: String,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Derived flags for message events (§ event_meta); `None` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
}

/// An agent loaded through the repairing read path.
#[derive(Debug, Clone)]
pub struct RepairedAgent {
    pub agent: AgentData,
    pub memory: Vec<AgentMessage>,
    /// How many missing pieces were synthesized during the read.
    pub repaired_count: usize,
}

/// The persistence operations the world runtime requires.
#[async_trait]
pub trait StorageAPI: Send + Sync {
    async fn save_world(&self, world: &WorldData) -> Result<(), StorageError>;
    async fn load_world(&self, world_id: &str) -> Result<WorldData, StorageError>;
    async fn delete_world(&self, world_id: &str) -> Result<(), StorageError>;
    async fn list_worlds(&self) -> Result<Vec<WorldData>, StorageError>;
    async fn world_exists(&self, world_id: &str) -> Result<bool, StorageError>;

    async fn save_agent(&self, world_id: &str, agent: &AgentData) -> Result<(), StorageError>;
    async fn load_agent(&self, world_id: &str, agent_id: &str)
        -> Result<AgentData, StorageError>;
    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<(), StorageError>;
    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentData>, StorageError>;
    async fn agent_exists(&self, world_id: &str, agent_id: &str) -> Result<bool, StorageError>;

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: &[AgentMessage],
    ) -> Result<(), StorageError>;
    async fn load_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> Result<Vec<AgentMessage>, StorageError>;
    /// Chat transcript across agents: every memory entry tagged with
    /// `chat_id`, ordered by `createdAt`, tool fields intact.
    async fn get_memory(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Vec<AgentMessage>, StorageError>;

    async fn save_chat_data(&self, chat: &ChatData) -> Result<(), StorageError>;
    async fn load_chat_data(&self, world_id: &str, chat_id: &str)
        -> Result<ChatData, StorageError>;
    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatData>, StorageError>;
    async fn update_chat_data(
        &self,
        world_id: &str,
        chat_id: &str,
        update: &ChatUpdate,
    ) -> Result<ChatData, StorageError>;
    async fn delete_chat_data(&self, world_id: &str, chat_id: &str) -> Result<(), StorageError>;
}

/// Append-only event log keyed by `(worldId, chatId)`.
#[async_trait]
pub trait EventStorage: Send + Sync {
    async fn append_event(&self, event: &StoredEvent) -> Result<(), StorageError>;
    /// Events for one `(world, chat)` pair in append order. `chat_id = None`
    /// selects the pre-chat (untagged) stream, not all chats.
    async fn get_events_by_world_and_chat(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StorageError>;
}

/// Retrying, repairing agent load on top of any [`StorageAPI`].
///
/// `Io` errors are retried with a short backoff; `NotFound` on the agent
/// itself is surfaced immediately. A missing or corrupted memory vector is
/// synthesized as empty and counted rather than failing the load.
pub async fn load_agent_with_retry(
    storage: &dyn StorageAPI,
    world_id: &str,
    agent_id: &str,
    max_attempts: u32,
) -> Result<RepairedAgent, StorageError> {
    let mut attempt = 0;
    let agent = loop {
        attempt += 1;
        match storage.load_agent(world_id, agent_id).await {
            Ok(agent) => break agent,
            Err(StorageError::Io(msg)) if attempt < max_attempts => {
                log::warn!(
                    "load_agent({}/{}) attempt {} failed: {}; retrying",
                    world_id,
                    agent_id,
                    attempt,
                    msg
                );
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    };

    let mut repaired_count = 0;
    let memory = match storage.load_agent_memory(world_id, agent_id).await {
        Ok(memory) => memory,
        Err(StorageError::NotFound(_)) | Err(StorageError::Corrupted(_)) => {
            repaired_count += 1;
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    if repaired_count > 0 {
        log::info!(
            "repaired agent {}/{} on read ({} pieces synthesized)",
            world_id,
            agent_id,
            repaired_count
        );
    }

    Ok(RepairedAgent {
        agent,
        memory,
        repaired_count,
    })
}

#[derive(Default)]
struct MemoryStorageInner {
    worlds: HashMap<String, WorldData>,
    agents: HashMap<(String, String), AgentData>,
    memories: HashMap<(String, String), Vec<AgentMessage>>,
    chats: HashMap<(String, String), ChatData>,
    events: Vec<StoredEvent>,
}

/// In-process backend: everything lives in one mutex-guarded map set.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryStorageInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

#[async_trait]
impl StorageAPI for MemoryStorage {
    async fn save_world(&self, world: &WorldData) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .worlds
            .insert(world.id.clone(), world.clone());
        Ok(())
    }

    async fn load_world(&self, world_id: &str) -> Result<WorldData, StorageError> {
        self.inner
            .lock()
            .await
            .worlds
            .get(world_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("world '{}'", world_id)))
    }

    async fn delete_world(&self, world_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.worlds.remove(world_id).is_none() {
            return Err(StorageError::NotFound(format!("world '{}'", world_id)));
        }
        inner.agents.retain(|(w, _), _| w != world_id);
        inner.memories.retain(|(w, _), _| w != world_id);
        inner.chats.retain(|(w, _), _| w != world_id);
        inner.events.retain(|e| e.world_id != world_id);
        Ok(())
    }

    async fn list_worlds(&self) -> Result<Vec<WorldData>, StorageError> {
        let mut worlds: Vec<WorldData> =
            self.inner.lock().await.worlds.values().cloned().collect();
        worlds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(worlds)
    }

    async fn world_exists(&self, world_id: &str) -> Result<bool, StorageError> {
        Ok(self.inner.lock().await.worlds.contains_key(world_id))
    }

    async fn save_agent(&self, world_id: &str, agent: &AgentData) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .agents
            .insert((world_id.to_string(), agent.id.clone()), agent.clone());
        Ok(())
    }

    async fn load_agent(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> Result<AgentData, StorageError> {
        self.inner
            .lock()
            .await
            .agents
            .get(&(world_id.to_string(), agent_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("agent '{}' in world '{}'", agent_id, world_id))
            })
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let key = (world_id.to_string(), agent_id.to_string());
        if inner.agents.remove(&key).is_none() {
            return Err(StorageError::NotFound(format!(
                "agent '{}' in world '{}'",
                agent_id, world_id
            )));
        }
        inner.memories.remove(&key);
        Ok(())
    }

    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentData>, StorageError> {
        let mut agents: Vec<AgentData> = self
            .inner
            .lock()
            .await
            .agents
            .iter()
            .filter(|((w, _), _)| w == world_id)
            .map(|(_, a)| a.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn agent_exists(&self, world_id: &str, agent_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .lock()
            .await
            .agents
            .contains_key(&(world_id.to_string(), agent_id.to_string())))
    }

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: &[AgentMessage],
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .memories
            .insert((world_id.to_string(), agent_id.to_string()), memory.to_vec());
        Ok(())
    }

    async fn load_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> Result<Vec<AgentMessage>, StorageError> {
        self.inner
            .lock()
            .await
            .memories
            .get(&(world_id.to_string(), agent_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "memory for agent '{}' in world '{}'",
                    agent_id, world_id
                ))
            })
    }

    async fn get_memory(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Vec<AgentMessage>, StorageError> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<AgentMessage> = inner
            .memories
            .iter()
            .filter(|((w, _), _)| w == world_id)
            .flat_map(|(_, msgs)| msgs.iter())
            .filter(|m| m.chat_id.as_deref() == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn save_chat_data(&self, chat: &ChatData) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .chats
            .insert((chat.world_id.clone(), chat.id.clone()), chat.clone());
        Ok(())
    }

    async fn load_chat_data(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> Result<ChatData, StorageError> {
        self.inner
            .lock()
            .await
            .chats
            .get(&(world_id.to_string(), chat_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("chat '{}' in world '{}'", chat_id, world_id))
            })
    }

    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatData>, StorageError> {
        let mut chats: Vec<ChatData> = self
            .inner
            .lock()
            .await
            .chats
            .iter()
            .filter(|((w, _), _)| w == world_id)
            .map(|(_, c)| c.clone())
            .collect();
        chats.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(chats)
    }

    async fn update_chat_data(
        &self,
        world_id: &str,
        chat_id: &str,
        update: &ChatUpdate,
    ) -> Result<ChatData, StorageError> {
        let mut inner = self.inner.lock().await;
        let chat = inner
            .chats
            .get_mut(&(world_id.to_string(), chat_id.to_string()))
            .ok_or_else(|| {
                StorageError::NotFound(format!("chat '{}' in world '{}'", chat_id, world_id))
            })?;
        if let Some(name) = &update.name {
            chat.name = name.clone();
        }
        if let Some(description) = &update.description {
            chat.description = Some(description.clone());
        }
        if let Some(count) = update.message_count {
            chat.message_count = count;
        }
        chat.updated_at = Utc::now();
        Ok(chat.clone())
    }

    async fn delete_chat_data(&self, world_id: &str, chat_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .chats
            .remove(&(world_id.to_string(), chat_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                StorageError::NotFound(format!("chat '{}' in world '{}'", chat_id, world_id))
            })
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn append_event(&self, event: &StoredEvent) -> Result<(), StorageError> {
        self.inner.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn get_events_by_world_and_chat(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.world_id == world_id && e.chat_id.as_deref() == chat_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldllm::chat_completion::{AgentMessage, Role};

    fn agent(id: &str) -> AgentData {
        AgentData {
            id: id.to_string(),
            name: id.to_string(),
            agent_type: "assistant".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            system_prompt: String::new(),
            llm_call_count: 0,
            status: None,
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    #[tokio::test]
    async fn world_crud_roundtrip() {
        let storage = MemoryStorage::new();
        let world = WorldData {
            id: "w1".to_string(),
            name: "World One".to_string(),
            description: String::new(),
            turn_limit: 5,
            current_chat_id: None,
        };
        storage.save_world(&world).await.unwrap();
        assert!(storage.world_exists("w1").await.unwrap());
        assert_eq!(storage.load_world("w1").await.unwrap().name, "World One");
        storage.delete_world("w1").await.unwrap();
        assert!(matches!(
            storage.load_world("w1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_memory_filters_by_chat_and_orders_by_created_at() {
        let storage = MemoryStorage::new();
        storage.save_agent("w1", &agent("alice")).await.unwrap();
        storage.save_agent("w1", &agent("bob")).await.unwrap();

        let mut m1 = AgentMessage::user("first", "human").with_chat_id(Some("c1".to_string()));
        m1.created_at = Utc::now() - chrono::Duration::seconds(10);
        let m2 = AgentMessage::assistant("second", "alice").with_chat_id(Some("c1".to_string()));
        let other = AgentMessage::user("elsewhere", "human").with_chat_id(Some("c2".to_string()));

        storage
            .save_agent_memory("w1", "alice", &[m2.clone(), m1.clone()])
            .await
            .unwrap();
        storage
            .save_agent_memory("w1", "bob", &[other])
            .await
            .unwrap();

        let transcript = storage.get_memory("w1", Some("c1")).await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].content, "first");
        assert_eq!(transcript[1].content, "second");
        assert_eq!(transcript[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn load_agent_with_retry_repairs_missing_memory() {
        let storage = MemoryStorage::new();
        storage.save_agent("w1", &agent("alice")).await.unwrap();

        let repaired = load_agent_with_retry(&storage, "w1", "alice", 3)
            .await
            .unwrap();
        assert_eq!(repaired.agent.id, "alice");
        assert!(repaired.memory.is_empty());
        assert_eq!(repaired.repaired_count, 1);
    }

    #[tokio::test]
    async fn load_agent_with_retry_surfaces_not_found() {
        let storage = MemoryStorage::new();
        let err = load_agent_with_retry(&storage, "w1", "ghost", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn events_append_in_order_per_chat() {
        let storage = MemoryStorage::new();
        for (i, chat) in [Some("c1"), Some("c2"), Some("c1")].iter().enumerate() {
            storage
                .append_event(&StoredEvent {
                    id: format!("e{}", i),
                    event_type: StoredEventType::Message,
                    world_id: "w1".to_string(),
                    chat_id: chat.map(|s| s.to_string()),
                    timestamp: Utc::now(),
                    payload: serde_json::json!({ "n": i }),
                    meta: None,
                })
                .await
                .unwrap();
        }
        let c1 = storage
            .get_events_by_world_and_chat("w1", Some("c1"))
            .await
            .unwrap();
        assert_eq!(c1.len(), 2);
        assert_eq!(c1[0].id, "e0");
        assert_eq!(c1[1].id, "e2");
    }

    #[tokio::test]
    async fn update_chat_data_patches_fields() {
        let storage = MemoryStorage::new();
        let chat = ChatData {
            id: "c1".to_string(),
            world_id: "w1".to_string(),
            name: "New Chat".to_string(),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message_count: 0,
        };
        storage.save_chat_data(&chat).await.unwrap();
        let updated = storage
            .update_chat_data(
                "w1",
                "c1",
                &ChatUpdate {
                    name: Some("Trip planning".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Trip planning");
        assert_eq!(updated.message_count, 0);
    }
}
