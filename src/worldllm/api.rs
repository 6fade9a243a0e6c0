//! Transport-facing API.
//!
//! WebSocket servers, desktop IPC bridges, and TUIs talk to the runtime
//! through [`TransportApi`]. Requests and responses are plain structs;
//! every response carries a `request_id` for correlation on multiplexed
//! connections. The API owns the wiring glue: it lazily attaches one
//! [`AgentRuntime`] per world so published messages start driving agent
//! turns.

use crate::worldllm::chat_completion::ChatCompletion;
use crate::worldllm::error::WorldError;
use crate::worldllm::event::{
    MessageEventPayload, SystemEventPayload, ToolResponsePayload, WorldEvent,
};
use crate::worldllm::hitl::HitlCoordinator;
use crate::worldllm::pipeline::{AgentRuntime, ToolExecutor};
use crate::worldllm::storage::{ChatData, StoredEventType};
use crate::worldllm::subscription::{
    SubscribeRequest, SubscribeResponse, SubscriptionRuntime,
};
use crate::worldllm::world::{AgentParams, World, WorldManager};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}

/// Acknowledgment for operations with no other payload.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    fn ok() -> Self {
        Ack {
            request_id: new_request_id(),
            success: true,
            error: None,
        }
    }
}

/// Acknowledgment of an enqueued chat message.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageAck {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "worldId")]
    pub world_id: String,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
}

/// Outcome of `submit_option_response`.
#[derive(Debug, Clone, Serialize)]
pub struct OptionResponseAck {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The runtime's front door for transports.
pub struct TransportApi {
    manager: Arc<WorldManager>,
    subscriptions: Arc<SubscriptionRuntime>,
    hitl: Arc<HitlCoordinator>,
    llm: Arc<dyn ChatCompletion>,
    tools: Arc<dyn ToolExecutor>,
    working_directory: Option<String>,
    runtimes: Mutex<HashMap<String, Arc<AgentRuntime>>>,
}

impl TransportApi {
    pub fn new(
        manager: Arc<WorldManager>,
        subscriptions: Arc<SubscriptionRuntime>,
        hitl: Arc<HitlCoordinator>,
        llm: Arc<dyn ChatCompletion>,
        tools: Arc<dyn ToolExecutor>,
        working_directory: Option<String>,
    ) -> Self {
        TransportApi {
            manager,
            subscriptions,
            hitl,
            llm,
            tools,
            working_directory,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<WorldManager> {
        &self.manager
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRuntime> {
        &self.subscriptions
    }

    pub fn hitl(&self) -> &Arc<HitlCoordinator> {
        &self.hitl
    }

    /// Attach the processing pipeline (and title LLM) to a world exactly
    /// once, keeping the runtime alive in the registry.
    pub async fn ensure_runtime(&self, world: &Arc<World>) -> Arc<AgentRuntime> {
        let mut runtimes = self.runtimes.lock().await;
        if let Some(runtime) = runtimes.get(&world.id) {
            return Arc::clone(runtime);
        }
        let runtime = AgentRuntime::with_title_llm(
            Arc::clone(world),
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            self.working_directory.clone(),
            Arc::clone(&self.llm),
        );
        AgentRuntime::attach(&runtime).await;
        runtimes.insert(world.id.clone(), Arc::clone(&runtime));
        runtime
    }

    // ---- Subscriptions ----

    pub async fn subscribe_chat_events(
        &self,
        request: SubscribeRequest,
    ) -> Result<SubscribeResponse, WorldError> {
        let response = self.subscriptions.subscribe(request).await?;
        if response.subscribed {
            // Subscribing loads the world; make sure its pipeline runs too.
            if let Some(world) = self.manager.get_world(&response.world_id).await {
                self.ensure_runtime(&world).await;
            }
        }
        Ok(response)
    }

    pub async fn unsubscribe_chat_events(&self, subscription_id: &str) -> Ack {
        let _ = self.subscriptions.unsubscribe(subscription_id).await;
        Ack::ok()
    }

    // ---- Chat traffic ----

    /// Publish a message into a world; agent turns follow on the stream.
    pub async fn send_chat_message(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
        content: &str,
        sender: &str,
    ) -> Result<SendMessageAck, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        self.ensure_runtime(&world).await;

        let payload = MessageEventPayload::text(
            content,
            sender,
            chat_id.map(|s| s.to_string()),
        );
        let pinned = world.publish_message(payload).await;
        Ok(SendMessageAck {
            request_id: new_request_id(),
            message_id: pinned.message_id,
            world_id: world.id.clone(),
            chat_id: pinned.chat_id,
        })
    }

    /// Best-effort cancel of in-flight work scoped to a chat.
    pub async fn stop_chat_message(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Ack, WorldError> {
        let world = self
            .manager
            .get_world(world_id)
            .await
            .ok_or_else(|| WorldError::NotFound(format!("world '{}'", world_id)))?;
        world.request_stop(chat_id).await;
        Ok(Ack::ok())
    }

    /// Remove a message from every owning agent's memory.
    pub async fn delete_message_from_chat(
        &self,
        world_id: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Ack, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        let mut removed_any = false;
        for handle in world.agent_handles().await {
            let snapshot = {
                let mut agent = handle.lock().await;
                let before = agent.memory.len();
                agent.memory.retain(|m| {
                    !(m.message_id.as_deref() == Some(message_id)
                        && m.chat_id.as_deref() == Some(chat_id))
                });
                if agent.memory.len() == before {
                    None
                } else {
                    Some(agent.clone())
                }
            };
            if let Some(snapshot) = snapshot {
                removed_any = true;
                let _ = world.persist_agent(&snapshot).await;
            }
        }
        if !removed_any {
            return Err(WorldError::NotFound(format!(
                "message '{}' in chat '{}'",
                message_id, chat_id
            )));
        }
        world.record_crud("delete", "message", message_id, None).await;
        Ok(Ack::ok())
    }

    // ---- HITL ----

    pub async fn submit_option_response(
        &self,
        world_id: &str,
        request_id: &str,
        option_id: &str,
        chat_id: Option<&str>,
    ) -> OptionResponseAck {
        match self
            .hitl
            .submit_option_response(world_id, request_id, option_id, chat_id)
            .await
        {
            Ok(()) => OptionResponseAck {
                request_id: new_request_id(),
                accepted: true,
                reason: None,
            },
            Err(e) => OptionResponseAck {
                request_id: new_request_id(),
                accepted: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Deliver a tool approval decision onto the world's `tool` channel.
    pub async fn submit_tool_decision(
        &self,
        world_id: &str,
        payload: ToolResponsePayload,
    ) -> Result<Ack, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        self.ensure_runtime(&world).await;
        let event = world.bus().emit(WorldEvent::Tool(payload)).await;
        world.persist_event(StoredEventType::Tool, &event).await;
        Ok(Ack::ok())
    }

    // ---- CRUD ----

    pub async fn create_world(
        &self,
        name: &str,
        description: &str,
        turn_limit: u32,
    ) -> Result<Arc<World>, WorldError> {
        let world = self.manager.create_world(name, description, turn_limit).await?;
        self.ensure_runtime(&world).await;
        Ok(world)
    }

    /// Delete a world: cancel its subscriptions and pending HITL requests,
    /// emit a tombstone event, drop its runtime, and remove state.
    pub async fn delete_world(&self, world_id: &str) -> Result<Ack, WorldError> {
        if let Some(world) = self.manager.get_world(world_id).await {
            let tombstone = world
                .bus()
                .emit(WorldEvent::System(SystemEventPayload {
                    kind: "world-deleted".to_string(),
                    data: serde_json::json!({ "worldId": world.id }),
                    chat_id: None,
                }))
                .await;
            world
                .persist_event(StoredEventType::System, &tombstone)
                .await;
        }
        self.subscriptions.unsubscribe_world(world_id).await;
        self.hitl.cancel_world(world_id).await;
        self.runtimes.lock().await.remove(world_id);
        self.manager.delete_world(world_id).await?;
        Ok(Ack::ok())
    }

    pub async fn create_agent(
        &self,
        world_id: &str,
        params: AgentParams,
    ) -> Result<Ack, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        world.register_agent(params).await?;
        Ok(Ack::ok())
    }

    pub async fn create_chat(
        &self,
        world_id: &str,
        name: Option<String>,
    ) -> Result<ChatData, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        world
            .create_chat(name, self.manager.new_chat_config())
            .await
    }

    /// Delete a chat and uninstall subscriptions scoped to it.
    pub async fn delete_chat(&self, world_id: &str, chat_id: &str) -> Result<Ack, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        world.delete_chat(chat_id).await?;
        self.subscriptions.unsubscribe_chat(&world.id, chat_id).await;
        Ok(Ack::ok())
    }

    pub async fn set_current_chat(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> Result<Ack, WorldError> {
        let world = self.manager.ensure_world(world_id).await?;
        world.set_current_chat(chat_id).await?;
        Ok(Ack::ok())
    }
}
