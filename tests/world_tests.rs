use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use worldllm::chat_completion::{
    AgentMessage, ChatCompletion, CompletionResponse, ToolDefinition,
};
use worldllm::config::NewChatConfig;
use worldllm::error::WorldError;
use worldllm::event::{EventSink, MessageEventPayload, WorldEvent};
use worldllm::hitl::HitlCoordinator;
use worldllm::pipeline::{AgentRuntime, NoTools};
use worldllm::storage::{EventStorage, MemoryStorage, StorageAPI, StoredEventType};
use worldllm::subscription::{ClientConnection, SubscribeRequest, SubscriptionRuntime, WireEvent};
use worldllm::world::{AgentParams, WorldManager};
use worldllm::TransportApi;

struct MockClient {
    responses: Mutex<VecDeque<String>>,
}

impl MockClient {
    fn scripted(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(MockClient {
            responses: Mutex::new(responses.into_iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl ChatCompletion for MockClient {
    async fn complete(
        &self,
        _messages: &[AgentMessage],
        _tools: &[ToolDefinition],
    ) -> Result<CompletionResponse, Box<dyn Error + Send + Sync>> {
        Ok(CompletionResponse {
            content: self.responses.lock().await.pop_front().unwrap_or_default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

struct SystemEventRecorder {
    kinds: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for SystemEventRecorder {
    async fn deliver(&self, event: &WorldEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let WorldEvent::System(payload) = event {
            self.kinds.lock().await.push(payload.kind.clone());
        }
        Ok(())
    }
}

struct NullConnection;

#[async_trait]
impl ClientConnection for NullConnection {
    async fn send(&self, _event: &WireEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

fn backing() -> (Arc<dyn StorageAPI>, Arc<dyn EventStorage>, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::new());
    (store.clone(), store.clone(), store)
}

fn api(llm: Arc<dyn ChatCompletion>) -> (Arc<TransportApi>, Arc<WorldManager>, Arc<SubscriptionRuntime>) {
    let (storage, events, _) = backing();
    let manager = Arc::new(WorldManager::new(storage, events, NewChatConfig::default()));
    let subscriptions = Arc::new(SubscriptionRuntime::new(Arc::clone(&manager)));
    let hitl = Arc::new(HitlCoordinator::new(60_000));
    let api = Arc::new(TransportApi::new(
        Arc::clone(&manager),
        Arc::clone(&subscriptions),
        hitl,
        llm,
        Arc::new(NoTools),
        None,
    ));
    (api, manager, subscriptions)
}

#[tokio::test]
async fn human_message_triggers_chat_title_generation() {
    let (storage, events, _) = backing();
    let manager = WorldManager::new(storage, events, NewChatConfig::default());
    let world = manager.create_world("w", "", 5).await.unwrap();

    let recorder = Arc::new(SystemEventRecorder {
        kinds: Mutex::new(Vec::new()),
    });
    world.bus().attach(recorder.clone()).await;

    let main_llm = MockClient::scripted(vec![]);
    let title_llm = MockClient::scripted(vec!["Trip Planning"]);
    let runtime = AgentRuntime::with_title_llm(
        Arc::clone(&world),
        main_llm,
        Arc::new(NoTools),
        None,
        title_llm,
    );
    AgentRuntime::attach(&runtime).await;

    world
        .publish_message(MessageEventPayload::text(
            "Help me plan a trip to Kyoto",
            "human",
            world.current_chat_id().await,
        ))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let chats = world.list_chats().await;
        if chats[0].name == "Trip Planning" {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("title was never generated; chats: {:?}", chats);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recorder
        .kinds
        .lock()
        .await
        .contains(&"chat-title-updated".to_string()));
}

#[tokio::test]
async fn agent_messages_do_not_trigger_title_generation() {
    let (storage, events, _) = backing();
    let manager = WorldManager::new(storage, events, NewChatConfig::default());
    let world = manager.create_world("w", "", 5).await.unwrap();
    world
        .register_agent(AgentParams {
            name: "alice".to_string(),
            agent_type: "assistant".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            system_prompt: String::new(),
        })
        .await
        .unwrap();

    let title_llm = MockClient::scripted(vec!["Should Not Appear"]);
    let runtime = AgentRuntime::with_title_llm(
        Arc::clone(&world),
        MockClient::scripted(vec![]),
        Arc::new(NoTools),
        None,
        title_llm,
    );
    AgentRuntime::attach(&runtime).await;

    world
        .publish_message(MessageEventPayload::text(
            "@human status update",
            "alice",
            world.current_chat_id().await,
        ))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let chats = world.list_chats().await;
    assert_eq!(chats[0].name, "New Chat");
}

#[tokio::test]
async fn send_chat_message_acks_with_pinned_chat() {
    let (api, _, _) = api(MockClient::scripted(vec![]));
    let world = api.create_world("My World", "", 5).await.unwrap();
    let chat_id = world.current_chat_id().await.unwrap();

    let ack = api
        .send_chat_message("my-world", None, "hello there", "human")
        .await
        .unwrap();
    assert_eq!(ack.world_id, "my-world");
    assert_eq!(ack.chat_id.as_deref(), Some(chat_id.as_str()));
    assert!(!ack.message_id.is_empty());
    assert!(ack.request_id.starts_with("req-"));
}

#[tokio::test]
async fn delete_world_cancels_subscriptions_and_state() {
    let (api, manager, subscriptions) = api(MockClient::scripted(vec![]));
    api.create_world("w", "", 5).await.unwrap();
    subscriptions
        .subscribe(SubscribeRequest {
            subscription_id: Some("tab-1".to_string()),
            world_id: "w".to_string(),
            chat_id: None,
            connection: Arc::new(NullConnection),
        })
        .await
        .unwrap();
    assert_eq!(subscriptions.subscription_count().await, 1);

    api.delete_world("w").await.unwrap();
    assert_eq!(subscriptions.subscription_count().await, 0);
    assert!(manager.get_world("w").await.is_none());

    let err = api
        .send_chat_message("w", None, "anyone home?", "human")
        .await
        .unwrap_err();
    assert!(matches!(err, WorldError::NotFound(_)));
}

#[tokio::test]
async fn delete_message_removes_it_from_agent_memory() {
    let (api, manager, _) = api(MockClient::scripted(vec!["Got it!"]));
    api.create_world("w", "", 5).await.unwrap();
    api.create_agent(
        "w",
        AgentParams {
            name: "alice".to_string(),
            agent_type: "assistant".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            system_prompt: String::new(),
        },
    )
    .await
    .unwrap();

    let ack = api
        .send_chat_message("w", None, "remember this", "human")
        .await
        .unwrap();
    let world = manager.get_world("w").await.unwrap();
    let chat_id = ack.chat_id.clone().unwrap();

    // Wait until alice has persisted the incoming turn.
    let handle = world.resolve_agent("alice").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !handle.lock().await.memory.is_empty() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("alice never stored the message");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    api.delete_message_from_chat("w", &chat_id, &ack.message_id)
        .await
        .unwrap();
    let memory = handle.lock().await.memory.clone();
    assert!(memory
        .iter()
        .all(|m| m.message_id.as_deref() != Some(ack.message_id.as_str())));
}

#[tokio::test]
async fn crud_events_are_persisted() {
    let (storage, events, backing) = backing();
    let manager = WorldManager::new(storage, events, NewChatConfig::default());
    let world = manager.create_world("w", "", 5).await.unwrap();
    world
        .register_agent(AgentParams {
            name: "alice".to_string(),
            agent_type: "assistant".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            system_prompt: String::new(),
        })
        .await
        .unwrap();

    let crud: Vec<_> = backing
        .get_events_by_world_and_chat("w", None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == StoredEventType::Crud)
        .collect();
    // World create, chat create, agent create.
    assert!(crud.len() >= 3);
    let operations: Vec<String> = crud
        .iter()
        .map(|e| {
            format!(
                "{}:{}",
                e.payload["operation"].as_str().unwrap_or_default(),
                e.payload["entityType"].as_str().unwrap_or_default()
            )
        })
        .collect();
    assert!(operations.contains(&"create:world".to_string()));
    assert!(operations.contains(&"create:chat".to_string()));
    assert!(operations.contains(&"create:agent".to_string()));
}
