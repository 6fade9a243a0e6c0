use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;
use worldllm::chat_completion::{
    AgentMessage, ChatCompletion, CompletionResponse, ToolDefinition,
};
use worldllm::config::NewChatConfig;
use worldllm::event::{EventSink, SystemEventPayload, WorldEvent};
use worldllm::hitl::{HitlCoordinator, HitlOption, HitlRequestSpec, HitlSource};
use worldllm::pipeline::NoTools;
use worldllm::storage::{EventStorage, MemoryStorage, StorageAPI};
use worldllm::subscription::SubscriptionRuntime;
use worldllm::world::WorldManager;
use worldllm::TransportApi;

struct SilentClient;

#[async_trait]
impl ChatCompletion for SilentClient {
    async fn complete(
        &self,
        _messages: &[AgentMessage],
        _tools: &[ToolDefinition],
    ) -> Result<CompletionResponse, Box<dyn Error + Send + Sync>> {
        Ok(CompletionResponse::default())
    }

    fn model_name(&self) -> &str {
        "silent"
    }
}

struct SystemRecorder {
    payloads: Mutex<Vec<SystemEventPayload>>,
}

#[async_trait]
impl EventSink for SystemRecorder {
    async fn deliver(&self, event: &WorldEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let WorldEvent::System(payload) = event {
            self.payloads.lock().await.push(payload.clone());
        }
        Ok(())
    }
}

async fn setup() -> (Arc<TransportApi>, Arc<WorldManager>, Arc<HitlCoordinator>) {
    let store = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn StorageAPI> = store.clone();
    let events: Arc<dyn EventStorage> = store;
    let manager = Arc::new(WorldManager::new(storage, events, NewChatConfig::default()));
    let subscriptions = Arc::new(SubscriptionRuntime::new(Arc::clone(&manager)));
    let hitl = Arc::new(HitlCoordinator::new(60_000));
    let api = Arc::new(TransportApi::new(
        Arc::clone(&manager),
        subscriptions,
        Arc::clone(&hitl),
        Arc::new(SilentClient),
        Arc::new(NoTools),
        None,
    ));
    (api, manager, hitl)
}

fn spec(world: &str, chat: Option<String>) -> HitlRequestSpec {
    HitlRequestSpec {
        world_id: world.to_string(),
        chat_id: chat,
        title: "Deploy?".to_string(),
        message: "Ship the release now?".to_string(),
        options: vec![
            HitlOption {
                id: "ship".to_string(),
                label: "Ship it".to_string(),
            },
            HitlOption {
                id: "wait".to_string(),
                label: "Hold off".to_string(),
            },
        ],
        default_option_id: Some("wait".to_string()),
        timeout_ms: Some(60_000),
    }
}

#[tokio::test]
async fn option_request_emits_system_event_and_resolves_via_api() {
    let (api, manager, hitl) = setup().await;
    let world = api.create_world("w", "", 5).await.unwrap();
    let chat_id = world.current_chat_id().await;

    let recorder = Arc::new(SystemRecorder {
        payloads: Mutex::new(Vec::new()),
    });
    world.bus().attach(recorder.clone()).await;

    let ticket = hitl
        .request_option(world.bus(), spec("w", chat_id.clone()))
        .await;

    {
        let payloads = recorder.payloads.lock().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].kind, "hitl-option-request");
        assert_eq!(payloads[0].data["requestId"], ticket.request_id.as_str());
        assert_eq!(payloads[0].data["options"][0]["id"], "ship");
        assert_eq!(payloads[0].chat_id, chat_id);
    }

    let ack = api
        .submit_option_response("w", &ticket.request_id, "ship", chat_id.as_deref())
        .await;
    assert!(ack.accepted);

    let resolution = ticket.resolved().await;
    assert_eq!(resolution.option_id.as_deref(), Some("ship"));
    assert_eq!(resolution.source, HitlSource::User);
    let _ = manager;
}

#[tokio::test]
async fn option_response_for_wrong_chat_is_rejected() {
    let (api, _, hitl) = setup().await;
    let world = api.create_world("w", "", 5).await.unwrap();
    let chat_id = world.current_chat_id().await;

    let ticket = hitl
        .request_option(world.bus(), spec("w", chat_id))
        .await;

    let ack = api
        .submit_option_response("w", &ticket.request_id, "ship", Some("some-other-chat"))
        .await;
    assert!(!ack.accepted);
    assert!(ack.reason.unwrap().contains("belongs to chat"));
    // The request is still pending for the right chat.
    assert_eq!(hitl.pending_count().await, 1);
}

#[tokio::test]
async fn option_response_for_unknown_request_is_rejected() {
    let (api, _, _) = setup().await;
    api.create_world("w", "", 5).await.unwrap();

    let ack = api
        .submit_option_response("w", "req-does-not-exist", "ship", None)
        .await;
    assert!(!ack.accepted);
    assert!(ack.reason.unwrap().contains("Not found"));
}

#[tokio::test]
async fn deleting_a_world_cancels_its_pending_requests() {
    let (api, _, hitl) = setup().await;
    let world = api.create_world("w", "", 5).await.unwrap();

    let ticket = hitl.request_option(world.bus(), spec("w", None)).await;
    api.delete_world("w").await.unwrap();

    let resolution = ticket.resolved().await;
    assert_eq!(resolution.source, HitlSource::Cancel);
    assert_eq!(resolution.option_id, None);
}
