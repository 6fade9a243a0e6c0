//! Realtime subscription runtime.
//!
//! A subscription ties a client-chosen id to a `(world, optional chat)`
//! pair and forwards matching events to the client's connection. The
//! hazards this module exists to contain:
//!
//! - **Stale installs**: `subscribe` suspends (world loading, sink
//!   attachment). A version counter is bumped on every attempt for an id;
//!   after every await the installer re-checks that it still holds the
//!   current version, and backs out quietly when it does not.
//! - **Id reuse**: an unsubscribed id is tombstoned for the lifetime of the
//!   runtime. Re-subscribing with it fails loudly, and the tombstone set
//!   survives [`SubscriptionRuntime::reset_runtime_subscriptions`].
//! - **Duplicate finalizations**: a `message` event whose `messageId`
//!   equals the immediately preceding delivered one on the same
//!   subscription is dropped.

use crate::worldllm::error::WorldError;
use crate::worldllm::event::{event_matches_chat, EventSink, SinkId, WorldEvent};
use crate::worldllm::world::{World, WorldManager};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default subscription id when the client supplies none.
pub const DEFAULT_SUBSCRIPTION_ID: &str = "default";

/// The envelope delivered to a client connection for every event.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
}

impl WireEvent {
    pub fn from_world_event(event: &WorldEvent, subscription_id: &str) -> Self {
        let serialized = serde_json::to_value(event).unwrap_or_default();
        WireEvent {
            event_type: event.channel().to_string(),
            payload: serialized
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            subscription_id: subscription_id.to_string(),
        }
    }
}

/// Transport half of a subscription: wherever the events go (a WebSocket,
/// an IPC pipe, a test buffer).
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn send(&self, event: &WireEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Parameters of a subscribe call.
#[derive(Clone)]
pub struct SubscribeRequest {
    pub subscription_id: Option<String>,
    pub world_id: String,
    pub chat_id: Option<String>,
    pub connection: Arc<dyn ClientConnection>,
}

/// Outcome of a subscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResponse {
    pub subscribed: bool,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "worldId")]
    pub world_id: String,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub canceled: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

struct ChatSubscription {
    version: u64,
    world_id: String,
    chat_id: Option<String>,
    sink_id: SinkId,
    connection: Arc<dyn ClientConnection>,
}

struct ForwardingSink {
    subscription_id: String,
    chat_id: Option<String>,
    connection: Arc<dyn ClientConnection>,
    last_message_id: Mutex<Option<String>>,
}

#[async_trait]
impl EventSink for ForwardingSink {
    async fn deliver(&self, event: &WorldEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        if !event_matches_chat(event, self.chat_id.as_deref()) {
            return Ok(());
        }
        if let WorldEvent::Message(payload) = event {
            let mut last = self.last_message_id.lock().await;
            if last.as_deref() == Some(payload.message_id.as_str()) {
                return Ok(());
            }
            *last = Some(payload.message_id.clone());
        }
        self.connection
            .send(&WireEvent::from_world_event(event, &self.subscription_id))
            .await
    }
}

/// Versioned, tombstoned per-chat subscriptions for one process.
pub struct SubscriptionRuntime {
    manager: Arc<WorldManager>,
    subscriptions: Mutex<HashMap<String, ChatSubscription>>,
    versions: Mutex<HashMap<String, u64>>,
    world_handles: Mutex<HashMap<String, Arc<World>>>,
    canceled: Mutex<HashSet<String>>,
}

impl SubscriptionRuntime {
    pub fn new(manager: Arc<WorldManager>) -> Self {
        SubscriptionRuntime {
            manager,
            subscriptions: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            world_handles: Mutex::new(HashMap::new()),
            canceled: Mutex::new(HashSet::new()),
        }
    }

    async fn bump_version(&self, subscription_id: &str) -> u64 {
        let mut versions = self.versions.lock().await;
        let v = versions.get(subscription_id).copied().unwrap_or(0) + 1;
        versions.insert(subscription_id.to_string(), v);
        v
    }

    async fn is_current(&self, subscription_id: &str, version: u64) -> bool {
        if self.canceled.lock().await.contains(subscription_id) {
            return false;
        }
        self.versions.lock().await.get(subscription_id).copied() == Some(version)
    }

    fn stale_response(
        subscription_id: &str,
        world_id: &str,
        chat_id: Option<&str>,
    ) -> SubscribeResponse {
        SubscribeResponse {
            subscribed: false,
            subscription_id: subscription_id.to_string(),
            world_id: world_id.to_string(),
            chat_id: chat_id.map(|s| s.to_string()),
            canceled: true,
            stale: true,
        }
    }

    /// Install a chat-events subscription.
    ///
    /// Idempotent for an identical `(subscriptionId, worldId, chatId)`
    /// triple. Fails loudly on a tombstoned id. Returns a stale response
    /// (without raising) when a newer attempt or an unsubscribe won the
    /// race during one of this call's suspensions.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeResponse, WorldError> {
        let subscription_id = request
            .subscription_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SUBSCRIPTION_ID.to_string());

        if self.canceled.lock().await.contains(&subscription_id) {
            return Err(WorldError::Conflict(format!(
                "Subscription ID '{}' cannot be reused after unsubscribe.",
                subscription_id
            )));
        }

        let version = self.bump_version(&subscription_id).await;

        // Same-target subscribe with no intervening unsubscribe: no-op. The
        // stored entry adopts the bumped version so a later reset still
        // recognizes it as current.
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(existing) = subscriptions.get_mut(&subscription_id) {
                if existing.world_id == request.world_id && existing.chat_id == request.chat_id {
                    existing.version = version;
                    return Ok(SubscribeResponse {
                        subscribed: true,
                        subscription_id,
                        world_id: request.world_id,
                        chat_id: request.chat_id,
                        canceled: false,
                        stale: false,
                    });
                }
            }
        }

        let world = self.manager.ensure_world(&request.world_id).await?;

        if !self.is_current(&subscription_id, version).await {
            return Ok(Self::stale_response(
                &subscription_id,
                &request.world_id,
                request.chat_id.as_deref(),
            ));
        }

        // Replace an existing subscription under the same id (different
        // target): uninstall its sink first.
        if let Some(previous) = self.subscriptions.lock().await.remove(&subscription_id) {
            if let Some(old_world) = self.world_handles.lock().await.get(&previous.world_id) {
                old_world.bus().detach(previous.sink_id).await;
            }
        }

        let sink = Arc::new(ForwardingSink {
            subscription_id: subscription_id.clone(),
            chat_id: request.chat_id.clone(),
            connection: Arc::clone(&request.connection),
            last_message_id: Mutex::new(None),
        });
        let sink_id = world.bus().attach(sink).await;

        if !self.is_current(&subscription_id, version).await {
            // A cancellation landed while attaching: back out immediately.
            world.bus().detach(sink_id).await;
            return Ok(Self::stale_response(
                &subscription_id,
                &request.world_id,
                request.chat_id.as_deref(),
            ));
        }

        self.world_handles
            .lock()
            .await
            .insert(world.id.clone(), Arc::clone(&world));
        self.subscriptions.lock().await.insert(
            subscription_id.clone(),
            ChatSubscription {
                version,
                world_id: world.id.clone(),
                chat_id: request.chat_id.clone(),
                sink_id,
                connection: request.connection,
            },
        );

        log::debug!(
            "subscribed '{}' to world '{}' chat {:?} (v{})",
            subscription_id,
            world.id,
            request.chat_id,
            version
        );
        Ok(SubscribeResponse {
            subscribed: true,
            subscription_id,
            world_id: world.id.clone(),
            chat_id: request.chat_id,
            canceled: false,
            stale: false,
        })
    }

    /// Remove a subscription and tombstone its id for this runtime's
    /// lifetime. Unknown ids still tombstone (the client meant to kill it).
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), WorldError> {
        self.bump_version(subscription_id).await;
        self.canceled
            .lock()
            .await
            .insert(subscription_id.to_string());

        if let Some(entry) = self.subscriptions.lock().await.remove(subscription_id) {
            if let Some(world) = self.world_handles.lock().await.get(&entry.world_id) {
                world.bus().detach(entry.sink_id).await;
            }
        }
        log::debug!("unsubscribed '{}'", subscription_id);
        Ok(())
    }

    /// Tear down and re-establish every subscription scoped to a world
    /// after reloading its state from storage.
    ///
    /// Pairs tombstoned mid-refresh are skipped. Returns a human-readable
    /// warning when any step failed, `None` on a clean refresh.
    pub async fn refresh_world_subscription(&self, world_id: &str) -> Option<String> {
        let world = match self.world_handles.lock().await.get(world_id) {
            Some(world) => Arc::clone(world),
            None => return Some(format!("no live subscriptions for world '{}'", world_id)),
        };

        // Snapshot and uninstall the world's subscriptions.
        let preserved: Vec<(String, Option<String>, Arc<dyn ClientConnection>)> = {
            let mut subscriptions = self.subscriptions.lock().await;
            let ids: Vec<String> = subscriptions
                .iter()
                .filter(|(_, s)| s.world_id == world_id)
                .map(|(id, _)| id.clone())
                .collect();
            let mut preserved = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = subscriptions.remove(&id) {
                    world.bus().detach(entry.sink_id).await;
                    preserved.push((id, entry.chat_id, entry.connection));
                }
            }
            preserved
        };

        let mut warnings = Vec::new();
        if let Err(e) = world.refresh().await {
            warnings.push(format!("world reload failed: {}", e));
        }

        for (subscription_id, chat_id, connection) in preserved {
            if self.canceled.lock().await.contains(&subscription_id) {
                continue;
            }
            let result = self
                .subscribe(SubscribeRequest {
                    subscription_id: Some(subscription_id.clone()),
                    world_id: world_id.to_string(),
                    chat_id,
                    connection,
                })
                .await;
            match result {
                Ok(response) if response.subscribed => {}
                Ok(_) => warnings.push(format!(
                    "subscription '{}' became stale during refresh",
                    subscription_id
                )),
                Err(e) => warnings.push(format!(
                    "subscription '{}' failed to re-subscribe: {}",
                    subscription_id, e
                )),
            }
        }

        if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        }
    }

    /// Uninstall every current subscription and world handle, preserving
    /// tombstones so unsubscribed ids stay non-reusable.
    pub async fn reset_runtime_subscriptions(&self) {
        let entries: Vec<(String, ChatSubscription)> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().collect()
        };
        let versions_snapshot = self.versions.lock().await.clone();
        for (id, entry) in entries {
            // Only the current version's installer may uninstall.
            if versions_snapshot.get(&id).copied() != Some(entry.version) {
                continue;
            }
            if let Some(world) = self.world_handles.lock().await.get(&entry.world_id) {
                world.bus().detach(entry.sink_id).await;
            }
        }
        self.world_handles.lock().await.clear();
        self.versions.lock().await.clear();
        // canceled set intentionally survives the reset.
    }

    /// Uninstall every subscription scoped to a chat (chat deletion).
    pub async fn unsubscribe_chat(&self, world_id: &str, chat_id: &str) {
        let ids: Vec<String> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .filter(|(_, s)| {
                    s.world_id == world_id && s.chat_id.as_deref() == Some(chat_id)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.unsubscribe(&id).await;
        }
    }

    /// Uninstall every subscription scoped to a world (world deletion).
    pub async fn unsubscribe_world(&self, world_id: &str) {
        let ids: Vec<String> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .filter(|(_, s)| s.world_id == world_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.unsubscribe(&id).await;
        }
        self.world_handles.lock().await.remove(world_id);
    }

    /// Current subscription count (introspection and tests).
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}
