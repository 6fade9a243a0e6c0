//! Pending-operation tracking per world.
//!
//! Every in-flight LLM call registers with the world's tracker. Transports
//! use the resulting `response-start` / `response-end` / `idle` events to
//! drive busy indicators without understanding the pipeline. Activity
//! events are world-level: they carry `chatId = null` and bypass chat
//! filtering.

use crate::worldllm::event::{WorldActivityPayload, WorldEvent, WorldEventBus, WorldEventType};
use std::collections::BTreeSet;
use tokio::sync::Mutex;

#[derive(Default)]
struct ActivityInner {
    pending: u64,
    activity_seq: u64,
    active: BTreeSet<String>,
}

/// Per-world counter of concurrently processing sources.
#[derive(Default)]
pub struct ActivityTracker {
    inner: Mutex<ActivityInner>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        ActivityTracker::default()
    }

    /// Number of operations currently in flight.
    pub async fn pending(&self) -> u64 {
        self.inner.lock().await.pending
    }

    /// Register the start of an operation and emit `response-start`.
    ///
    /// `source` identifies the worker, e.g. `"agent:alice"`. Returns the
    /// monotonic activity id assigned to this operation.
    pub async fn response_start(&self, bus: &WorldEventBus, source: &str) -> u64 {
        let (activity_id, pending, active) = {
            let mut inner = self.inner.lock().await;
            inner.pending += 1;
            inner.activity_seq += 1;
            inner.active.insert(source.to_string());
            (
                inner.activity_seq,
                inner.pending,
                inner.active.iter().cloned().collect::<Vec<_>>(),
            )
        };
        bus.emit(activity_event(
            WorldEventType::ResponseStart,
            source,
            pending,
            activity_id,
            active,
        ))
        .await;
        activity_id
    }

    /// Register the end of an operation; emits `response-end`, plus `idle`
    /// when the pending count transitions to zero.
    pub async fn response_end(&self, bus: &WorldEventBus, source: &str, activity_id: u64) {
        let (pending, active) = {
            let mut inner = self.inner.lock().await;
            inner.pending = inner.pending.saturating_sub(1);
            inner.active.remove(source);
            (
                inner.pending,
                inner.active.iter().cloned().collect::<Vec<_>>(),
            )
        };
        bus.emit(activity_event(
            WorldEventType::ResponseEnd,
            source,
            pending,
            activity_id,
            active.clone(),
        ))
        .await;
        if pending == 0 {
            bus.emit(activity_event(
                WorldEventType::Idle,
                "world",
                0,
                activity_id,
                active,
            ))
            .await;
        }
    }
}

fn activity_event(
    event_type: WorldEventType,
    source: &str,
    pending: u64,
    activity_id: u64,
    active: Vec<String>,
) -> WorldEvent {
    WorldEvent::World(WorldActivityPayload {
        event_type,
        source: source.to_string(),
        agent_name: None,
        chat_id: None,
        tool_execution: None,
        pending_operations: Some(pending),
        activity_id: Some(activity_id),
        active_sources: Some(active),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldllm::event::EventSink;
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::Arc;

    struct Recorder {
        seen: Mutex<Vec<WorldEvent>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn deliver(
            &self,
            event: &WorldEvent,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.seen.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn kinds(events: &[WorldEvent]) -> Vec<WorldEventType> {
        events
            .iter()
            .filter_map(|e| match e {
                WorldEvent::World(p) => Some(p.event_type),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn idle_fires_only_when_last_operation_ends() {
        let bus = WorldEventBus::new("w1");
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.attach(recorder.clone()).await;

        let tracker = ActivityTracker::new();
        let a = tracker.response_start(&bus, "agent:alice").await;
        let b = tracker.response_start(&bus, "agent:bob").await;
        assert_eq!(tracker.pending().await, 2);

        tracker.response_end(&bus, "agent:alice", a).await;
        assert_eq!(tracker.pending().await, 1);
        tracker.response_end(&bus, "agent:bob", b).await;
        assert_eq!(tracker.pending().await, 0);

        let seen = recorder.seen.lock().await;
        assert_eq!(
            kinds(&seen),
            vec![
                WorldEventType::ResponseStart,
                WorldEventType::ResponseStart,
                WorldEventType::ResponseEnd,
                WorldEventType::ResponseEnd,
                WorldEventType::Idle,
            ]
        );
        // Activity events stay world-level even with a current chat set.
        assert!(seen.iter().all(|e| e.chat_id().is_none()));
    }

    #[tokio::test]
    async fn active_sources_reflect_in_flight_workers() {
        let bus = WorldEventBus::new("w1");
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.attach(recorder.clone()).await;

        let tracker = ActivityTracker::new();
        tracker.response_start(&bus, "agent:alice").await;
        tracker.response_start(&bus, "agent:bob").await;

        let seen = recorder.seen.lock().await;
        if let WorldEvent::World(p) = &seen[1] {
            assert_eq!(
                p.active_sources.as_ref().unwrap(),
                &vec!["agent:alice".to_string(), "agent:bob".to_string()]
            );
            assert_eq!(p.pending_operations, Some(2));
        } else {
            panic!("expected world event");
        }
    }

    #[tokio::test]
    async fn activity_ids_are_monotonic() {
        let bus = WorldEventBus::new("w1");
        let tracker = ActivityTracker::new();
        let a = tracker.response_start(&bus, "agent:alice").await;
        let b = tracker.response_start(&bus, "agent:alice").await;
        assert!(b > a);
    }
}
