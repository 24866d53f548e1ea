//! Per-run event stream.
//!
//! The orchestrator publishes progress events to a per-run topic backed by
//! a bounded `tokio::sync::broadcast` channel. Publishing never blocks: a
//! subscriber that falls behind loses the oldest events and keeps
//! receiving from wherever the channel currently is.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Kinds of events emitted over a run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    PhaseStarted,
    PhaseComplete,
    IterationComplete,
    RunComplete,
    RunFailed,
    RunCancelled,
    RunPaused,
    RunResumed,
}

/// A single progress event with a structured payload.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RunEvent {
    pub fn new(kind: RunEventKind, run_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Registry of per-run broadcast channels.
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a run's event stream. Events published before the
    /// subscription are not replayed.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        self.sender(run_id).subscribe()
    }

    /// Publish an event. Never blocks; if no subscriber exists the event
    /// is buffered up to the channel capacity and then dropped oldest
    /// first.
    pub fn publish(&self, event: RunEvent) {
        let sender = self.sender(&event.run_id);
        let _ = sender.send(event);
    }

    /// Drop a run's channel once the run is terminal. Existing
    /// subscribers drain buffered events and then see the stream close.
    pub fn remove(&self, run_id: &str) {
        self.channels.lock().unwrap().remove(run_id);
    }

    fn sender(&self, run_id: &str) -> broadcast::Sender<RunEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("run-1");
        bus.publish(RunEvent::new(
            RunEventKind::PhaseStarted,
            "run-1",
            serde_json::json!({ "phase": "fetching" }),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, RunEventKind::PhaseStarted);
        assert_eq!(event.payload["phase"], "fetching");
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let bus = EventBus::new(16);
        let mut rx_other = bus.subscribe("run-b");
        bus.publish(RunEvent::new(
            RunEventKind::RunComplete,
            "run-a",
            serde_json::Value::Null,
        ));
        assert!(matches!(
            rx_other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(2);
        for i in 0..10 {
            bus.publish(RunEvent::new(
                RunEventKind::IterationComplete,
                "run-1",
                serde_json::json!({ "iteration": i }),
            ));
        }
        // A late subscriber just misses the dropped history.
        let mut rx = bus.subscribe("run-1");
        bus.publish(RunEvent::new(
            RunEventKind::RunComplete,
            "run-1",
            serde_json::Value::Null,
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, RunEventKind::RunComplete);
    }
}
