//! Outbound event frames.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use parley_agent::AgentEvent;
use parley_core::protocol::GatewayFrame;

use crate::state::GatewayState;

/// Event name carrying engine progress for the connection's running turn.
pub const CHAT_EVENT: &str = "chat.event";

/// Event name announcing a configuration reload.
pub const CONFIG_CHANGED: &str = "config.changed";

/// Per-connection frame counter. `hello` is frame 0.
#[derive(Debug, Default)]
pub struct EventSequence(AtomicU64);

impl EventSequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn to_text(frame: &GatewayFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            error!(%e, "Failed to serialize frame");
            None
        }
    }
}

/// A `chat.event` frame for one engine event.
pub fn chat_event_frame(event: &AgentEvent, seq: u64) -> GatewayFrame {
    GatewayFrame::Event {
        event: CHAT_EVENT.into(),
        payload: serde_json::to_value(event).ok(),
        seq: Some(seq),
    }
}

/// Broadcast an event to every identified connection.
pub async fn broadcast_event(state: &GatewayState, event: &str, payload: Option<serde_json::Value>) {
    let frame = GatewayFrame::Event {
        event: event.to_string(),
        payload,
        seq: None,
    };
    let Some(text) = to_text(&frame) else { return };

    let connections = state.connections.read().await;
    let mut sent = 0;
    for conn in connections.values().filter(|c| c.identity.is_some()) {
        if conn.outbound.send(text.clone()).is_ok() {
            sent += 1;
        }
    }
    debug!(event, sent, "Broadcast event");
}
