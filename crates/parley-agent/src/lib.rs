//! Agent execution engine.
//!
//! The engine turns a user message into a sequence of model calls, tool
//! invocations, confirmation gates, and delegation hops. Every step is
//! persisted through the chat store, so a turn can be suspended, resumed,
//! and audited. Progress is reported as a stream of [`AgentEvent`]s.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parley_core::types::ChatSnapshot;

pub mod delegation;
pub mod engine;
pub mod enrichment;
pub mod history;
pub mod prompt;
pub mod quota;
pub mod registry;

pub use engine::{Engine, EngineDeps};
pub use enrichment::{ContextEnricher, DefaultEnricher, DocumentSearch, Facts};
pub use quota::QuotaService;
pub use registry::AgentRegistry;

/// Coarse progress of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    AssistantThinking,
    AwaitingConfirmation,
    AssistantCompleted,
    GenerationStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventState {
    Invoking,
    Completed,
    Error,
}

/// Events emitted by the engine during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        chat_id: Uuid,
        status: TurnStatus,
    },

    /// Incremental assistant text.
    ContentDelta {
        chat_id: Uuid,
        delta: String,
    },

    Tool {
        chat_id: Uuid,
        state: ToolEventState,
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Token usage of one model call.
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },

    /// The chat and its history once the turn concludes or suspends.
    Final {
        snapshot: ChatSnapshot,
    },

    /// Terminal failure; `code` is the error taxonomy code.
    Error {
        code: String,
        message: String,
    },
}

/// How a turn ended when it did not fail.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(ChatSnapshot),
    /// A tool proposal waits for a human decision.
    AwaitingConfirmation(ChatSnapshot),
}

impl TurnOutcome {
    pub fn snapshot(&self) -> &ChatSnapshot {
        match self {
            Self::Completed(s) | Self::AwaitingConfirmation(s) => s,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::AwaitingConfirmation(_) => "awaiting_confirmation",
        }
    }
}

/// The caller of one turn: an authenticated identity, an event sink, and a
/// stop signal checked between streamed chunks.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub events: mpsc::UnboundedSender<AgentEvent>,
    pub stop: CancellationToken,
}

impl TurnContext {
    pub fn new(
        user_id: Uuid,
        organization_id: Uuid,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            user_id,
            organization_id,
            events,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// A closed receiver only means nobody is listening any more.
    pub(crate) fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = AgentEvent::Status {
            chat_id: Uuid::nil(),
            status: TurnStatus::AwaitingConfirmation,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "awaiting_confirmation");

        let event = AgentEvent::ContentDelta { chat_id: Uuid::nil(), delta: "hi".into() };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "content_delta");
    }
}
