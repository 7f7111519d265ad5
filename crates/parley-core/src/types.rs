use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentDefinition;

/// Lifecycle status of a chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Archived,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// One conversation thread, either a root chat or a subagent chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub agent_key: String,
    pub title: String,
    pub status: ChatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chat_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// A root chat started by a user's first message.
    pub fn new_root(user_id: Uuid, organization_id: Uuid, agent_key: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            user_id,
            agent_key: agent_key.to_string(),
            title: title.to_string(),
            status: ChatStatus::Active,
            parent_chat_id: None,
            parent_tool_call_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A child chat delegated from `parent` by the tool call `tool_call_id`.
    pub fn new_subagent(
        parent: &Chat,
        tool_call_id: &str,
        agent: &AgentDefinition,
        task: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id: parent.organization_id,
            user_id: parent.user_id,
            agent_key: agent.key.clone(),
            title: format!("{}: {}", agent.name, task),
            status: ChatStatus::Active,
            parent_chat_id: Some(parent.id),
            parent_tool_call_id: Some(tool_call_id.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_subagent(&self) -> bool {
        self.parent_chat_id.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.status == ChatStatus::Active
    }

    pub fn owned_by(&self, user_id: Uuid, organization_id: Uuid) -> bool {
        self.user_id == user_id && self.organization_id == organization_id
    }

    /// Mark an active chat completed. Returns false if it was not active.
    pub fn complete(&mut self) -> bool {
        self.transition(ChatStatus::Completed)
    }

    /// Mark an active chat failed. Returns false if it was not active.
    pub fn fail(&mut self) -> bool {
        self.transition(ChatStatus::Failed)
    }

    pub fn archive(&mut self) {
        self.status = ChatStatus::Archived;
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: ChatStatus) -> bool {
        if self.status != ChatStatus::Active {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        true
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Confirmation state of an assistant tool proposal.
///
/// Transitions exactly once, `Proposed -> Approved | Rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    #[default]
    Unset,
    Proposed,
    Rejected,
    Approved,
}

impl ToolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Proposed => "proposed",
            Self::Rejected => "rejected",
            Self::Approved => "approved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unset" => Some(Self::Unset),
            "proposed" => Some(Self::Proposed),
            "rejected" => Some(Self::Rejected),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }
}

/// One turn in a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_state: ToolState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    fn base(chat_id: Uuid, role: MessageRole, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            chat_id,
            role,
            content: content.to_string(),
            tool_name: None,
            tool_call_id: None,
            tool_arguments: None,
            token_usage: None,
            error: None,
            tool_state: ToolState::Unset,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(chat_id: Uuid, content: &str) -> Self {
        Self::base(chat_id, MessageRole::User, content)
    }

    pub fn system(chat_id: Uuid, content: &str) -> Self {
        Self::base(chat_id, MessageRole::System, content)
    }

    pub fn assistant(chat_id: Uuid, content: &str) -> Self {
        Self::base(chat_id, MessageRole::Assistant, content)
    }

    /// An assistant message recording a proposed tool invocation.
    pub fn tool_proposal(
        chat_id: Uuid,
        content: &str,
        tool_call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Self {
        let mut msg = Self::base(chat_id, MessageRole::Assistant, content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.tool_name = Some(tool_name.to_string());
        msg.tool_arguments = Some(arguments);
        msg
    }

    /// A `tool` role message carrying a tool's output or its error.
    pub fn tool_result(
        chat_id: Uuid,
        tool_call_id: &str,
        tool_name: &str,
        content: &str,
        error: Option<String>,
    ) -> Self {
        let mut msg = Self::base(chat_id, MessageRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.tool_name = Some(tool_name.to_string());
        msg.error = error;
        msg
    }

    /// An assistant message annotating a failed turn.
    pub fn failure(chat_id: Uuid, error: &str) -> Self {
        let mut msg = Self::base(chat_id, MessageRole::Assistant, FAILURE_REPLY);
        msg.error = Some(error.to_string());
        msg
    }

    pub fn is_tool_proposal(&self) -> bool {
        self.role == MessageRole::Assistant && self.tool_call_id.is_some()
    }

    pub fn is_failure_annotation(&self) -> bool {
        self.role == MessageRole::Assistant && self.tool_call_id.is_none() && self.error.is_some()
    }
}

/// Content stored on the assistant message that records a failed turn.
pub const FAILURE_REPLY: &str = "Sorry, I could not respond. Please try again later.";

/// Execution status of a first-class tool call record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "executing" => Some(Self::Executing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A tool invocation linked to the assistant message that proposed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn from_proposal(message: &ChatMessage) -> Option<Self> {
        Some(Self {
            id: message.tool_call_id.clone()?,
            chat_id: message.chat_id,
            message_id: message.id,
            name: message.tool_name.clone()?,
            arguments: message
                .tool_arguments
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            created_at: message.created_at,
            completed_at: None,
        })
    }

    pub fn mark_executing(&mut self) {
        self.status = ToolCallStatus::Executing;
    }

    pub fn complete(&mut self, result: &str) {
        self.status = ToolCallStatus::Completed;
        self.result = Some(result.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = ToolCallStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }
}

/// A chat together with its ordered message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub chat: Chat,
    pub messages: Vec<ChatMessage>,
}

/// A short remembered fact about a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl UserFact {
    pub fn new(user_id: Uuid, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A fact shared by everyone in an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationFact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl OrganizationFact {
    pub fn new(organization_id: Uuid, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Daily token budget as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub daily_limit: u64,
    pub used: u64,
    pub reserved: u64,
    pub remaining: u64,
}

impl UsageLimits {
    pub fn new(daily_limit: u64, used: u64, reserved: u64) -> Self {
        Self {
            daily_limit,
            used,
            reserved,
            remaining: daily_limit.saturating_sub(used.saturating_add(reserved)),
        }
    }
}

/// A tool as advertised to the completion provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}
