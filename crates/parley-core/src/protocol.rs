//! Parley gateway wire protocol.
//!
//! All gateway communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version implemented by this gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// Methods served over the WebSocket.
pub const METHODS: &[&str] = &[
    "connect",
    "chat.send",
    "chat.decide",
    "chat.stop",
    "chat.get",
    "chat.list",
    "chat.delete",
    "usage.get",
    "facts.list",
    "facts.delete",
    "org_facts.list",
    "org_facts.delete",
];

/// Events pushed by the server.
pub const EVENTS: &[&str] = &["hello", "chat.event", "config.changed"];

/// A gateway wire frame: the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl GatewayFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self::Response {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: &str, code: &str, message: &str) -> Self {
        Self::Response {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            }),
        }
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Identity handshake, sent as the params of the first `connect` request.
///
/// The caller is already authenticated upstream; `token` guards the
/// gateway itself when token auth is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Server hello sent when a socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub auth_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageParams {
    #[serde(default)]
    pub chat_id: Option<Uuid>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecisionParams {
    pub chat_id: Uuid,
    pub tool_call_id: String,
    pub approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIdParams {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListChatsParams {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactIdParams {
    pub fact_id: Uuid,
}
