//! Translation between persisted chat messages and provider messages.

use std::collections::HashMap;

use uuid::Uuid;

use parley_core::types::{ChatMessage, MessageRole};
use parley_providers::{ProviderMessage, ToolCallRequest};

/// One persisted message in provider-neutral form.
pub fn to_provider_message(message: &ChatMessage) -> ProviderMessage {
    match message.role {
        MessageRole::Assistant if message.is_tool_proposal() => {
            let mut out = ProviderMessage::assistant(message.content.clone());
            out.tool_calls.push(ToolCallRequest {
                id: message.tool_call_id.clone().unwrap_or_default(),
                name: message.tool_name.clone().unwrap_or_default(),
                arguments: message
                    .tool_arguments
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            });
            out
        }
        MessageRole::Tool => {
            let content = match (&message.error, message.content.is_empty()) {
                (Some(error), true) => format!("error: {error}"),
                _ => message.content.clone(),
            };
            ProviderMessage::tool(
                message.tool_call_id.clone().unwrap_or_default(),
                message.tool_name.clone().unwrap_or_default(),
                content,
            )
        }
        role => ProviderMessage {
            role,
            content: message.content.clone(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        },
    }
}

/// A provider message as chat messages; each tool call becomes its own
/// proposal, and the text rides on the first one.
pub fn from_provider_message(chat_id: Uuid, message: &ProviderMessage) -> Vec<ChatMessage> {
    match message.role {
        MessageRole::Assistant if !message.tool_calls.is_empty() => message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let content = if i == 0 { message.content.as_str() } else { "" };
                ChatMessage::tool_proposal(
                    chat_id,
                    content,
                    &call.id,
                    &call.name,
                    call.arguments.clone(),
                )
            })
            .collect(),
        MessageRole::Tool => vec![ChatMessage::tool_result(
            chat_id,
            message.tool_call_id.as_deref().unwrap_or_default(),
            message.name.as_deref().unwrap_or_default(),
            &message.content,
            None,
        )],
        MessageRole::User => vec![ChatMessage::user(chat_id, &message.content)],
        MessageRole::Assistant => vec![ChatMessage::assistant(chat_id, &message.content)],
        MessageRole::System => vec![ChatMessage::system(chat_id, &message.content)],
    }
}

/// The prompt history for a window of persisted messages.
///
/// Failure annotations are dropped, and so is either half of a tool call
/// whose other half is missing from the window. Each result is replayed
/// right after its proposal, even when it was stored later (a delegation
/// result arrives after the subagent finishes).
pub fn build_history(messages: &[ChatMessage]) -> Vec<ProviderMessage> {
    let mut results: HashMap<&str, &ChatMessage> = HashMap::new();
    for message in messages.iter().filter(|m| m.role == MessageRole::Tool) {
        if let Some(id) = message.tool_call_id.as_deref() {
            results.entry(id).or_insert(message);
        }
    }

    let mut history = Vec::with_capacity(messages.len());
    for message in messages.iter().filter(|m| !m.is_failure_annotation()) {
        match (message.role, message.tool_call_id.as_deref()) {
            (MessageRole::Assistant, Some(id)) => {
                if let Some(result) = results.get(id) {
                    history.push(to_provider_message(message));
                    history.push(to_provider_message(result));
                }
            }
            (MessageRole::Tool, _) => {}
            _ => history.push(to_provider_message(message)),
        }
    }
    history
}
