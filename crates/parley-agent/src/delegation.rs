//! Moving execution between a parent chat and its subagent chats.

use tracing::{info, warn};

use parley_core::agent::{FINISH_SUBAGENT, SWITCH_TO_SUBAGENT};
use parley_core::error::{ParleyError, Result};
use parley_core::types::{Chat, ChatMessage, ChatStatus, ToolCall};
use parley_store::RepositoryError;
use parley_tools::delegation::{parse_finish, parse_switch};

use crate::engine::Engine;
use crate::{AgentEvent, ToolEventState, TurnContext};

/// Longest parent/child chain followed when routing a message.
pub const MAX_DELEGATION_DEPTH: usize = 8;

/// Result text a subagent records for its own `finish_subagent` call.
pub const SUMMARY_DELIVERED: &str = "Summary delivered to the parent conversation.";

/// Where a delegation tool call left the turn.
#[derive(Debug)]
pub(crate) enum Delegation {
    /// Execution continues in this chat.
    Moved(Chat),
    /// The call was refused; the reason is fed back to the model.
    Refused(String),
}

impl Engine {
    /// The chat a new message for `chat` is delivered to: its deepest
    /// active descendant, or the chat itself.
    pub async fn resolve_active_chat(&self, chat: Chat) -> Result<Chat> {
        let mut current = chat;
        for _ in 0..MAX_DELEGATION_DEPTH {
            match self.store.active_child(current.id).await? {
                Some(child) => current = child,
                None => return Ok(current),
            }
        }
        Err(ParleyError::internal(format!(
            "delegation chain below chat {} is deeper than {MAX_DELEGATION_DEPTH}",
            current.id
        )))
    }

    pub(crate) async fn switch_to_subagent(
        &self,
        ctx: &TurnContext,
        parent: &Chat,
        call: &mut ToolCall,
    ) -> Result<Delegation> {
        let args = match parse_switch(&call.arguments) {
            Ok(args) => args,
            Err(e) => return Ok(Delegation::Refused(e.to_string())),
        };
        let Some(target) = self.agents.get(args.agent_key.trim()) else {
            return Ok(Delegation::Refused(format!("unknown subagent: {}", args.agent_key)));
        };
        if !target.is_subagent {
            return Ok(Delegation::Refused(format!(
                "agent {} cannot be used as a subagent",
                target.key
            )));
        }
        if self.store.active_child(parent.id).await?.is_some() {
            return Ok(Delegation::Refused(
                "a subagent is already working on this conversation".into(),
            ));
        }

        let task = args.task.trim();
        let child = Chat::new_subagent(parent, &call.id, &target, task);
        let seed = ChatMessage::user(child.id, &format!("Task: {task}"));
        match self.store.create_chat_with_messages(&child, &[seed]).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(reason)) => return Ok(Delegation::Refused(reason)),
            Err(e) => return Err(e.into()),
        }

        call.mark_executing();
        self.store.save_tool_call(call).await?;
        ctx.emit(AgentEvent::Tool {
            chat_id: parent.id,
            state: ToolEventState::Invoking,
            tool_name: call.name.clone(),
            tool_call_id: call.id.clone(),
            arguments: call.arguments.clone(),
            error: None,
        });

        info!(
            parent_chat_id = %parent.id,
            child_chat_id = %child.id,
            agent = %target.key,
            "Delegated task to subagent"
        );
        Ok(Delegation::Moved(child))
    }

    pub(crate) async fn finish_subagent(
        &self,
        ctx: &TurnContext,
        child: &Chat,
        call: &mut ToolCall,
    ) -> Result<Delegation> {
        let (Some(parent_id), Some(parent_call_id)) =
            (child.parent_chat_id, child.parent_tool_call_id.as_deref())
        else {
            return Ok(Delegation::Refused(format!(
                "{FINISH_SUBAGENT} is only available inside a subagent conversation"
            )));
        };
        let args = match parse_finish(&call.arguments) {
            Ok(args) => args,
            Err(e) => return Ok(Delegation::Refused(e.to_string())),
        };
        let parent = self
            .store
            .get_chat(parent_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(format!("parent chat {parent_id}")))?;

        let ack = ChatMessage::tool_result(child.id, &call.id, FINISH_SUBAGENT, SUMMARY_DELIVERED, None);
        self.store.append_message(&ack).await?;
        call.complete(SUMMARY_DELIVERED);
        self.store.save_tool_call(call).await?;
        self.store.update_chat_status(child.id, ChatStatus::Completed).await?;

        let delivered =
            ChatMessage::tool_result(parent.id, parent_call_id, SWITCH_TO_SUBAGENT, &args.summary, None);
        self.store.append_message(&delivered).await?;
        let mut parent_call = self.store.get_tool_call(parent.id, parent_call_id).await?;
        if let Some(parent_call) = parent_call.as_mut() {
            parent_call.complete(&args.summary);
            self.store.save_tool_call(parent_call).await?;
        }

        ctx.emit(AgentEvent::Tool {
            chat_id: parent.id,
            state: ToolEventState::Completed,
            tool_name: SWITCH_TO_SUBAGENT.into(),
            tool_call_id: parent_call_id.to_string(),
            arguments: parent_call.map(|c| c.arguments).unwrap_or_default(),
            error: None,
        });

        info!(child_chat_id = %child.id, parent_chat_id = %parent.id, "Subagent finished");
        Ok(Delegation::Moved(parent))
    }

    /// Close a subagent chat whose turn failed and answer the parent's
    /// pending delegation call with the error, so the parent stays usable.
    pub(crate) async fn fail_subagent(&self, child: &Chat, error: &str) -> Result<()> {
        let (Some(parent_id), Some(parent_call_id)) =
            (child.parent_chat_id, child.parent_tool_call_id.as_deref())
        else {
            return Ok(());
        };
        self.store.update_chat_status(child.id, ChatStatus::Failed).await?;

        let reason = format!("subagent failed: {error}");
        let result =
            ChatMessage::tool_result(parent_id, parent_call_id, SWITCH_TO_SUBAGENT, "", Some(reason.clone()));
        self.store.append_message(&result).await?;
        match self.store.get_tool_call(parent_id, parent_call_id).await? {
            Some(mut call) => {
                call.fail(&reason);
                self.store.save_tool_call(&call).await?;
            }
            None => warn!(%parent_id, parent_call_id, "Delegation call record missing"),
        }
        warn!(child_chat_id = %child.id, %parent_id, "Subagent chat failed");
        Ok(())
    }
}
