use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use parley_core::types::{
    Chat, ChatMessage, ChatStatus, MessageRole, ToolCall, ToolCallStatus, ToolState,
};

use crate::{
    DbPool, RepositoryError, format_timestamp, is_unique_violation, parse_timestamp, parse_uuid,
};

/// Persistence boundary for chats, their messages, and tool-call records.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, chat: &Chat) -> Result<(), RepositoryError>;

    /// Insert a chat and its seed messages in one transaction.
    async fn create_chat_with_messages(
        &self,
        chat: &Chat,
        messages: &[ChatMessage],
    ) -> Result<(), RepositoryError>;

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, RepositoryError>;

    async fn list_chats(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Chat>, RepositoryError>;

    async fn update_chat_status(&self, id: Uuid, status: ChatStatus)
    -> Result<(), RepositoryError>;

    async fn delete_chat(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// The active child of `parent_id`, if delegation is in progress.
    async fn active_child(&self, parent_id: Uuid) -> Result<Option<Chat>, RepositoryError>;

    async fn append_message(&self, message: &ChatMessage) -> Result<(), RepositoryError>;

    /// The most recent `limit` messages of a chat, oldest first.
    async fn list_messages(
        &self,
        chat_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;

    /// The assistant message that proposed `tool_call_id` in `chat_id`.
    async fn find_tool_proposal(
        &self,
        chat_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<ChatMessage>, RepositoryError>;

    /// Conditionally move a message's tool state; returns whether it applied.
    async fn transition_tool_state(
        &self,
        message_id: Uuid,
        from: ToolState,
        to: ToolState,
    ) -> Result<bool, RepositoryError>;

    async fn save_tool_call(&self, call: &ToolCall) -> Result<(), RepositoryError>;

    async fn get_tool_call(
        &self,
        chat_id: Uuid,
        id: &str,
    ) -> Result<Option<ToolCall>, RepositoryError>;
}

pub struct SqlChatStore {
    pool: DbPool,
}

impl SqlChatStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CHAT_COLUMNS: &str = "id, organization_id, user_id, agent_key, title, status,
     parent_chat_id, parent_tool_call_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, chat_id, role, content, tool_name, tool_call_id, tool_arguments,
     token_usage, error, tool_state, created_at, updated_at";

fn decode<T>(row: &SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn row_to_chat(row: &SqliteRow) -> Result<Chat, RepositoryError> {
    let status_str: String = decode(row, "status")?;
    let parent_chat_id: Option<String> = decode(row, "parent_chat_id")?;

    Ok(Chat {
        id: parse_uuid(&decode::<String>(row, "id")?)?,
        organization_id: parse_uuid(&decode::<String>(row, "organization_id")?)?,
        user_id: parse_uuid(&decode::<String>(row, "user_id")?)?,
        agent_key: decode(row, "agent_key")?,
        title: decode(row, "title")?,
        status: ChatStatus::parse(&status_str)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown chat status '{status_str}'")))?,
        parent_chat_id: parent_chat_id.as_deref().map(parse_uuid).transpose()?,
        parent_tool_call_id: decode(row, "parent_tool_call_id")?,
        created_at: parse_timestamp(&decode::<String>(row, "created_at")?)?,
        updated_at: parse_timestamp(&decode::<String>(row, "updated_at")?)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage, RepositoryError> {
    let role_str: String = decode(row, "role")?;
    let state_str: String = decode(row, "tool_state")?;
    let arguments: Option<String> = decode(row, "tool_arguments")?;
    let token_usage: Option<i64> = decode(row, "token_usage")?;

    Ok(ChatMessage {
        id: parse_uuid(&decode::<String>(row, "id")?)?,
        chat_id: parse_uuid(&decode::<String>(row, "chat_id")?)?,
        role: MessageRole::parse(&role_str)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown role '{role_str}'")))?,
        content: decode(row, "content")?,
        tool_name: decode(row, "tool_name")?,
        tool_call_id: decode(row, "tool_call_id")?,
        tool_arguments: arguments
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RepositoryError::Decode(format!("invalid tool arguments: {e}")))?,
        token_usage: token_usage.map(|n| n.max(0) as u64),
        error: decode(row, "error")?,
        tool_state: ToolState::parse(&state_str)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown tool state '{state_str}'")))?,
        created_at: parse_timestamp(&decode::<String>(row, "created_at")?)?,
        updated_at: parse_timestamp(&decode::<String>(row, "updated_at")?)?,
    })
}

fn row_to_tool_call(row: &SqliteRow) -> Result<ToolCall, RepositoryError> {
    let status_str: String = decode(row, "status")?;
    let arguments: String = decode(row, "arguments")?;
    let completed_at: Option<String> = decode(row, "completed_at")?;

    Ok(ToolCall {
        id: decode(row, "id")?,
        chat_id: parse_uuid(&decode::<String>(row, "chat_id")?)?,
        message_id: parse_uuid(&decode::<String>(row, "message_id")?)?,
        name: decode(row, "name")?,
        arguments: serde_json::from_str(&arguments)
            .map_err(|e| RepositoryError::Decode(format!("invalid tool arguments: {e}")))?,
        status: ToolCallStatus::parse(&status_str)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown tool status '{status_str}'")))?,
        result: decode(row, "result")?,
        error: decode(row, "error")?,
        created_at: parse_timestamp(&decode::<String>(row, "created_at")?)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

async fn insert_chat<'e, E>(executor: E, chat: &Chat) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO chats (id, organization_id, user_id, agent_key, title, status,
                            parent_chat_id, parent_tool_call_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(chat.id.to_string())
    .bind(chat.organization_id.to_string())
    .bind(chat.user_id.to_string())
    .bind(&chat.agent_key)
    .bind(&chat.title)
    .bind(chat.status.as_str())
    .bind(chat.parent_chat_id.map(|id| id.to_string()))
    .bind(&chat.parent_tool_call_id)
    .bind(format_timestamp(&chat.created_at))
    .bind(format_timestamp(&chat.updated_at))
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RepositoryError::Conflict("parent chat already has an active subagent".into())
        } else {
            RepositoryError::Database(e)
        }
    })?;
    Ok(())
}

async fn insert_message<'e, E>(executor: E, message: &ChatMessage) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let arguments = message.tool_arguments.as_ref().map(|v| v.to_string());
    sqlx::query(
        "INSERT INTO chat_messages (id, chat_id, role, content, tool_name, tool_call_id,
                                    tool_arguments, token_usage, error, tool_state,
                                    created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message.id.to_string())
    .bind(message.chat_id.to_string())
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(&message.tool_name)
    .bind(&message.tool_call_id)
    .bind(arguments)
    .bind(message.token_usage.map(|n| n as i64))
    .bind(&message.error)
    .bind(message.tool_state.as_str())
    .bind(format_timestamp(&message.created_at))
    .bind(format_timestamp(&message.updated_at))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl ChatStore for SqlChatStore {
    async fn create_chat(&self, chat: &Chat) -> Result<(), RepositoryError> {
        insert_chat(&self.pool, chat).await
    }

    async fn create_chat_with_messages(
        &self,
        chat: &Chat,
        messages: &[ChatMessage],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_chat(&mut *tx, chat).await?;
        for message in messages {
            insert_message(&mut *tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_chat).transpose()
    }

    async fn list_chats(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Chat>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE user_id = ? AND organization_id = ? AND parent_chat_id IS NULL
             ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(user_id.to_string())
        .bind(organization_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chat).collect()
    }

    async fn update_chat_status(
        &self,
        id: Uuid,
        status: ChatStatus,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE chats SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_timestamp(&chrono::Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_chat(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_child(&self, parent_id: Uuid) -> Result<Option<Chat>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE parent_chat_id = ? AND status = 'active'"
        ))
        .bind(parent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_chat).transpose()
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        insert_message(&self.pool, message).await?;
        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(format_timestamp(&message.created_at))
            .bind(message.chat_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        chat_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT seq, {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE chat_id = ? ORDER BY seq DESC LIMIT ?
             ) ORDER BY seq ASC"
        ))
        .bind(chat_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn find_tool_proposal(
        &self,
        chat_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<ChatMessage>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE chat_id = ? AND tool_call_id = ? AND role = 'assistant'
             ORDER BY seq ASC LIMIT 1"
        ))
        .bind(chat_id.to_string())
        .bind(tool_call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn transition_tool_state(
        &self,
        message_id: Uuid,
        from: ToolState,
        to: ToolState,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE chat_messages SET tool_state = ?, updated_at = ?
             WHERE id = ? AND tool_state = ?",
        )
        .bind(to.as_str())
        .bind(format_timestamp(&chrono::Utc::now()))
        .bind(message_id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_tool_call(&self, call: &ToolCall) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tool_calls (chat_id, id, message_id, name, arguments, status,
                                     result, error, created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id, id) DO UPDATE SET
                 status = excluded.status,
                 result = excluded.result,
                 error = excluded.error,
                 completed_at = excluded.completed_at",
        )
        .bind(call.chat_id.to_string())
        .bind(&call.id)
        .bind(call.message_id.to_string())
        .bind(&call.name)
        .bind(call.arguments.to_string())
        .bind(call.status.as_str())
        .bind(&call.result)
        .bind(&call.error)
        .bind(format_timestamp(&call.created_at))
        .bind(call.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tool_call(
        &self,
        chat_id: Uuid,
        id: &str,
    ) -> Result<Option<ToolCall>, RepositoryError> {
        let row = sqlx::query(
            "SELECT chat_id, id, message_id, name, arguments, status, result, error,
                    created_at, completed_at
             FROM tool_calls WHERE chat_id = ? AND id = ?",
        )
        .bind(chat_id.to_string())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_tool_call).transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{connect_with_settings, migrations::run_pending};

    async fn store() -> SqlChatStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        SqlChatStore::new(pool)
    }

    fn root_chat() -> Chat {
        Chat::new_root(Uuid::new_v4(), Uuid::new_v4(), "assistant", "Chat")
    }

    #[tokio::test]
    async fn test_chat_roundtrip() {
        let store = store().await;
        let chat = root_chat();
        store.create_chat(&chat).await.unwrap();

        let loaded = store.get_chat(chat.id).await.unwrap().expect("chat exists");
        assert_eq!(loaded.id, chat.id);
        assert_eq!(loaded.status, ChatStatus::Active);
        assert_eq!(loaded.parent_chat_id, None);
        assert!(store.get_chat(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_keep_creation_order_and_limit() {
        let store = store().await;
        let chat = root_chat();
        store.create_chat(&chat).await.unwrap();

        for i in 0..5 {
            store
                .append_message(&ChatMessage::user(chat.id, &format!("m{i}")))
                .await
                .unwrap();
        }

        let all = store.list_messages(chat.id, 100).await.unwrap();
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let recent = store.list_messages(chat.id, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_tool_state_transitions_exactly_once() {
        let store = store().await;
        let chat = root_chat();
        store.create_chat(&chat).await.unwrap();

        let mut proposal =
            ChatMessage::tool_proposal(chat.id, "", "call_1", "transfer_funds", json!({"amount": 5}));
        proposal.tool_state = ToolState::Proposed;
        store.append_message(&proposal).await.unwrap();

        let found = store.find_tool_proposal(chat.id, "call_1").await.unwrap().unwrap();
        assert_eq!(found.tool_state, ToolState::Proposed);
        assert_eq!(found.tool_arguments, Some(json!({"amount": 5})));

        assert!(store
            .transition_tool_state(found.id, ToolState::Proposed, ToolState::Rejected)
            .await
            .unwrap());
        assert!(!store
            .transition_tool_state(found.id, ToolState::Proposed, ToolState::Approved)
            .await
            .unwrap());

        let after = store.find_tool_proposal(chat.id, "call_1").await.unwrap().unwrap();
        assert_eq!(after.tool_state, ToolState::Rejected);
    }

    #[tokio::test]
    async fn test_tool_call_upsert() {
        let store = store().await;
        let chat = root_chat();
        store.create_chat(&chat).await.unwrap();
        let proposal =
            ChatMessage::tool_proposal(chat.id, "", "call_9", "save_user_fact", json!({}));
        store.append_message(&proposal).await.unwrap();

        let mut call = ToolCall::from_proposal(&proposal).unwrap();
        store.save_tool_call(&call).await.unwrap();
        call.mark_executing();
        call.complete("saved");
        store.save_tool_call(&call).await.unwrap();

        let loaded = store.get_tool_call(chat.id, "call_9").await.unwrap().unwrap();
        assert_eq!(loaded.status, ToolCallStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("saved"));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_single_active_child_enforced() {
        let store = store().await;
        let parent = root_chat();
        store.create_chat(&parent).await.unwrap();

        let mut first = root_chat();
        first.parent_chat_id = Some(parent.id);
        first.parent_tool_call_id = Some("call_1".into());
        store.create_chat(&first).await.unwrap();

        let active = store.active_child(parent.id).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);

        let mut second = root_chat();
        second.parent_chat_id = Some(parent.id);
        let err = store.create_chat(&second).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "unexpected error: {err:?}");

        store.update_chat_status(first.id, ChatStatus::Completed).await.unwrap();
        assert!(store.active_child(parent.id).await.unwrap().is_none());
        store.create_chat(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_with_messages_and_delete_cascades() {
        let store = store().await;
        let chat = root_chat();
        store
            .create_chat_with_messages(&chat, &[ChatMessage::user(chat.id, "hello")])
            .await
            .unwrap();
        assert_eq!(store.list_messages(chat.id, 10).await.unwrap().len(), 1);

        let listed = store.list_chats(chat.user_id, chat.organization_id, 10).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(store.delete_chat(chat.id).await.unwrap());
        assert!(store.list_messages(chat.id, 10).await.unwrap().is_empty());
        assert!(!store.delete_chat(chat.id).await.unwrap());
    }
}
