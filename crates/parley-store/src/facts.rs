use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use parley_core::types::UserFact;

use crate::{DbPool, RepositoryError, format_timestamp, parse_timestamp, parse_uuid};

#[async_trait]
pub trait UserFactStore: Send + Sync {
    /// Store a fact; `None` when the user already has identical content saved.
    async fn add_fact(&self, user_id: Uuid, content: &str)
    -> Result<Option<UserFact>, RepositoryError>;

    /// Newest first.
    async fn list_facts(&self, user_id: Uuid, limit: u32) -> Result<Vec<UserFact>, RepositoryError>;

    async fn count_facts(&self, user_id: Uuid) -> Result<u64, RepositoryError>;

    async fn delete_fact(&self, user_id: Uuid, fact_id: Uuid) -> Result<bool, RepositoryError>;
}

pub struct SqlUserFactStore {
    pool: DbPool,
}

impl SqlUserFactStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_fact(row: &SqliteRow) -> Result<UserFact, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
    };
    Ok(UserFact {
        id: parse_uuid(&get("id")?)?,
        user_id: parse_uuid(&get("user_id")?)?,
        content: get("content")?,
        created_at: parse_timestamp(&get("created_at")?)?,
    })
}

#[async_trait]
impl UserFactStore for SqlUserFactStore {
    async fn add_fact(
        &self,
        user_id: Uuid,
        content: &str,
    ) -> Result<Option<UserFact>, RepositoryError> {
        let fact = UserFact::new(user_id, content);
        let result = sqlx::query(
            "INSERT INTO user_memory_facts (id, user_id, content, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, content) DO NOTHING",
        )
        .bind(fact.id.to_string())
        .bind(user_id.to_string())
        .bind(&fact.content)
        .bind(format_timestamp(&fact.created_at))
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(fact))
    }

    async fn list_facts(&self, user_id: Uuid, limit: u32) -> Result<Vec<UserFact>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, content, created_at FROM user_memory_facts
             WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_fact).collect()
    }

    async fn count_facts(&self, user_id: Uuid) -> Result<u64, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_memory_facts WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_fact(&self, user_id: Uuid, fact_id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM user_memory_facts WHERE id = ? AND user_id = ?")
            .bind(fact_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
