use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{DbPool, RepositoryError, format_timestamp};

/// Per-user, per-UTC-day token accounting with a reserve/confirm protocol.
///
/// Invariant: `used + reserved <= limit` is checked and applied in a single
/// statement, so concurrent reservations can never jointly overshoot.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Atomically reserve `tokens` if the day's total stays within `limit`.
    async fn reserve(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        tokens: u64,
        limit: u64,
    ) -> Result<bool, RepositoryError>;

    /// Move a reservation into usage: `used += actual`, `reserved -= reserved` (floored at zero).
    async fn confirm(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        reserved: u64,
        actual: u64,
    ) -> Result<(), RepositoryError>;

    /// `(used, reserved)` for the day; zeros when nothing was recorded.
    async fn daily_usage(&self, user_id: Uuid, day: NaiveDate)
    -> Result<(u64, u64), RepositoryError>;
}

pub struct SqlTokenLedger {
    pool: DbPool,
}

impl SqlTokenLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl TokenLedger for SqlTokenLedger {
    async fn reserve(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        tokens: u64,
        limit: u64,
    ) -> Result<bool, RepositoryError> {
        // The SELECT's WHERE rejects a first reservation that alone exceeds the
        // limit; the upsert's WHERE rejects one that would overshoot an existing row.
        let result = sqlx::query(
            "INSERT INTO llm_token_usage (user_id, day, used_tokens, reserved_tokens, updated_at)
             SELECT ?1, ?2, 0, ?3, ?5 WHERE ?3 <= ?4
             ON CONFLICT(user_id, day) DO UPDATE SET
                 reserved_tokens = llm_token_usage.reserved_tokens + excluded.reserved_tokens,
                 updated_at = excluded.updated_at
             WHERE llm_token_usage.used_tokens + llm_token_usage.reserved_tokens
                   + excluded.reserved_tokens <= ?4",
        )
        .bind(user_id.to_string())
        .bind(day_key(day))
        .bind(to_i64(tokens))
        .bind(to_i64(limit))
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        let allowed = result.rows_affected() > 0;
        if !allowed {
            debug!(%user_id, %day, tokens, limit, "Token reservation denied");
        }
        Ok(allowed)
    }

    async fn confirm(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        reserved: u64,
        actual: u64,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO llm_token_usage (user_id, day, used_tokens, reserved_tokens, updated_at)
             VALUES (?1, ?2, ?3, 0, ?5)
             ON CONFLICT(user_id, day) DO UPDATE SET
                 used_tokens = llm_token_usage.used_tokens + excluded.used_tokens,
                 reserved_tokens = MAX(llm_token_usage.reserved_tokens - ?4, 0),
                 updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(day_key(day))
        .bind(to_i64(actual))
        .bind(to_i64(reserved))
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_usage(
        &self,
        user_id: Uuid,
        day: NaiveDate,
    ) -> Result<(u64, u64), RepositoryError> {
        let row = sqlx::query(
            "SELECT used_tokens, reserved_tokens FROM llm_token_usage
             WHERE user_id = ? AND day = ?",
        )
        .bind(user_id.to_string())
        .bind(day_key(day))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok((0, 0));
        };
        let used: i64 = row
            .try_get("used_tokens")
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let reserved: i64 = row
            .try_get("reserved_tokens")
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        Ok((used.max(0) as u64, reserved.max(0) as u64))
    }
}
