//! Durable storage for chats, messages, tool calls, token usage, and memory facts.
//!
//! Every write is a single atomic statement or a short explicit
//! transaction; multi-step engine sequences commit step by step.

pub mod chats;
pub mod connection;
pub mod facts;
pub mod ledger;
pub mod migrations;
pub mod org_facts;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use parley_core::error::ParleyError;

pub use chats::{ChatStore, SqlChatStore};
pub use connection::{DbPool, connect, connect_with_settings};
pub use facts::{SqlUserFactStore, UserFactStore};
pub use ledger::{SqlTokenLedger, TokenLedger};
pub use org_facts::{OrganizationFactStore, SqlOrganizationFactStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for ParleyError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => ParleyError::InvalidArgument(msg),
            other => ParleyError::Store(other.to_string()),
        }
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp '{raw}': {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(raw).map_err(|e| RepositoryError::Decode(format!("invalid id '{raw}': {e}")))
}

/// Unique-constraint violations surface as conflicts rather than failures.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
