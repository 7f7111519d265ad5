use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use parley_core::types::OrganizationFact;

use crate::{DbPool, RepositoryError, format_timestamp, parse_timestamp, parse_uuid};

/// Facts every member of an organization shares.
#[async_trait]
pub trait OrganizationFactStore: Send + Sync {
    /// `None` when the organization already has identical content saved.
    async fn add_fact(
        &self,
        organization_id: Uuid,
        content: &str,
    ) -> Result<Option<OrganizationFact>, RepositoryError>;

    /// Newest first.
    async fn list_facts(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<OrganizationFact>, RepositoryError>;

    async fn count_facts(&self, organization_id: Uuid) -> Result<u64, RepositoryError>;

    async fn delete_fact(&self, organization_id: Uuid, fact_id: Uuid) -> Result<bool, RepositoryError>;
}

pub struct SqlOrganizationFactStore {
    pool: DbPool,
}

impl SqlOrganizationFactStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_fact(row: &SqliteRow) -> Result<OrganizationFact, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
    };
    Ok(OrganizationFact {
        id: parse_uuid(&get("id")?)?,
        organization_id: parse_uuid(&get("organization_id")?)?,
        content: get("content")?,
        created_at: parse_timestamp(&get("created_at")?)?,
    })
}

#[async_trait]
impl OrganizationFactStore for SqlOrganizationFactStore {
    async fn add_fact(
        &self,
        organization_id: Uuid,
        content: &str,
    ) -> Result<Option<OrganizationFact>, RepositoryError> {
        let fact = OrganizationFact::new(organization_id, content);
        let result = sqlx::query(
            "INSERT INTO organization_memory_facts (id, organization_id, content, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(organization_id, content) DO NOTHING",
        )
        .bind(fact.id.to_string())
        .bind(organization_id.to_string())
        .bind(&fact.content)
        .bind(format_timestamp(&fact.created_at))
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(fact))
    }

    async fn list_facts(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<OrganizationFact>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, organization_id, content, created_at FROM organization_memory_facts
             WHERE organization_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(organization_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_fact).collect()
    }

    async fn count_facts(&self, organization_id: Uuid) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM organization_memory_facts WHERE organization_id = ?",
        )
        .bind(organization_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_fact(&self, organization_id: Uuid, fact_id: Uuid) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM organization_memory_facts WHERE id = ? AND organization_id = ?")
                .bind(fact_id.to_string())
                .bind(organization_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SqlUserFactStore, UserFactStore, connect_with_settings, migrations::run_pending};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn test_org_fact_dedupe_and_count() {
        let store = SqlOrganizationFactStore::new(pool().await);
        let org = Uuid::new_v4();

        assert!(store.add_fact(org, "Invoices go out on Fridays").await.unwrap().is_some());
        assert!(store.add_fact(org, "Invoices go out on Fridays").await.unwrap().is_none());
        store.add_fact(org, "Fiscal year starts in April").await.unwrap();
        assert_eq!(store.count_facts(org).await.unwrap(), 2);
        assert_eq!(store.list_facts(org, 1).await.unwrap().len(), 1);

        assert!(store.add_fact(Uuid::new_v4(), "Invoices go out on Fridays").await.unwrap().is_some());
        assert_eq!(store.count_facts(org).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_org_facts_are_separate_from_user_facts() {
        let pool = pool().await;
        let orgs = SqlOrganizationFactStore::new(pool.clone());
        let users = SqlUserFactStore::new(pool);
        let id = Uuid::new_v4();

        let fact = orgs.add_fact(id, "Uses metric units").await.unwrap().unwrap();
        assert!(users.list_facts(id, 10).await.unwrap().is_empty());

        assert!(!orgs.delete_fact(Uuid::new_v4(), fact.id).await.unwrap());
        assert!(orgs.delete_fact(id, fact.id).await.unwrap());
        assert_eq!(orgs.count_facts(id).await.unwrap(), 0);
    }
}
