//! Context enrichment: retrieved document snippets and remembered user and
//! organization facts.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use parley_store::{OrganizationFactStore, UserFactStore};
use parley_tools::org_note::MAX_FACTS_PER_ORGANIZATION;
use parley_tools::user_fact::MAX_FACTS_PER_USER;

/// Remembered facts, newest first, kept apart so the prompt can label them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Facts {
    pub user: Vec<String>,
    pub organization: Vec<String>,
}

/// Supplies extra context for a prompt.
#[async_trait]
pub trait ContextEnricher: Send + Sync {
    async fn enrich_with_rag(
        &self,
        organization_id: Uuid,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;

    async fn enrich_with_facts(&self, user_id: Uuid, organization_id: Uuid) -> anyhow::Result<Facts>;
}

/// An organization's document search index, owned by another service.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search(
        &self,
        organization_id: Uuid,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;
}

/// Facts from the fact stores; snippets from an optional search backend.
pub struct DefaultEnricher {
    facts: Arc<dyn UserFactStore>,
    org_facts: Arc<dyn OrganizationFactStore>,
    search: Option<Arc<dyn DocumentSearch>>,
}

impl DefaultEnricher {
    pub fn new(facts: Arc<dyn UserFactStore>, org_facts: Arc<dyn OrganizationFactStore>) -> Self {
        Self {
            facts,
            org_facts,
            search: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn DocumentSearch>) -> Self {
        self.search = Some(search);
        self
    }
}

#[async_trait]
impl ContextEnricher for DefaultEnricher {
    async fn enrich_with_rag(
        &self,
        organization_id: Uuid,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        match &self.search {
            Some(search) if limit > 0 && !query.trim().is_empty() => {
                search.search(organization_id, query, limit).await
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn enrich_with_facts(&self, user_id: Uuid, organization_id: Uuid) -> anyhow::Result<Facts> {
        let user = self.facts.list_facts(user_id, MAX_FACTS_PER_USER as u32).await?;
        let organization = self
            .org_facts
            .list_facts(organization_id, MAX_FACTS_PER_ORGANIZATION as u32)
            .await?;
        Ok(Facts {
            user: user.into_iter().map(|f| f.content).collect(),
            organization: organization.into_iter().map(|f| f.content).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use parley_store::{
        SqlOrganizationFactStore, SqlUserFactStore, connect_with_settings, migrations::run_pending,
    };

    use super::*;

    struct FixedSearch;

    #[async_trait]
    impl DocumentSearch for FixedSearch {
        async fn search(&self, _org: Uuid, query: &str, limit: usize) -> anyhow::Result<Vec<String>> {
            Ok((0..limit).map(|i| format!("{query} #{i}")).collect())
        }
    }

    #[tokio::test]
    async fn test_enricher_sources() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.unwrap();
        run_pending(&pool).await.unwrap();
        let facts = Arc::new(SqlUserFactStore::new(pool.clone()));
        let org_facts = Arc::new(SqlOrganizationFactStore::new(pool));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        facts.add_fact(user, "Works in finance").await.unwrap();
        org_facts.add_fact(org, "Quarter closes on the 30th").await.unwrap();
        org_facts.add_fact(Uuid::new_v4(), "Another company's rule").await.unwrap();

        let plain = DefaultEnricher::new(facts.clone(), org_facts.clone());
        assert!(plain.enrich_with_rag(org, "rates", 3).await.unwrap().is_empty());
        assert_eq!(
            plain.enrich_with_facts(user, org).await.unwrap(),
            Facts {
                user: vec!["Works in finance".to_string()],
                organization: vec!["Quarter closes on the 30th".to_string()],
            }
        );
        assert_eq!(
            plain.enrich_with_facts(Uuid::new_v4(), Uuid::new_v4()).await.unwrap(),
            Facts::default()
        );

        let searching = DefaultEnricher::new(facts, org_facts).with_search(Arc::new(FixedSearch));
        assert_eq!(searching.enrich_with_rag(Uuid::new_v4(), "rates", 2).await.unwrap().len(), 2);
        assert!(searching.enrich_with_rag(Uuid::new_v4(), " ", 2).await.unwrap().is_empty());
    }
}
