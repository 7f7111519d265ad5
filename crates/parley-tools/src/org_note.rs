//! Organization memory: facts shared across every member's prompts.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use parley_store::OrganizationFactStore;

use crate::{Tool, ToolContext, ToolOutput};

/// Longest organization note kept, in characters.
pub const MAX_NOTE_CHARS: usize = 100;

pub const MAX_FACTS_PER_ORGANIZATION: u64 = 50;

pub struct SaveOrganizationNoteTool {
    store: Arc<dyn OrganizationFactStore>,
}

impl SaveOrganizationNoteTool {
    pub fn new(store: Arc<dyn OrganizationFactStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
struct NoteParams {
    content: String,
}

pub fn normalize_note(raw: &str) -> String {
    raw.trim().chars().take(MAX_NOTE_CHARS).collect::<String>().trim_end().to_string()
}

#[async_trait]
impl Tool for SaveOrganizationNoteTool {
    fn name(&self) -> &str {
        "save_organization_note"
    }

    fn description(&self) -> &str {
        "Save an important fact about the organization (key processes, specifics, preferences) so every member's assistant knows it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact, at most 100 characters"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let p: NoteParams = serde_json::from_value(params)?;
        let content = normalize_note(&p.content);
        if content.is_empty() {
            return Ok(ToolOutput::error("Note content must not be empty."));
        }

        let org = context.organization_id;
        if self.store.count_facts(org).await? >= MAX_FACTS_PER_ORGANIZATION {
            return Ok(ToolOutput::error(format!(
                "Organization note limit of {MAX_FACTS_PER_ORGANIZATION} reached."
            )));
        }

        match self.store.add_fact(org, &content).await? {
            Some(fact) => {
                debug!(organization_id = %org, fact_id = %fact.id, "Saved organization note");
                Ok(ToolOutput::text(
                    json!({
                        "status": "success",
                        "message": "Organization note saved.",
                        "fact_id": fact.id,
                    })
                    .to_string(),
                ))
            }
            None => Ok(ToolOutput::text(
                json!({ "status": "success", "message": "Organization note was already saved." })
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_store::{SqlOrganizationFactStore, connect_with_settings, migrations::run_pending};
    use uuid::Uuid;

    use super::*;

    async fn tool() -> (SaveOrganizationNoteTool, Arc<SqlOrganizationFactStore>) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        let store = Arc::new(SqlOrganizationFactStore::new(pool));
        (SaveOrganizationNoteTool::new(store.clone()), store)
    }

    fn context() -> ToolContext {
        ToolContext {
            chat_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            agent_key: "assistant".into(),
        }
    }

    #[tokio::test]
    async fn test_save_note_returns_fact_id() {
        let (tool, store) = tool().await;
        let ctx = context();

        let out = tool.execute(json!({"content": " Payroll runs on the 25th "}), &ctx).await.unwrap();
        assert!(!out.is_error);
        let body: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(body["status"], "success");

        let facts = store.list_facts(ctx.organization_id, 10).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Payroll runs on the 25th");
        assert_eq!(body["fact_id"], json!(facts[0].id));

        let again = tool.execute(json!({"content": "Payroll runs on the 25th"}), &ctx).await.unwrap();
        assert!(again.content.contains("already saved"));
        assert!(tool.execute(json!({"content": "   "}), &ctx).await.unwrap().is_error);
    }

    #[tokio::test]
    async fn test_note_truncation_and_limit() {
        let (tool, store) = tool().await;
        let ctx = context();

        tool.execute(json!({"content": "é".repeat(300)}), &ctx).await.unwrap();
        let saved = &store.list_facts(ctx.organization_id, 1).await.unwrap()[0];
        assert_eq!(saved.content.chars().count(), MAX_NOTE_CHARS);

        for i in 1..MAX_FACTS_PER_ORGANIZATION {
            store.add_fact(ctx.organization_id, &format!("note {i}")).await.unwrap();
        }
        let out = tool.execute(json!({"content": "one more"}), &ctx).await.unwrap();
        assert!(out.is_error);
        assert_eq!(store.count_facts(ctx.organization_id).await.unwrap(), MAX_FACTS_PER_ORGANIZATION);
    }
}
