//! Short-term memory: facts about the user that are folded into every prompt.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use parley_store::UserFactStore;

use crate::{Tool, ToolContext, ToolOutput};

/// Longest fact kept, in characters; longer input is truncated.
pub const MAX_FACT_CHARS: usize = 200;

/// Facts kept per user.
pub const MAX_FACTS_PER_USER: u64 = 50;

pub struct SaveUserFactTool {
    store: Arc<dyn UserFactStore>,
}

impl SaveUserFactTool {
    pub fn new(store: Arc<dyn UserFactStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
struct SaveParams {
    content: String,
}

/// Trim and cap a fact to [`MAX_FACT_CHARS`].
pub fn normalize_fact(raw: &str) -> String {
    raw.trim().chars().take(MAX_FACT_CHARS).collect::<String>().trim_end().to_string()
}

#[async_trait]
impl Tool for SaveUserFactTool {
    fn name(&self) -> &str {
        "save_user_fact"
    }

    fn description(&self) -> &str {
        "Remember a short, durable fact about the user (preferences, role, context) for future conversations."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact, in one short sentence"
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
        let p: SaveParams = serde_json::from_value(params)?;
        let content = normalize_fact(&p.content);
        if content.is_empty() {
            return Ok(ToolOutput::error("Fact content must not be empty."));
        }

        if self.store.count_facts(context.user_id).await? >= MAX_FACTS_PER_USER {
            return Ok(ToolOutput::error(format!(
                "Fact limit of {MAX_FACTS_PER_USER} reached; ask the user to remove old facts first."
            )));
        }

        match self.store.add_fact(context.user_id, &content).await? {
            Some(fact) => {
                debug!(user_id = %context.user_id, fact_id = %fact.id, "Saved user fact");
                Ok(ToolOutput::text("Fact saved."))
            }
            None => Ok(ToolOutput::text("Fact was already saved.")),
        }
    }
}
