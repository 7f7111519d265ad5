//! Tools exposed to the model during agent runs.
//!
//! Each tool implements the [`Tool`] trait. The [`ToolRegistry`] is the
//! dispatcher: it executes tools by name and reports which of them sit
//! behind the human confirmation gate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use parley_core::agent::AgentDefinition;
use parley_core::types::ToolDefinition;

pub mod delegation;
pub mod org_note;
pub mod transfer;
pub mod user_fact;

/// The chat a tool runs on behalf of.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub agent_key: String,
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

/// The core tool trait. Every built-in tool implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model (e.g. "save_user_fact").
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether a human must approve each call before it runs.
    fn requires_confirmation(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry and dispatcher of available tools, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set: user and organization memory plus the gated
    /// transfer tool.
    pub fn with_builtins(
        facts: Arc<dyn parley_store::UserFactStore>,
        org_facts: Arc<dyn parley_store::OrganizationFactStore>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(user_fact::SaveUserFactTool::new(facts)));
        registry.register(Arc::new(org_note::SaveOrganizationNoteTool::new(org_facts)));
        registry.register(Arc::new(transfer::TransferFundsTool));
        registry
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Unknown tools never require confirmation; they fail at dispatch instead.
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.requires_confirmation())
    }

    pub async fn execute(
        &self,
        context: &ToolContext,
        name: &str,
        params: &serde_json::Value,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool: {name}"))?;
        debug!(tool = %name, chat_id = %context.chat_id, "Executing tool");
        tool.execute(params.clone(), context).await
    }

    /// Tool definitions offered to `agent`: allowed registry tools plus the
    /// delegation tools its flags permit.
    pub fn definitions_for(&self, agent: &AgentDefinition) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| agent.can_use_tool(t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        if agent.can_call_subagents {
            defs.push(delegation::switch_definition());
        }
        if agent.is_subagent {
            defs.push(delegation::finish_definition());
        }
        defs
    }
}
