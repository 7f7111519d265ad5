//! Schemas for the delegation tools.
//!
//! These are never dispatched through the registry; the engine intercepts
//! them because they move execution between chats.

use serde::Deserialize;
use serde_json::json;

use parley_core::agent::{FINISH_SUBAGENT, SWITCH_TO_SUBAGENT};
use parley_core::types::ToolDefinition;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchArgs {
    pub agent_key: String,
    pub task: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishArgs {
    pub summary: String,
}

pub fn is_delegation_tool(name: &str) -> bool {
    name == SWITCH_TO_SUBAGENT || name == FINISH_SUBAGENT
}

pub fn parse_switch(args: &serde_json::Value) -> anyhow::Result<SwitchArgs> {
    let parsed: SwitchArgs = serde_json::from_value(args.clone())
        .map_err(|e| anyhow::anyhow!("invalid {SWITCH_TO_SUBAGENT} arguments: {e}"))?;
    if parsed.agent_key.trim().is_empty() || parsed.task.trim().is_empty() {
        anyhow::bail!("{SWITCH_TO_SUBAGENT} needs a non-empty agent_key and task");
    }
    Ok(parsed)
}

pub fn parse_finish(args: &serde_json::Value) -> anyhow::Result<FinishArgs> {
    serde_json::from_value(args.clone())
        .map_err(|e| anyhow::anyhow!("invalid {FINISH_SUBAGENT} arguments: {e}"))
}

pub fn switch_definition() -> ToolDefinition {
    ToolDefinition {
        name: SWITCH_TO_SUBAGENT.into(),
        description: "Delegate a self-contained task to a specialized subagent. \
The conversation continues with the subagent until it reports back."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent_key": {
                    "type": "string",
                    "description": "Key of the subagent to delegate to"
                },
                "task": {
                    "type": "string",
                    "description": "What the subagent should accomplish, with any needed context"
                }
            },
            "required": ["agent_key", "task"]
        }),
    }
}

pub fn finish_definition() -> ToolDefinition {
    ToolDefinition {
        name: FINISH_SUBAGENT.into(),
        description: "Finish the delegated task and return a summary to the parent conversation."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Concise result of the task"
                }
            },
            "required": ["summary"]
        }),
    }
}
