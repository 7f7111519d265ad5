//! Declarative agent definitions and tool-name patterns.

use serde::{Deserialize, Serialize};

/// Tool the model calls to hand a sub-task to a subagent.
pub const SWITCH_TO_SUBAGENT: &str = "switch_to_subagent";

/// Tool a subagent calls to return its summary to the parent chat.
pub const FINISH_SUBAGENT: &str = "finish_subagent";

const SUBAGENT_INSTRUCTION: &str = "You are a subagent working on a task assigned by a parent agent. \
Focus on that task only. When it is done, call the finish_subagent tool with a concise summary of the result.";

/// An externally configured agent: prompt, tool set, and delegation role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Tool names or wildcard patterns (`*`, `prefix*`).
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub can_call_subagents: bool,
    #[serde(default)]
    pub is_subagent: bool,
}

impl AgentDefinition {
    /// The built-in general assistant used when no agents are configured.
    pub fn default_assistant() -> Self {
        Self {
            key: "assistant".into(),
            name: "Assistant".into(),
            description: "General-purpose organization assistant".into(),
            system_prompt: "You are a helpful assistant for an organization. \
Answer concisely, use the available tools when they help, and never invent facts."
                .into(),
            allowed_tools: vec!["*".into()],
            can_call_subagents: false,
            is_subagent: false,
        }
    }

    /// The agent's own prompt plus the subagent instruction when applicable.
    pub fn effective_system_prompt(&self) -> String {
        if self.is_subagent {
            format!("{}\n\n{}", self.system_prompt, SUBAGENT_INSTRUCTION)
        } else {
            self.system_prompt.clone()
        }
    }

    /// Whether the agent may invoke `tool_name`, delegation tools included.
    pub fn can_use_tool(&self, tool_name: &str) -> bool {
        match tool_name {
            SWITCH_TO_SUBAGENT => self.can_call_subagents,
            FINISH_SUBAGENT => self.is_subagent,
            _ => self
                .allowed_tools
                .iter()
                .any(|pattern| matches_tool_pattern(pattern, tool_name)),
        }
    }
}

/// Match a tool name against an allow-list entry.
///
/// `*` matches everything, a trailing `*` matches by prefix, and anything
/// else must match exactly. Dynamically discovered tools (e.g. `mcp_*`)
/// are admitted this way.
pub fn matches_tool_pattern(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => tool_name.starts_with(prefix),
        None => pattern == tool_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_patterns() {
        assert!(matches_tool_pattern("*", "anything"));
        assert!(matches_tool_pattern("mcp_*", "mcp_search"));
        assert!(!matches_tool_pattern("mcp_*", "search"));
        assert!(matches_tool_pattern("save_user_fact", "save_user_fact"));
        assert!(!matches_tool_pattern("save_user_fact", "save_user_facts"));
    }

    #[test]
    fn test_delegation_tools_follow_flags() {
        let parent = AgentDefinition {
            key: "lead".into(),
            can_call_subagents: true,
            ..AgentDefinition::default()
        };
        assert!(parent.can_use_tool(SWITCH_TO_SUBAGENT));
        assert!(!parent.can_use_tool(FINISH_SUBAGENT));
        assert!(!parent.can_use_tool("transfer_funds"));

        let child = AgentDefinition {
            key: "researcher".into(),
            is_subagent: true,
            allowed_tools: vec!["*".into()],
            ..AgentDefinition::default()
        };
        assert!(child.can_use_tool(FINISH_SUBAGENT));
        assert!(!child.can_use_tool(SWITCH_TO_SUBAGENT));
        assert!(child.can_use_tool("transfer_funds"));
    }

    #[test]
    fn test_subagent_prompt_has_instruction() {
        let child = AgentDefinition {
            system_prompt: "Research things.".into(),
            is_subagent: true,
            ..AgentDefinition::default()
        };
        let prompt = child.effective_system_prompt();
        assert!(prompt.starts_with("Research things."));
        assert!(prompt.contains("finish_subagent"));

        let root = AgentDefinition::default_assistant();
        assert_eq!(root.effective_system_prompt(), root.system_prompt);
    }
}
