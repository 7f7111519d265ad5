//! System prompt builder.

use chrono::{DateTime, Utc};

use parley_core::agent::AgentDefinition;

/// Everything the system prompt is built from.
pub struct PromptParts<'a> {
    pub agent: &'a AgentDefinition,
    /// Subagents the agent may delegate to; empty when it cannot delegate.
    pub subagents: &'a [AgentDefinition],
    pub facts: &'a [String],
    pub organization_facts: &'a [String],
    pub snippets: &'a [String],
    pub now: DateTime<Utc>,
}

pub fn build_system_prompt(parts: &PromptParts<'_>) -> String {
    let mut sections = vec![parts.agent.effective_system_prompt()];

    if !parts.subagents.is_empty() {
        let list = parts
            .subagents
            .iter()
            .map(|s| format!("- {} ({}): {}", s.key, s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!(
            "--- Available Subagents ---\nDelegate with switch_to_subagent when a task fits one of these:\n{list}"
        ));
    }

    if !parts.facts.is_empty() {
        let list = parts
            .facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("--- Known Facts About The User ---\n{list}"));
    }

    if !parts.organization_facts.is_empty() {
        let list = parts
            .organization_facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("--- Known Facts About The Organization ---\n{list}"));
    }

    if !parts.snippets.is_empty() {
        let list = parts
            .snippets
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {s}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("--- Relevant Documents ---\n{list}"));
    }

    sections.push(format!(
        "Current time: {}",
        parts.now.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_sections() {
        let agent = AgentDefinition::default_assistant();
        let subagents = vec![AgentDefinition {
            key: "researcher".into(),
            name: "Researcher".into(),
            description: "Finds rates".into(),
            is_subagent: true,
            ..AgentDefinition::default()
        }];
        let facts = vec!["Prefers tea".to_string()];
        let prompt = build_system_prompt(&PromptParts {
            agent: &agent,
            subagents: &subagents,
            facts: &facts,
            organization_facts: &[],
            snippets: &[],
            now: Utc::now(),
        });

        assert!(prompt.starts_with(&agent.system_prompt));
        assert!(prompt.contains("- researcher (Researcher): Finds rates"));
        assert!(prompt.contains("- Prefers tea"));
        assert!(!prompt.contains("Relevant Documents"));
        assert!(!prompt.contains("Facts About The Organization"));
        assert!(prompt.contains("Current time: "));
    }

    #[test]
    fn test_organization_facts_follow_user_facts() {
        let agent = AgentDefinition::default_assistant();
        let facts = vec!["Prefers tea".to_string()];
        let org_facts = vec!["Payroll runs on the 25th".to_string()];
        let prompt = build_system_prompt(&PromptParts {
            agent: &agent,
            subagents: &[],
            facts: &facts,
            organization_facts: &org_facts,
            snippets: &[],
            now: Utc::now(),
        });

        let user_at = prompt.find("--- Known Facts About The User ---").unwrap();
        let org_at = prompt.find("--- Known Facts About The Organization ---\n- Payroll runs on the 25th").unwrap();
        assert!(user_at < org_at);
    }
}
