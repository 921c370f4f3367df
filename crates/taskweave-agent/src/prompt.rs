//! Prompt assembly for the think/act/observe loop.
//!
//! Templates use the same `{{placeholder}}` shape as workflow
//! references: `{{query}}`, `{{tools}}`, and `{{scratchpad}}`.

use taskweave_core::types::{ScratchpadItem, StepSpec};

/// Built-in ReAct-style template used when a role declares none.
pub const DEFAULT_TEMPLATE: &str = "\
You are an assistant that solves tasks step by step.

Task: {{query}}

Available tools:
{{tools}}

Previous steps:
{{scratchpad}}

Respond with exactly one JSON object, one of:
{\"thought\": \"...\", \"action\": {\"tool\": \"<name>\", \"arguments\": {...}}}
{\"thought\": \"...\", \"action\": {\"handoff\": \"<role>\", \"task\": \"...\"}}
{\"thought\": \"...\", \"answer\": \"...\"}
";

/// Fill a template's placeholders.
pub fn render(template: &str, query: &str, tools: &str, history: &[ScratchpadItem]) -> String {
    template
        .replace("{{query}}", query)
        .replace("{{tools}}", tools)
        .replace("{{scratchpad}}", &render_scratchpad(history))
}

/// One line per tool: name, required and optional parameters.
pub fn render_tools(specs: &[(String, StepSpec)]) -> String {
    if specs.is_empty() {
        return "(none)".to_string();
    }
    specs
        .iter()
        .map(|(name, spec)| {
            let mut params: Vec<String> = spec
                .required
                .iter()
                .map(|p| format!("{} (required)", p.name))
                .collect();
            params.extend(spec.optional.iter().map(|p| format!("{} (optional)", p.name)));
            if params.is_empty() {
                format!("- {}", name)
            } else {
                format!("- {}: {}", name, params.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_scratchpad(history: &[ScratchpadItem]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    history
        .iter()
        .map(|item| {
            if item.origin {
                format!("Task: {}", item.observation)
            } else {
                let action = item.action.as_deref().unwrap_or("none");
                format!(
                    "Thought: {}\nAction: {}\nObservation: {}",
                    item.thought, action, item.observation
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Follow-up prompt after an unparseable reply.
pub fn corrective(original_prompt: &str, error: &str) -> String {
    format!(
        "{}\n\nYour previous reply could not be parsed: {}.\n\
         Reply again with exactly one JSON object and nothing else.",
        original_prompt, error
    )
}
