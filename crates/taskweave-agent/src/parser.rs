//! Model response parsing.
//!
//! The loop asks the model for a single JSON object:
//!
//! ```json
//! {"thought": "...", "action": {"tool": "search", "arguments": {"q": "x"}}}
//! {"thought": "...", "action": {"handoff": "writer", "task": "draft it"}}
//! {"thought": "...", "answer": "the final answer"}
//! ```
//!
//! Parsing is tolerant of markdown fences and surrounding prose, and a
//! reply that contains no JSON object at all is taken as a final answer.
//! A JSON object that names neither an action nor an answer is a parse
//! error — the loop re-prompts once before giving up.

use serde_json::Value;

use taskweave_core::error::{Result, WeaveError};

/// What the model decided to do this iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    ToolCall {
        name: String,
        arguments: Value,
    },
    Handoff {
        target_role: String,
        task: String,
        context: serde_json::Map<String, Value>,
    },
    FinalAnswer {
        answer: String,
    },
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub thought: String,
    pub action: AgentAction,
}

/// Parse one model reply into a thought and an action.
pub fn parse(response: &str) -> Result<ParsedResponse> {
    let Some(object) = extract_object(response) else {
        // Plain prose: the model answered directly.
        return Ok(ParsedResponse {
            thought: String::new(),
            action: AgentAction::FinalAnswer {
                answer: response.trim().to_string(),
            },
        });
    };

    let thought = object
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if let Some(answer) = object.get("answer") {
        let answer = match answer {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(ParsedResponse {
            thought,
            action: AgentAction::FinalAnswer { answer },
        });
    }

    let action = object.get("action").ok_or_else(|| {
        WeaveError::Parse("response object has neither 'action' nor 'answer'".to_string())
    })?;
    let action = action.as_object().ok_or_else(|| {
        WeaveError::Parse(format!("'action' must be an object, got {}", action))
    })?;

    if let Some(tool) = action.get("tool") {
        let name = tool
            .as_str()
            .ok_or_else(|| WeaveError::Parse("'tool' must be a string".to_string()))?
            .to_string();
        let arguments = action.get("arguments").cloned().unwrap_or(Value::Null);
        return Ok(ParsedResponse {
            thought,
            action: AgentAction::ToolCall { name, arguments },
        });
    }

    if let Some(target) = action.get("handoff") {
        let target_role = target
            .as_str()
            .ok_or_else(|| WeaveError::Parse("'handoff' must be a role name".to_string()))?
            .to_string();
        let task = action
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WeaveError::Parse("handoff requires a 'task' string".to_string()))?
            .to_string();
        let context = action
            .get("context")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        return Ok(ParsedResponse {
            thought,
            action: AgentAction::Handoff {
                target_role,
                task,
                context,
            },
        });
    }

    Err(WeaveError::Parse(
        "'action' names neither 'tool' nor 'handoff'".to_string(),
    ))
}

/// Find a JSON object in the reply: the whole trimmed text, a fenced
/// block, or the outermost brace span. `None` when nothing parses.
fn extract_object(response: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = response.trim();

    if let Some(map) = parse_object(trimmed) {
        return Some(map);
    }

    if let Some(fenced) = strip_fence(trimmed) {
        if let Some(map) = parse_object(fenced) {
            return Some(map);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        return parse_object(&trimmed[start..=end]);
    }
    None
}

fn parse_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}
