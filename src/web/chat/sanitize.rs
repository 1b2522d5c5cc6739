use crate::models::messages::{ContentPart, Message};
use crate::providers::PromptMessage;
use std::collections::HashSet;
use tracing::warn;

/// Removes tool calls that never got a result, then any message left without parts.
pub fn drop_unanswered_tool_calls(messages: Vec<PromptMessage>) -> Vec<PromptMessage> {
    let answered: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            ContentPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    messages
        .into_iter()
        .map(|mut m| {
            m.parts.retain(|p| match p {
                ContentPart::ToolCall { tool_call_id, .. } => answered.contains(tool_call_id),
                ContentPart::Text { text } => !text.is_empty(),
                _ => true,
            });
            m
        })
        .filter(|m| !m.parts.is_empty())
        .collect()
}

/// Rebuilds the prompt history of a chat from stored messages.
pub fn prompt_history(stored: &[Message]) -> Vec<PromptMessage> {
    let messages = stored
        .iter()
        .filter_map(|m| {
            let role = match m.role() {
                Some(role) => role,
                None => {
                    warn!("Skipping message {} with unknown role {}", m.id, m.role);
                    return None;
                }
            };
            match m.parts() {
                Ok(parts) => Some(PromptMessage { role, parts }),
                Err(e) => {
                    warn!("Skipping message {}: {}", m.id, e);
                    None
                }
            }
        })
        .collect();
    drop_unanswered_tool_calls(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::Role;
    use serde_json::json;

    fn call(id: &str) -> ContentPart {
        ContentPart::ToolCall {
            tool_call_id: id.to_string(),
            tool_name: "get_weather".to_string(),
            args: json!({}),
        }
    }

    fn result(id: &str) -> ContentPart {
        ContentPart::ToolResult {
            tool_call_id: id.to_string(),
            tool_name: "get_weather".to_string(),
            result: json!({"temperature": 31}),
            is_error: false,
        }
    }

    #[test]
    fn test_unanswered_calls_are_removed() {
        let messages = vec![
            PromptMessage {
                role: Role::Assistant,
                parts: vec![ContentPart::text("Checking"), call("a"), call("b")],
            },
            PromptMessage {
                role: Role::Tool,
                parts: vec![result("a")],
            },
        ];
        let cleaned = drop_unanswered_tool_calls(messages);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].parts, vec![ContentPart::text("Checking"), call("a")]);
    }

    #[test]
    fn test_messages_left_empty_are_dropped() {
        let messages = vec![
            PromptMessage::user_text("Weather in Dhaka?"),
            PromptMessage {
                role: Role::Assistant,
                parts: vec![ContentPart::text(""), call("lost")],
            },
        ];
        let cleaned = drop_unanswered_tool_calls(messages);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].role, Role::User);
    }
}
