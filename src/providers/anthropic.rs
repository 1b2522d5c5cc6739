use super::sse::SseFrame;
use super::{
    header, result_text, spawn_stream_reader, ChatProvider, FinishReason, HttpTransport,
    ProviderError, ProviderEvent, ProviderRequest, StreamDecoder, ToolCallRequest,
};
use crate::models::messages::{ContentPart, Role};
use crate::pricing::TokenUsage;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicProvider {
    api_key: String,
    transport: HttpTransport,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, transport: HttpTransport) -> Self {
        Self { api_key, transport }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let body = build_request_body(&request);
        let headers = [
            header("x-api-key", &self.api_key)?,
            header("anthropic-version", ANTHROPIC_VERSION)?,
        ];
        debug!("Streaming {} from anthropic", request.model);

        let response = self
            .transport
            .post_json(self.name(), ANTHROPIC_MESSAGES_URL, &headers, &body)
            .await?;
        Ok(spawn_stream_reader(
            self.name(),
            response,
            AnthropicDecoder::default(),
        ))
    }
}

pub(crate) fn build_request_body(request: &ProviderRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter_map(|message| {
            let content: Vec<Value> = message.parts.iter().filter_map(content_block).collect();
            if content.is_empty() {
                return None;
            }
            let role = match message.role {
                Role::Assistant => "assistant",
                Role::User | Role::Tool => "user",
            };
            Some(json!({"role": role, "content": content}))
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert(
        "max_tokens".to_string(),
        json!(request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), json!(true));
    if let Some(system) = &request.system {
        body.insert("system".to_string(), json!(system));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    Value::Object(body)
}

fn content_block(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } if !text.is_empty() => Some(json!({"type": "text", "text": text})),
        ContentPart::Text { .. } => None,
        ContentPart::Image { url, .. } => Some(json!({
            "type": "image",
            "source": {"type": "url", "url": url},
        })),
        ContentPart::File { url, media_type, .. } if media_type == "application/pdf" => {
            Some(json!({
                "type": "document",
                "source": {"type": "url", "url": url},
            }))
        }
        ContentPart::File { url, .. } => Some(json!({
            "type": "text",
            "text": format!("[Attached file: {}]", url),
        })),
        ContentPart::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } => Some(json!({
            "type": "tool_use",
            "id": tool_call_id,
            "name": tool_name,
            "input": args,
        })),
        ContentPart::ToolResult {
            tool_call_id,
            result,
            is_error,
            ..
        } => Some(json!({
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": result_text(result),
            "is_error": is_error,
        })),
    }
}

struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Decodes the Messages API event stream.
#[derive(Default)]
pub(crate) struct AnthropicDecoder {
    input_tokens: i64,
    tool_blocks: HashMap<u64, PendingToolUse>,
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, String> {
        let json: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
        let kind = json
            .get("type")
            .and_then(|t| t.as_str())
            .or(frame.event.as_deref())
            .unwrap_or_default();
        let index = json.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let mut events = Vec::new();

        match kind {
            "message_start" => {
                self.input_tokens = json
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
            }
            "content_block_start" => {
                if let Some(block) = json.get("content_block") {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        self.tool_blocks.insert(
                            index,
                            PendingToolUse {
                                id: block
                                    .get("id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                                name: block
                                    .get("name")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                                input_json: String::new(),
                            },
                        );
                    }
                }
            }
            "content_block_delta" => {
                let delta = json.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(pending), Some(partial)) = (
                            self.tool_blocks.get_mut(&index),
                            delta
                                .and_then(|d| d.get("partial_json"))
                                .and_then(|p| p.as_str()),
                        ) {
                            pending.input_json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(pending) = self.tool_blocks.remove(&index) {
                    let raw = if pending.input_json.trim().is_empty() {
                        "{}"
                    } else {
                        pending.input_json.as_str()
                    };
                    match serde_json::from_str::<Value>(raw) {
                        Ok(args) => events.push(ProviderEvent::ToolCall(ToolCallRequest {
                            id: pending.id,
                            name: pending.name,
                            args,
                        })),
                        Err(e) => warn!("Dropping incomplete tool use {}: {}", pending.name, e),
                    }
                }
            }
            "message_delta" => {
                let output_tokens = json
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                events.push(ProviderEvent::Usage(TokenUsage::new(
                    self.input_tokens,
                    output_tokens,
                )));
                if let Some(reason) = json.pointer("/delta/stop_reason").and_then(|r| r.as_str()) {
                    events.push(ProviderEvent::Finished(match reason {
                        "end_turn" | "stop_sequence" => FinishReason::Stop,
                        "tool_use" => FinishReason::ToolCalls,
                        "max_tokens" => FinishReason::Length,
                        other => FinishReason::Other(other.to_string()),
                    }));
                }
            }
            "error" => {
                let message = json
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("provider error");
                events.push(ProviderEvent::Error(message.to_string()));
            }
            _ => {}
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if !self.tool_blocks.is_empty() {
            warn!(
                "Discarding {} unterminated tool use blocks",
                self.tool_blocks.len()
            );
            self.tool_blocks.clear();
        }
        Vec::new()
    }

    fn is_terminal(&self, frame: &SseFrame) -> bool {
        frame.event.as_deref() == Some("message_stop")
            || frame.data.contains("\"type\":\"message_stop\"")
    }
}
