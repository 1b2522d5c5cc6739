use super::sse::SseFrame;
use super::{
    header, result_text, spawn_stream_reader, ChatProvider, FinishReason, HttpTransport,
    ProviderError, ProviderEvent, ProviderRequest, StreamDecoder, ToolCallRequest,
};
use crate::config::{AzureInferenceConfig, AzureOpenAiConfig};
use crate::models::messages::{ContentPart, Role};
use crate::pricing::TokenUsage;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const AZURE_INFERENCE_API_VERSION: &str = "2024-05-01-preview";

#[derive(Clone)]
enum Endpoint {
    OpenAi { api_key: String },
    Azure(AzureOpenAiConfig),
    AzureInference(AzureInferenceConfig),
}

/// Chat Completions adapter for OpenAI, Azure OpenAI deployments and Azure AI inference.
#[derive(Clone)]
pub struct OpenAiCompatible {
    name: &'static str,
    endpoint: Endpoint,
    transport: HttpTransport,
}

impl std::fmt::Debug for OpenAiCompatible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatible")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiCompatible {
    pub fn openai(api_key: String, transport: HttpTransport) -> Self {
        Self {
            name: "openai",
            endpoint: Endpoint::OpenAi { api_key },
            transport,
        }
    }

    pub fn azure(config: AzureOpenAiConfig, transport: HttpTransport) -> Self {
        Self {
            name: "azure-openai",
            endpoint: Endpoint::Azure(config),
            transport,
        }
    }

    pub fn azure_inference(config: AzureInferenceConfig, transport: HttpTransport) -> Self {
        Self {
            name: "azure-inference",
            endpoint: Endpoint::AzureInference(config),
            transport,
        }
    }

    fn url(&self, model: &str) -> String {
        match &self.endpoint {
            Endpoint::OpenAi { .. } => OPENAI_CHAT_URL.to_string(),
            Endpoint::Azure(azure) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                azure.endpoint, model, azure.api_version
            ),
            Endpoint::AzureInference(inference) => format!(
                "{}/chat/completions?api-version={}",
                inference.endpoint, AZURE_INFERENCE_API_VERSION
            ),
        }
    }

    fn auth_header(
        &self,
    ) -> Result<(hyper::header::HeaderName, hyper::header::HeaderValue), ProviderError> {
        match &self.endpoint {
            Endpoint::OpenAi { api_key } => header("authorization", &format!("Bearer {}", api_key)),
            Endpoint::Azure(azure) => header("api-key", &azure.api_key),
            Endpoint::AzureInference(inference) => {
                header("authorization", &format!("Bearer {}", inference.api_key))
            }
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let url = self.url(&request.model);
        let body = build_request_body(&request);
        let headers = [self.auth_header()?];
        debug!("Streaming {} from {}", request.model, self.name);

        let response = self
            .transport
            .post_json(self.name, &url, &headers, &body)
            .await?;
        Ok(spawn_stream_reader(
            self.name,
            response,
            OpenAiDecoder::default(),
        ))
    }
}

pub(crate) fn build_request_body(request: &ProviderRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }

    for message in &request.messages {
        match message.role {
            Role::User => messages.push(user_message(&message.parts)),
            Role::Assistant => messages.push(assistant_message(&message.parts)),
            Role::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult {
                        tool_call_id,
                        result,
                        ..
                    } = part
                    {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": result_text(result),
                        }));
                    }
                }
            }
        }
    }

    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), json!(true));
    body.insert("stream_options".to_string(), json!({"include_usage": true}));
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(max) = request.max_output_tokens {
        body.insert("max_tokens".to_string(), json!(max));
    }
    Value::Object(body)
}

fn user_message(parts: &[ContentPart]) -> Value {
    let content: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentPart::Image { url, .. } => {
                Some(json!({"type": "image_url", "image_url": {"url": url}}))
            }
            ContentPart::File { url, name, .. } => Some(json!({
                "type": "text",
                "text": format!("[Attached file {}: {}]", name.as_deref().unwrap_or("document"), url),
            })),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn assistant_message(parts: &[ContentPart]) -> Value {
    let text = crate::models::messages::text_of(parts);
    let tool_calls: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => Some(json!({
                "id": tool_call_id,
                "type": "function",
                "function": {"name": tool_name, "arguments": args.to_string()},
            })),
            _ => None,
        })
        .collect();

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert(
        "content".to_string(),
        if text.is_empty() { Value::Null } else { json!(text) },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(message)
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles tool calls streamed as indexed fragments.
#[derive(Default)]
pub(crate) struct OpenAiDecoder {
    pending: BTreeMap<u64, PendingToolCall>,
}

impl OpenAiDecoder {
    fn flush_tool_calls(&mut self) -> Vec<ProviderEvent> {
        std::mem::take(&mut self.pending)
            .into_values()
            .filter_map(|call| {
                if call.id.is_empty() || call.name.is_empty() {
                    warn!("Dropping tool call fragment without id or name");
                    return None;
                }
                let raw = if call.arguments.trim().is_empty() {
                    "{}"
                } else {
                    call.arguments.as_str()
                };
                match serde_json::from_str::<Value>(raw) {
                    Ok(args) => Some(ProviderEvent::ToolCall(ToolCallRequest {
                        id: call.id,
                        name: call.name,
                        args,
                    })),
                    Err(e) => {
                        warn!("Dropping incomplete tool call {}: {}", call.name, e);
                        None
                    }
                }
            })
            .collect()
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, String> {
        if self.is_terminal(frame) {
            return Ok(self.flush_tool_calls());
        }
        let json: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
        let mut events = Vec::new();

        if let Some(err) = json.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("provider error");
            events.push(ProviderEvent::Error(message.to_string()));
            return Ok(events);
        }

        if let Some(choice) = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            let delta = choice.get("delta");
            if let Some(text) = delta
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
            {
                if !text.is_empty() {
                    events.push(ProviderEvent::TextDelta(text.to_string()));
                }
            }

            if let Some(calls) = delta
                .and_then(|d| d.get("tool_calls"))
                .and_then(|c| c.as_array())
            {
                for call in calls {
                    let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let pending = self.pending.entry(index).or_default();
                    if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                        pending.id = id.to_string();
                    }
                    if let Some(function) = call.get("function") {
                        if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                            pending.name.push_str(name);
                        }
                        if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                            pending.arguments.push_str(args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                events.extend(self.flush_tool_calls());
                events.push(ProviderEvent::Finished(match reason {
                    "stop" => FinishReason::Stop,
                    "tool_calls" => FinishReason::ToolCalls,
                    "length" => FinishReason::Length,
                    other => FinishReason::Other(other.to_string()),
                }));
            }
        }

        if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
            events.push(ProviderEvent::Usage(TokenUsage::new(
                usage
                    .get("prompt_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            )));
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        self.flush_tool_calls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{PromptMessage, ToolSpec};

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_decodes_text_and_usage() {
        let mut decoder = OpenAiDecoder::default();
        let events = decoder
            .decode(&frame(
                r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            ))
            .unwrap();
        assert_eq!(events, vec![ProviderEvent::TextDelta("Hi".to_string())]);

        let events = decoder
            .decode(&frame(
                r#"{"choices":[],"usage":{"prompt_tokens":100,"completion_tokens":500}}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![ProviderEvent::Usage(TokenUsage::new(100, 500))]
        );
    }

    #[test]
    fn test_assembles_tool_call_fragments() {
        let mut decoder = OpenAiDecoder::default();
        decoder
            .decode(&frame(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":"{\"latitude\":"}}]}}]}"#,
            ))
            .unwrap();
        decoder
            .decode(&frame(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"23.8,\"longitude\":90.4}"}}]}}]}"#,
            ))
            .unwrap();
        let events = decoder
            .decode(&frame(
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![
                ProviderEvent::ToolCall(ToolCallRequest {
                    id: "call_1".to_string(),
                    name: "get_weather".to_string(),
                    args: json!({"latitude": 23.8, "longitude": 90.4}),
                }),
                ProviderEvent::Finished(FinishReason::ToolCalls),
            ]
        );
    }

    #[test]
    fn test_drops_truncated_tool_call() {
        let mut decoder = OpenAiDecoder::default();
        decoder
            .decode(&frame(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"create_document","arguments":"{\"title\":\"Ess"}}]}}]}"#,
            ))
            .unwrap();
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_request_body_shapes_tools_and_history() {
        let request = ProviderRequest {
            model: "gpt-4o".to_string(),
            system: Some("You are helpful.".to_string()),
            messages: vec![
                PromptMessage::user_text("Weather in Dhaka?"),
                PromptMessage {
                    role: Role::Assistant,
                    parts: vec![ContentPart::ToolCall {
                        tool_call_id: "call_1".to_string(),
                        tool_name: "get_weather".to_string(),
                        args: json!({"latitude": 23.8}),
                    }],
                },
                PromptMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id: "call_1".to_string(),
                        tool_name: "get_weather".to_string(),
                        result: json!({"temperature": 31}),
                        is_error: false,
                    }],
                },
            ],
            tools: vec![ToolSpec {
                name: "get_weather".to_string(),
                description: "Current weather".to_string(),
                parameters: json!({"type": "object"}),
            }],
            max_output_tokens: None,
        };
        let body = build_request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"latitude\":23.8}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("max_tokens").is_none());
    }
}
