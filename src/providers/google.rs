use super::sse::SseFrame;
use super::{
    header, spawn_stream_reader, ChatProvider, FinishReason, HttpTransport, ProviderError,
    ProviderEvent, ProviderRequest, StreamDecoder, ToolCallRequest,
};
use crate::models::messages::{ContentPart, Role};
use crate::pricing::TokenUsage;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MAX_INLINE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct GoogleProvider {
    api_key: String,
    transport: HttpTransport,
    attachments: reqwest::Client,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl GoogleProvider {
    pub fn new(api_key: String, transport: HttpTransport) -> Self {
        let attachments = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            transport,
            attachments,
        }
    }

    /// Gemini only reads media inline, so attachments are downloaded and base64 encoded.
    async fn inline_attachments(&self, request: &mut ProviderRequest) {
        for message in request.messages.iter_mut() {
            for part in message.parts.iter_mut() {
                let (url, media_type) = match part {
                    ContentPart::Image { url, media_type } => (
                        url.clone(),
                        media_type.clone().unwrap_or_else(|| "image/jpeg".to_string()),
                    ),
                    ContentPart::File { url, media_type, .. } => (url.clone(), media_type.clone()),
                    _ => continue,
                };
                if url.starts_with("data:") {
                    continue;
                }
                match self.fetch_bytes(&url).await {
                    Ok(bytes) => {
                        let encoded = general_purpose::STANDARD.encode(&bytes);
                        *part = ContentPart::Image {
                            url: format!("data:{};base64,{}", media_type, encoded),
                            media_type: Some(media_type),
                        };
                    }
                    Err(e) => {
                        warn!("Could not inline attachment for gemini: {}", e);
                        *part = ContentPart::text(format!("[Attachment unavailable: {}]", url));
                    }
                }
            }
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .attachments
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.len() > MAX_INLINE_BYTES {
            return Err(format!("attachment of {} bytes is too large", bytes.len()));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ChatProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn stream_chat(
        &self,
        mut request: ProviderRequest,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        self.inline_attachments(&mut request).await;
        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse",
            GEMINI_BASE_URL, request.model
        );
        let body = build_request_body(&request);
        let headers = [header("x-goog-api-key", &self.api_key)?];
        debug!("Streaming {} from google", request.model);

        let response = self
            .transport
            .post_json(self.name(), &url, &headers, &body)
            .await?;
        Ok(spawn_stream_reader(
            self.name(),
            response,
            GeminiDecoder::default(),
        ))
    }
}

pub(crate) fn build_request_body(request: &ProviderRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter_map(|message| {
            let parts: Vec<Value> = message.parts.iter().filter_map(gemini_part).collect();
            if parts.is_empty() {
                return None;
            }
            let role = match message.role {
                Role::Assistant => "model",
                Role::User | Role::Tool => "user",
            };
            Some(json!({"role": role, "parts": parts}))
        })
        .collect();

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system) = &request.system {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }
    if let Some(max) = request.max_output_tokens {
        body.insert(
            "generationConfig".to_string(),
            json!({"maxOutputTokens": max}),
        );
    }
    Value::Object(body)
}

fn gemini_part(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } if !text.is_empty() => Some(json!({"text": text})),
        ContentPart::Text { .. } => None,
        ContentPart::Image { url, media_type } if url.starts_with("data:") => {
            let (mime, data) = split_data_url(url)?;
            Some(json!({
                "inlineData": {
                    "mimeType": media_type.as_deref().unwrap_or(mime),
                    "data": data,
                }
            }))
        }
        ContentPart::Image { url, .. } | ContentPart::File { url, .. } => {
            Some(json!({"text": format!("[Attachment: {}]", url)}))
        }
        ContentPart::ToolCall {
            tool_name, args, ..
        } => Some(json!({"functionCall": {"name": tool_name, "args": args}})),
        ContentPart::ToolResult {
            tool_name, result, ..
        } => {
            let response = if result.is_object() {
                result.clone()
            } else {
                json!({"result": result})
            };
            Some(json!({"functionResponse": {"name": tool_name, "response": response}}))
        }
    }
}

/// Splits `data:<mime>;base64,<payload>`.
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta);
    Some((mime, data))
}

/// Gemini reports cumulative usage on every chunk, so only the last value is kept.
#[derive(Default)]
pub(crate) struct GeminiDecoder {
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    saw_tool_call: bool,
}

impl StreamDecoder for GeminiDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, String> {
        let json: Value = serde_json::from_str(&frame.data).map_err(|e| e.to_string())?;
        let mut events = Vec::new();

        if let Some(message) = json.pointer("/error/message").and_then(|m| m.as_str()) {
            events.push(ProviderEvent::Error(message.to_string()));
            return Ok(events);
        }

        if let Some(candidate) = json
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(parts) = candidate
                .pointer("/content/parts")
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    if let Some(call) = part.get("functionCall") {
                        let name = call
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default();
                        if name.is_empty() {
                            warn!("Dropping gemini function call without a name");
                            continue;
                        }
                        self.saw_tool_call = true;
                        events.push(ProviderEvent::ToolCall(ToolCallRequest {
                            id: format!("call_{}", Uuid::new_v4().simple()),
                            name: name.to_string(),
                            args: call.get("args").cloned().unwrap_or_else(|| json!({})),
                        }));
                    }
                }
            }
            if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        if let Some(usage) = json.get("usageMetadata") {
            self.usage = Some(TokenUsage::new(
                usage
                    .get("promptTokenCount")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                usage
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            ));
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if let Some(usage) = self.usage.take() {
            events.push(ProviderEvent::Usage(usage));
        }
        let reason = match self.finish_reason.take().as_deref() {
            _ if self.saw_tool_call => FinishReason::ToolCalls,
            Some("STOP") | None => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
        };
        events.push(ProviderEvent::Finished(reason));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PromptMessage;

    fn frame(data: Value) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_keeps_last_cumulative_usage() {
        let mut decoder = GeminiDecoder::default();
        let first = decoder
            .decode(&frame(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello"}]}}],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 1}
            })))
            .unwrap();
        assert_eq!(first, vec![ProviderEvent::TextDelta("Hello".to_string())]);
        decoder
            .decode(&frame(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": " there"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 4}
            })))
            .unwrap();

        assert_eq!(
            decoder.finish(),
            vec![
                ProviderEvent::Usage(TokenUsage::new(12, 4)),
                ProviderEvent::Finished(FinishReason::Stop),
            ]
        );
    }

    #[test]
    fn test_function_calls_get_ids() {
        let mut decoder = GeminiDecoder::default();
        let events = decoder
            .decode(&frame(json!({
                "candidates": [{"content": {"parts": [{"functionCall": {"name": "get_weather", "args": {"latitude": 23.8}}}]}}]
            })))
            .unwrap();
        match &events[0] {
            ProviderEvent::ToolCall(call) => {
                assert_eq!(call.name, "get_weather");
                assert!(call.id.starts_with("call_"));
                assert_eq!(call.args, json!({"latitude": 23.8}));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            decoder.finish().last(),
            Some(&ProviderEvent::Finished(FinishReason::ToolCalls))
        );
    }

    #[test]
    fn test_request_body_maps_roles_and_inline_data() {
        let request = ProviderRequest {
            model: "gemini-2.0-flash".to_string(),
            system: Some("Answer in Bangla.".to_string()),
            messages: vec![
                PromptMessage {
                    role: Role::User,
                    parts: vec![
                        ContentPart::text("What is this?"),
                        ContentPart::Image {
                            url: "data:image/png;base64,iVBORw0KGgo=".to_string(),
                            media_type: Some("image/png".to_string()),
                        },
                    ],
                },
                PromptMessage {
                    role: Role::Assistant,
                    parts: vec![ContentPart::text("A cat.")],
                },
            ],
            tools: vec![],
            max_output_tokens: Some(64),
        };
        let body = build_request_body(&request);
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["data"], "iVBORw0KGgo=");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Answer in Bangla.");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(
            split_data_url("data:application/pdf;base64,JVBERi0="),
            Some(("application/pdf", "JVBERi0="))
        );
        assert_eq!(split_data_url("https://example.com/a.png"), None);
    }
}
