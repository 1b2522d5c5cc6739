use crate::config::AppConfig;
use crate::model_registry::Provider;
use crate::models::messages::{ContentPart, Role};
use crate::pricing::TokenUsage;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use hyper::body::to_bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body as HyperBody, Client, Request, Response};
use hyper_tls::HttpsConnector;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod sse;

use sse::{drain_utf8, extract_sse_frame, SseFrame};

const REQUEST_TIMEOUT_SECS: u64 = 120;
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;
const MAX_RETRY_ELAPSED_SECS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} returned status {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("Failed to connect to {provider}: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("Request to {0} timed out")]
    Timeout(&'static str),
    #[error("Failed to build request: {0}")]
    Request(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Transport failures, rate limits and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Transport { .. } | ProviderError::Timeout(_) => true,
            ProviderError::Request(_) | ProviderError::Stream(_) => false,
        }
    }
}

/// One message of the prompt sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl PromptMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::text(text)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Usage(TokenUsage),
    Finished(FinishReason),
    Error(String),
}

/// A whole response gathered from a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a streaming completion. Events arrive until the channel closes.
    async fn stream_chat(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError>;

    async fn complete(&self, request: ProviderRequest) -> Result<Completion, ProviderError> {
        let mut rx = self.stream_chat(request).await?;
        collect_completion(&mut rx).await
    }
}

pub async fn collect_completion(
    rx: &mut mpsc::Receiver<ProviderEvent>,
) -> Result<Completion, ProviderError> {
    let mut completion = Completion::default();
    while let Some(event) = rx.recv().await {
        match event {
            ProviderEvent::TextDelta(text) => completion.text.push_str(&text),
            ProviderEvent::ToolCall(call) => completion.tool_calls.push(call),
            ProviderEvent::Usage(usage) => {
                let total = completion.usage.get_or_insert_with(TokenUsage::default);
                *total += usage;
            }
            ProviderEvent::Finished(_) => {}
            ProviderEvent::Error(message) => return Err(ProviderError::Stream(message)),
        }
    }
    Ok(completion)
}

/// Turns provider SSE frames into events. One decoder per response.
pub(crate) trait StreamDecoder: Send + 'static {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, String>;

    /// Events still held when the stream closes.
    fn finish(&mut self) -> Vec<ProviderEvent>;

    fn is_terminal(&self, frame: &SseFrame) -> bool {
        frame.data.trim() == "[DONE]"
    }
}

/// Renders a tool result for providers that take tool output as text.
pub(crate) fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn header(name: &'static str, value: &str) -> Result<(HeaderName, HeaderValue), ProviderError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| ProviderError::Request(format!("invalid header {}: {}", name, e)))?;
    Ok((HeaderName::from_static(name), value))
}

/// Pooled HTTPS client shared by every provider adapter.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, HyperBody>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build::<_, HyperBody>(https);
        Self { client }
    }

    /// POSTs `body` and returns the successful response, retrying transient failures
    /// with exponential backoff.
    pub async fn post_json(
        &self,
        provider: &'static str,
        url: &str,
        headers: &[(HeaderName, HeaderValue)],
        body: &Value,
    ) -> Result<Response<HyperBody>, ProviderError> {
        let body_json =
            serde_json::to_string(body).map_err(|e| ProviderError::Request(e.to_string()))?;
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_elapsed_time: Some(Duration::from_secs(MAX_RETRY_ELAPSED_SECS)),
            ..Default::default()
        };

        let this = self;
        let body_ref: &str = &body_json;
        backoff::future::retry(policy, move || async move {
            this.try_provider(provider, url, headers, body_ref)
                .await
                .map_err(|e| {
                    if e.is_retryable() {
                        warn!("Retrying {} after error: {}", provider, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await
    }

    async fn try_provider(
        &self,
        provider: &'static str,
        url: &str,
        headers: &[(HeaderName, HeaderValue)],
        body_json: &str,
    ) -> Result<Response<HyperBody>, ProviderError> {
        debug!("Making request to {}", provider);

        let mut req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", "application/json");
        for (name, val) in headers {
            req = req.header(name.clone(), val.clone());
        }

        trace!(
            "Sending to provider={} body_len={}",
            provider,
            body_json.len()
        );

        let req = req
            .body(HyperBody::from(body_json.to_string()))
            .map_err(|e| ProviderError::Request(format!("{:?}", e)))?;

        match timeout(
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
            self.client.request(req),
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    return Ok(response);
                }
                let status = response.status();
                error!("Provider {} returned non-success status: {}", provider, status);
                let body = match to_bytes(response.into_body()).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                    Err(_) => String::new(),
                };
                error!("Response body: {}", body);
                Err(ProviderError::Status {
                    provider,
                    status: status.as_u16(),
                    body,
                })
            }
            Ok(Err(e)) => {
                error!("Failed to send request to {}: {:?}", provider, e);
                Err(ProviderError::Transport {
                    provider,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                error!(
                    "Request to {} timed out after {}s",
                    provider, REQUEST_TIMEOUT_SECS
                );
                Err(ProviderError::Timeout(provider))
            }
        }
    }
}

/// Reads the SSE body on a background task and forwards decoded events.
pub(crate) fn spawn_stream_reader<D: StreamDecoder>(
    provider: &'static str,
    response: Response<HyperBody>,
    mut decoder: D,
) -> mpsc::Receiver<ProviderEvent> {
    let (tx, rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut body_stream = response.into_body();
        let mut buffer = String::new();
        let mut pending: Vec<u8> = Vec::new();

        'read: loop {
            match timeout(
                Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS),
                body_stream.next(),
            )
            .await
            {
                Ok(Some(Ok(bytes))) => {
                    pending.extend_from_slice(bytes.as_ref());
                    drain_utf8(&mut pending, &mut buffer);

                    while let Some(frame) = extract_sse_frame(&mut buffer) {
                        let terminal = decoder.is_terminal(&frame);
                        match decoder.decode(&frame) {
                            Ok(events) => {
                                for event in events {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                error!("{} sent an unreadable frame: {}", provider, e);
                                let _ = tx.send(ProviderEvent::Error(e)).await;
                                return;
                            }
                        }
                        if terminal {
                            break 'read;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    error!("Stream error from {}: {:?}", provider, e);
                    let _ = tx.send(ProviderEvent::Error(e.to_string())).await;
                    return;
                }
                Ok(None) => break,
                Err(_) => {
                    error!("Stream chunk timeout after {}s", STREAM_CHUNK_TIMEOUT_SECS);
                    let _ = tx
                        .send(ProviderEvent::Error("Stream timeout".to_string()))
                        .await;
                    return;
                }
            }
        }

        for event in decoder.finish() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    rx
}

/// Configured provider adapters, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<Provider, Arc<dyn ChatProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig, transport: HttpTransport) -> Self {
        let mut set = Self::new();
        if let Some(key) = &config.openai_api_key {
            set.insert(
                Provider::OpenAi,
                Arc::new(openai::OpenAiCompatible::openai(key.clone(), transport.clone())),
            );
        }
        if let Some(azure) = &config.azure_openai {
            set.insert(
                Provider::AzureOpenAi,
                Arc::new(openai::OpenAiCompatible::azure(azure.clone(), transport.clone())),
            );
        }
        if let Some(inference) = &config.azure_inference {
            set.insert(
                Provider::AzureInference,
                Arc::new(openai::OpenAiCompatible::azure_inference(
                    inference.clone(),
                    transport.clone(),
                )),
            );
        }
        if let Some(key) = &config.anthropic_api_key {
            set.insert(
                Provider::Anthropic,
                Arc::new(anthropic::AnthropicProvider::new(key.clone(), transport.clone())),
            );
        }
        if let Some(key) = &config.google_api_key {
            set.insert(
                Provider::Google,
                Arc::new(google::GoogleProvider::new(key.clone(), transport)),
            );
        }
        set
    }

    pub fn insert(&mut self, provider: Provider, adapter: Arc<dyn ChatProvider>) {
        self.providers.insert(provider, adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(&provider).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_completion_sums_usage() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ProviderEvent::TextDelta("Hel".to_string())).await.unwrap();
        tx.send(ProviderEvent::TextDelta("lo".to_string())).await.unwrap();
        tx.send(ProviderEvent::Usage(TokenUsage::new(5, 2))).await.unwrap();
        tx.send(ProviderEvent::Finished(FinishReason::Stop)).await.unwrap();
        drop(tx);

        let completion = collect_completion(&mut rx).await.unwrap();
        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.usage, Some(TokenUsage::new(5, 2)));
    }

    #[tokio::test]
    async fn test_collect_completion_surfaces_errors() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ProviderEvent::Error("overloaded".to_string())).await.unwrap();
        drop(tx);
        assert!(matches!(
            collect_completion(&mut rx).await,
            Err(ProviderError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_reader_keeps_characters_split_across_chunks() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"বাংলা\"}}]}\n\ndata: [DONE]\n\n";
        let split = frame.find('ব').unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(frame.as_bytes()[..split].to_vec()),
            Ok(frame.as_bytes()[split..].to_vec()),
        ];
        let response = Response::new(HyperBody::wrap_stream(futures::stream::iter(chunks)));

        let mut rx = spawn_stream_reader("openai", response, openai::OpenAiDecoder::default());
        let completion = collect_completion(&mut rx).await.unwrap();
        assert_eq!(completion.text, "বাংলা");
    }

    #[test]
    fn test_retry_classification() {
        let status = |status| ProviderError::Status {
            provider: "openai",
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(ProviderError::Timeout("anthropic").is_retryable());
    }
}
