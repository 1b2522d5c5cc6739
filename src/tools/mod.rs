use crate::config::AppConfig;
use crate::db::{DBConnection, DBError};
use crate::models::messages::ContentPart;
use crate::pricing::TokenUsage;
use crate::providers::{ChatProvider, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod anime;
pub mod citations;
pub mod clothing;
pub mod documents;
pub mod image;
pub mod polling;
pub mod rephrase;
pub mod slides;
pub mod weather;
pub mod youtube;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Task did not finish after {0} attempts")]
    PollExhausted(u32),
    #[error("Task failed: {0}")]
    TaskFailed(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("No writer model available")]
    NoWriter,
    #[error("Writer model failed: {0}")]
    Writer(String),
    #[error("Database error: {0}")]
    Database(#[from] DBError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    /// Images produced, billed at the model's image rate.
    pub images: i64,
    /// Tokens spent by models the tool called itself.
    pub usage: TokenUsage,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            images: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        let msg = error.into();
        Self {
            success: false,
            output: json!({ "error": msg }),
            error: Some(msg),
            images: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_images(mut self, images: i64) -> Self {
        self.images = images;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

impl From<Result<ToolResult, ToolError>> for ToolResult {
    fn from(result: Result<ToolResult, ToolError>) -> Self {
        match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Tool failed: {}", e);
                ToolResult::error(e.to_string())
            }
        }
    }
}

/// Model a tool may call to write or summarize text.
#[derive(Clone)]
pub struct Writer {
    pub provider: Arc<dyn ChatProvider>,
    pub model: String,
}

#[derive(Clone)]
pub struct ToolContext {
    pub user_id: Uuid,
    pub chat_id: Uuid,
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub writer: Option<Writer>,
}

impl ToolContext {
    pub fn writer(&self) -> Result<&Writer, ToolError> {
        self.writer.as_ref().ok_or(ToolError::NoWriter)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult;

    /// Arguments used when the tool runs directly on a user message.
    fn bot_args(&self, prompt: &str, _attachments: &[ContentPart]) -> Value {
        json!({ "prompt": prompt })
    }
}

/// Registry of available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ToolError> {
        let http = http_client()?;
        let keys = &config.tools;
        let mut registry = Self::new();

        registry.register(Arc::new(weather::WeatherTool::new(http.clone())));
        registry.register(Arc::new(citations::CitationTool::new(http.clone())));
        registry.register(Arc::new(documents::CreateDocumentTool));
        registry.register(Arc::new(documents::UpdateDocumentTool));
        registry.register(Arc::new(documents::RequestSuggestionsTool));

        if let Some(key) = &config.openai_api_key {
            registry.register(Arc::new(image::ImageTool::new(http.clone(), key.clone())));
        }
        if let Some(key) = &keys.ailabtool_api_key {
            registry.register(Arc::new(anime::AnimeStyleTool::new(http.clone(), key.clone())));
        }
        if let (Some(key), Some(host)) = (&keys.rapidapi_key, &keys.rapidapi_clothing_host) {
            registry.register(Arc::new(clothing::ClothingSwapTool::new(
                http.clone(),
                key.clone(),
                host.clone(),
            )));
        }
        if let Some(key) = &keys.slide_speak_key {
            registry.register(Arc::new(slides::SlidesTool::new(http.clone(), key.clone())));
        }
        if let Some(key) = &keys.rephrasy_api_key {
            registry.register(Arc::new(rephrase::RephraseTool::new(
                http.clone(),
                key.clone(),
                keys.rephrasy_url.clone(),
            )));
        }
        if let Some(key) = &keys.supadata_api_key {
            registry.register(Arc::new(youtube::YoutubeSummaryTool::new(http, key.clone())));
        }

        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Specs for the named tools that are registered; unknown names are skipped.
    pub fn specs(&self, names: &[&str]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(20)
        .build()
        .map_err(ToolError::Request)
}

/// Turns a non-2xx response into `ToolError::Api`.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ToolError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ToolError::Api {
        status: status.as_u16(),
        message,
    })
}

pub(crate) fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing `{}`", name)))
}

pub(crate) fn f64_arg(args: &Value, name: &str) -> Result<f64, ToolError> {
    args.get(name)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing `{}`", name)))
}

/// URLs of the image attachments, in order.
pub(crate) fn image_urls(attachments: &[ContentPart]) -> Vec<String> {
    attachments
        .iter()
        .filter_map(|p| match p {
            ContentPart::Image { url, .. } => Some(url.clone()),
            _ => None,
        })
        .collect()
}
