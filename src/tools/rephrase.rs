use super::{check_status, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_REPHRASE;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_REPHRASY_URL: &str = "https://v1-humanizer.rephrasy.ai/api";
const MAX_INPUT_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
struct RephraseResponse {
    output: String,
}

/// Rewrites text to read naturally, through Rephrasy.
pub struct RephraseTool {
    client: reqwest::Client,
    api_key: String,
    url: String,
}

impl RephraseTool {
    pub fn new(client: reqwest::Client, api_key: String, url: Option<String>) -> Self {
        Self {
            client,
            api_key,
            url: url.unwrap_or_else(|| DEFAULT_REPHRASY_URL.to_string()),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let text = str_arg(args, "prompt")?;
        if text.chars().count() > MAX_INPUT_CHARS {
            return Err(ToolError::InvalidArgs(format!(
                "text is longer than {} characters",
                MAX_INPUT_CHARS
            )));
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "text": text, "model": "undetectable" }))
            .send()
            .await?;
        let rephrased: RephraseResponse = check_status(response).await?.json().await?;
        Ok(ToolResult::success(json!({ "text": rephrased.output })))
    }
}

impl std::fmt::Debug for RephraseTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RephraseTool")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .finish()
    }
}

#[async_trait]
impl Tool for RephraseTool {
    fn name(&self) -> &str {
        TOOL_REPHRASE
    }

    fn description(&self) -> &str {
        "Rephrase text so it reads as natural human writing"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "The text to rephrase"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }
}
