use super::polling::{poll_until, PollPolicy, PollStatus};
use super::{check_status, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_GENERATE_SLIDES;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const SLIDESPEAK_BASE_URL: &str = "https://api.slidespeak.com/api/v1";
const POLL: PollPolicy = PollPolicy::new(15, Duration::from_secs(4));
const DEFAULT_LENGTH: u64 = 6;
const MAX_LENGTH: u64 = 20;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    task_status: String,
    #[serde(default)]
    task_result: Option<Value>,
}

impl TaskStatus {
    fn status(self) -> PollStatus<String> {
        match self.task_status.as_str() {
            "SUCCESS" => match self
                .task_result
                .as_ref()
                .and_then(|r| r.get("url"))
                .and_then(|u| u.as_str())
            {
                Some(url) => PollStatus::Ready(url.to_string()),
                None => PollStatus::Failed("finished without a download url".to_string()),
            },
            "FAILURE" => PollStatus::Failed(
                self.task_result
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "generation failed".to_string()),
            ),
            _ => PollStatus::Pending,
        }
    }
}

/// Presentation generation through SlideSpeak.
pub struct SlidesTool {
    client: reqwest::Client,
    api_key: String,
    poll: PollPolicy,
}

impl SlidesTool {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            poll: POLL,
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let topic = str_arg(args, "prompt")?;
        let length = args
            .get("length")
            .and_then(|l| l.as_u64())
            .unwrap_or(DEFAULT_LENGTH)
            .clamp(1, MAX_LENGTH);

        let response = self
            .client
            .post(format!("{}/presentation/generate", SLIDESPEAK_BASE_URL))
            .header("X-API-Key", &self.api_key)
            .json(&json!({
                "plain_text": topic,
                "length": length,
                "template": "default",
            }))
            .send()
            .await?;
        let generated: GenerateResponse = check_status(response).await?.json().await?;
        debug!("SlideSpeak task {} started", generated.task_id);

        let url = poll_until(self.poll, || self.check_task(&generated.task_id)).await?;
        Ok(ToolResult::success(json!({
            "presentation_url": url,
            "slides": length,
        })))
    }

    async fn check_task(&self, task_id: &str) -> Result<PollStatus<String>, ToolError> {
        let response = self
            .client
            .get(format!("{}/task_status/{}", SLIDESPEAK_BASE_URL, task_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let status: TaskStatus = check_status(response).await?.json().await?;
        Ok(status.status())
    }
}

impl std::fmt::Debug for SlidesTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidesTool")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Tool for SlidesTool {
    fn name(&self) -> &str {
        TOOL_GENERATE_SLIDES
    }

    fn description(&self) -> &str {
        "Generate a PowerPoint presentation about a topic"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Topic and content of the presentation"},
                "length": {"type": "integer", "minimum": 1, "maximum": MAX_LENGTH}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }
}
