use super::polling::{poll_until, PollPolicy, PollStatus};
use super::{check_status, image_urls, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_ANIME_STYLE;
use crate::models::messages::ContentPart;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const AILAB_BASE_URL: &str = "https://www.ailabapi.com/api";
const POLL: PollPolicy = PollPolicy::new(20, Duration::from_secs(3));
const STYLES: [&str; 4] = ["anime", "3d", "handdrawn", "sketch"];

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: Option<String>,
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    task_status: i64,
    data: Option<TaskData>,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    result_url: Option<String>,
}

const TASK_DONE: i64 = 2;

impl TaskResponse {
    fn status(self) -> PollStatus<String> {
        if self.error_code != 0 {
            return PollStatus::Failed(self.error_msg.unwrap_or_else(|| "task failed".to_string()));
        }
        if self.task_status != TASK_DONE {
            return PollStatus::Pending;
        }
        match self.data.and_then(|d| d.result_url) {
            Some(url) => PollStatus::Ready(url),
            None => PollStatus::Failed("finished without a result".to_string()),
        }
    }
}

/// Redraws a photo in an anime style through AILabTools.
pub struct AnimeStyleTool {
    client: reqwest::Client,
    api_key: String,
    poll: PollPolicy,
}

impl AnimeStyleTool {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            poll: POLL,
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let image_url = str_arg(args, "image_url")?;
        let style = args
            .get("style")
            .and_then(|s| s.as_str())
            .and_then(|s| STYLES.iter().position(|known| *known == s))
            .unwrap_or(0);

        let image = self.client.get(image_url).send().await?;
        let bytes = check_status(image).await?.bytes().await?;
        let form = Form::new()
            .text("task_type", "async")
            .text("index", style.to_string())
            .part("image", Part::bytes(bytes.to_vec()).file_name("image.jpg"));

        let response = self
            .client
            .post(format!("{}/image/effects/ai-anime-generator", AILAB_BASE_URL))
            .header("ailabapi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await?;
        let submitted: SubmitResponse = check_status(response).await?.json().await?;
        if submitted.error_code != 0 {
            return Err(ToolError::TaskFailed(
                submitted.error_msg.unwrap_or_else(|| "submit rejected".to_string()),
            ));
        }
        let task_id = submitted
            .task_id
            .ok_or_else(|| ToolError::UnexpectedResponse("missing task_id".to_string()))?;
        debug!("Anime task {} submitted", task_id);

        let url = poll_until(self.poll, || self.check_task(&task_id)).await?;
        Ok(ToolResult::success(json!({ "image_url": url })).with_images(1))
    }

    async fn check_task(&self, task_id: &str) -> Result<PollStatus<String>, ToolError> {
        let response = self
            .client
            .get(format!("{}/common/query-async-task-result", AILAB_BASE_URL))
            .header("ailabapi-api-key", &self.api_key)
            .query(&[("task_id", task_id)])
            .send()
            .await?;
        let task: TaskResponse = check_status(response).await?.json().await?;
        Ok(task.status())
    }
}

impl std::fmt::Debug for AnimeStyleTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimeStyleTool")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Tool for AnimeStyleTool {
    fn name(&self) -> &str {
        TOOL_ANIME_STYLE
    }

    fn description(&self) -> &str {
        "Redraw a photo in an anime style"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "image_url": {"type": "string"},
                "style": {"type": "string", "enum": STYLES}
            },
            "required": ["image_url"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }

    fn bot_args(&self, prompt: &str, attachments: &[ContentPart]) -> Value {
        let style = STYLES
            .iter()
            .find(|s| prompt.to_lowercase().contains(*s))
            .copied()
            .unwrap_or(STYLES[0]);
        json!({
            "image_url": image_urls(attachments).into_iter().next(),
            "style": style,
        })
    }
}
