use super::{check_status, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_YOUTUBE;
use crate::providers::{PromptMessage, ProviderRequest};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const SUPADATA_TRANSCRIPT_URL: &str = "https://api.supadata.ai/v1/youtube/transcript";
const MAX_TRANSCRIPT_CHARS: usize = 48_000;
const SUMMARY_PROMPT: &str = "Summarize the following YouTube video transcript. \
Start with a one-sentence overview, then list the key points. \
Answer in the language of the user's request.";

lazy_static! {
    static ref VIDEO_ID: Regex = Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:[^#\s]*&)?v=|shorts/|embed/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})"
    )
    .expect("video id regex is valid");
}

/// Finds the 11 character video id in any common YouTube link form.
pub fn extract_video_id(text: &str) -> Option<&str> {
    VIDEO_ID
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Deserialize)]
struct Transcript {
    content: String,
    #[serde(default)]
    lang: Option<String>,
}

/// Fetches a video transcript from Supadata and summarizes it with the writer model.
pub struct YoutubeSummaryTool {
    client: reqwest::Client,
    api_key: String,
}

impl YoutubeSummaryTool {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    async fn transcript(&self, video_id: &str) -> Result<Transcript, ToolError> {
        let response = self
            .client
            .get(SUPADATA_TRANSCRIPT_URL)
            .header("x-api-key", &self.api_key)
            .query(&[("videoId", video_id), ("text", "true")])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult, ToolError> {
        let request_text = str_arg(args, "prompt")?;
        let video_id = extract_video_id(request_text).ok_or_else(|| {
            ToolError::InvalidArgs("no YouTube link found in the message".to_string())
        })?;
        let writer = ctx.writer()?;

        let transcript = self.transcript(video_id).await?;
        debug!(
            "Transcript for {} has {} chars ({:?})",
            video_id,
            transcript.content.len(),
            transcript.lang
        );
        let content: String = transcript.content.chars().take(MAX_TRANSCRIPT_CHARS).collect();

        let completion = writer
            .provider
            .complete(ProviderRequest {
                model: writer.model.clone(),
                system: Some(SUMMARY_PROMPT.to_string()),
                messages: vec![PromptMessage::user_text(format!(
                    "Request: {}\n\nTranscript:\n{}",
                    request_text, content
                ))],
                tools: Vec::new(),
                max_output_tokens: None,
            })
            .await
            .map_err(|e| ToolError::Writer(e.to_string()))?;

        Ok(ToolResult::success(json!({
            "video_id": video_id,
            "summary": completion.text,
        }))
        .with_usage(completion.usage.unwrap_or_default()))
    }
}

impl std::fmt::Debug for YoutubeSummaryTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoutubeSummaryTool")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Tool for YoutubeSummaryTool {
    fn name(&self) -> &str {
        TOOL_YOUTUBE
    }

    fn description(&self) -> &str {
        "Summarize a YouTube video from its link"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Message containing the YouTube link"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(ctx, &args).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryDb;
    use crate::tools::test_support::context;
    use std::sync::Arc;

    #[test]
    fn test_extracts_ids_from_link_forms() {
        for link in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "summarize https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ please",
            "https://youtu.be/dQw4w9WgXcQ?t=42",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            assert_eq!(extract_video_id(link), Some("dQw4w9WgXcQ"), "{}", link);
        }
        assert_eq!(extract_video_id("https://vimeo.com/123456"), None);
        assert_eq!(extract_video_id("https://youtu.be/short"), None);
    }

    #[tokio::test]
    async fn test_message_without_link_fails_before_any_request() {
        let tool = YoutubeSummaryTool::new(reqwest::Client::new(), "k".to_string());
        let ctx = context(Arc::new(InMemoryDb::new()), None);
        let result = tool
            .execute(&ctx, json!({"prompt": "what is this video about?"}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no YouTube link"));
    }
}
