use super::{check_status, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_GENERATE_IMAGE;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const IMAGES_URL: &str = "https://api.openai.com/v1/images/generations";
const IMAGE_MODEL: &str = "dall-e-3";
const SIZES: [&str; 3] = ["1024x1024", "1792x1024", "1024x1792"];

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    url: Option<String>,
    revised_prompt: Option<String>,
}

/// Text-to-image through the OpenAI images endpoint.
pub struct ImageTool {
    client: reqwest::Client,
    api_key: String,
}

impl ImageTool {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let prompt = str_arg(args, "prompt")?;
        let size = pick_size(args.get("size").and_then(|s| s.as_str()));

        let response = self
            .client
            .post(IMAGES_URL)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": IMAGE_MODEL,
                "prompt": prompt,
                "n": 1,
                "size": size,
            }))
            .send()
            .await?;
        let images: ImagesResponse = check_status(response).await?.json().await?;
        let image = images
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::UnexpectedResponse("no image returned".to_string()))?;
        let url = image
            .url
            .ok_or_else(|| ToolError::UnexpectedResponse("image without url".to_string()))?;

        Ok(ToolResult::success(json!({
            "image_url": url,
            "revised_prompt": image.revised_prompt,
        }))
        .with_images(1))
    }
}

impl std::fmt::Debug for ImageTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTool")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

fn pick_size(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|r| SIZES.iter().find(|s| **s == r).copied())
        .unwrap_or(SIZES[0])
}

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        TOOL_GENERATE_IMAGE
    }

    fn description(&self) -> &str {
        "Generate an image from a text description"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "What the image should show"},
                "size": {"type": "string", "enum": SIZES}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }
}
