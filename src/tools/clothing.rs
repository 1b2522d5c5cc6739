use super::{check_status, image_urls, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_CLOTHING_SWAP;
use crate::models::messages::ContentPart;
use async_trait::async_trait;
use serde_json::{json, Value};

const RESULT_POINTERS: [&str; 3] = ["/image_url", "/result/image_url", "/data/image_url"];

/// Virtual try-on through a RapidAPI clothing-swap host.
pub struct ClothingSwapTool {
    client: reqwest::Client,
    api_key: String,
    host: String,
}

impl ClothingSwapTool {
    pub fn new(client: reqwest::Client, api_key: String, host: String) -> Self {
        Self {
            client,
            api_key,
            host,
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let person = str_arg(args, "person_image_url")?;
        let clothing = str_arg(args, "clothing_image_url")?;

        let response = self
            .client
            .post(format!("https://{}/try-on-url", self.host))
            .header("x-rapidapi-key", &self.api_key)
            .header("x-rapidapi-host", &self.host)
            .form(&[
                ("avatar_image_url", person),
                ("clothing_image_url", clothing),
            ])
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        let url = result_url(&body).ok_or_else(|| {
            ToolError::UnexpectedResponse(format!("no image in try-on response: {}", body))
        })?;

        Ok(ToolResult::success(json!({ "image_url": url })).with_images(1))
    }
}

fn result_url(body: &Value) -> Option<String> {
    RESULT_POINTERS
        .iter()
        .find_map(|p| body.pointer(p).and_then(|v| v.as_str()))
        .map(str::to_string)
}

impl std::fmt::Debug for ClothingSwapTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClothingSwapTool")
            .field("api_key", &"[REDACTED]")
            .field("host", &self.host)
            .finish()
    }
}

#[async_trait]
impl Tool for ClothingSwapTool {
    fn name(&self) -> &str {
        TOOL_CLOTHING_SWAP
    }

    fn description(&self) -> &str {
        "Dress the person in the first photo with the clothing from the second photo"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "person_image_url": {"type": "string"},
                "clothing_image_url": {"type": "string"}
            },
            "required": ["person_image_url", "clothing_image_url"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }

    fn bot_args(&self, _prompt: &str, attachments: &[ContentPart]) -> Value {
        let mut images = image_urls(attachments).into_iter();
        json!({
            "person_image_url": images.next(),
            "clothing_image_url": images.next(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_url_accepts_nested_shapes() {
        assert_eq!(
            result_url(&json!({"result": {"image_url": "https://r/1.png"}})).as_deref(),
            Some("https://r/1.png")
        );
        assert_eq!(
            result_url(&json!({"image_url": "https://r/2.png"})).as_deref(),
            Some("https://r/2.png")
        );
        assert_eq!(result_url(&json!({"status": "error"})), None);
    }

    #[test]
    fn test_bot_args_take_two_images_in_order() {
        let tool = ClothingSwapTool::new(
            reqwest::Client::new(),
            "k".to_string(),
            "try-on.p.rapidapi.com".to_string(),
        );
        let image = |url: &str| ContentPart::Image {
            url: url.to_string(),
            media_type: None,
        };
        let args = tool.bot_args("", &[image("https://u/me.jpg"), image("https://u/shirt.jpg")]);
        assert_eq!(args["person_image_url"], "https://u/me.jpg");
        assert_eq!(args["clothing_image_url"], "https://u/shirt.jpg");

        let args = tool.bot_args("", &[image("https://u/me.jpg")]);
        assert!(str_arg(&args, "clothing_image_url").is_err());
    }
}
