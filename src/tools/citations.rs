use super::{check_status, str_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_CITATIONS;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const CROSSREF_URL: &str = "https://api.crossref.org/works";
const ROWS: &str = "5";

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(default)]
    items: Vec<CrossrefWork>,
}

#[derive(Debug, Deserialize)]
struct CrossrefWork {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    author: Vec<CrossrefAuthor>,
    #[serde(rename = "container-title", default)]
    container_title: Vec<String>,
    issued: Option<CrossrefDate>,
}

#[derive(Debug, Deserialize)]
struct CrossrefAuthor {
    given: Option<String>,
    family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CrossrefDate {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i64>>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Citation {
    pub title: String,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub year: Option<i64>,
    pub doi: Option<String>,
    pub url: Option<String>,
}

impl From<CrossrefWork> for Citation {
    fn from(work: CrossrefWork) -> Self {
        let authors = work
            .author
            .into_iter()
            .filter_map(|a| match (a.given, a.family) {
                (Some(g), Some(f)) => Some(format!("{} {}", g, f)),
                (None, Some(f)) => Some(f),
                (Some(g), None) => Some(g),
                (None, None) => None,
            })
            .collect();
        let year = work
            .issued
            .and_then(|d| d.date_parts.into_iter().next())
            .and_then(|parts| parts.into_iter().next().flatten());
        Citation {
            title: work.title.into_iter().next().unwrap_or_default(),
            authors,
            journal: work.container_title.into_iter().next(),
            year,
            url: work.doi.as_ref().map(|d| format!("https://doi.org/{}", d)),
            doi: work.doi,
        }
    }
}

/// Scholarly references from Crossref. No key needed.
pub struct CitationTool {
    client: reqwest::Client,
}

impl CitationTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let query = str_arg(args, "prompt")?;
        let response = self
            .client
            .get(CROSSREF_URL)
            .query(&[("query", query), ("rows", ROWS)])
            .send()
            .await?;
        let found: CrossrefResponse = check_status(response).await?.json().await?;
        let citations: Vec<Citation> = found
            .message
            .items
            .into_iter()
            .map(Citation::from)
            .filter(|c| !c.title.is_empty())
            .collect();

        Ok(ToolResult::success(json!({ "citations": citations })))
    }
}

#[async_trait]
impl Tool for CitationTool {
    fn name(&self) -> &str {
        TOOL_CITATIONS
    }

    fn description(&self) -> &str {
        "Find scholarly references for a topic or claim"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Topic or claim to find sources for"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }
}
