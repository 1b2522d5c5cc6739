use super::{str_arg, Tool, ToolContext, ToolError, ToolResult, Writer};
use crate::model_registry::{TOOL_CREATE_DOCUMENT, TOOL_REQUEST_SUGGESTIONS, TOOL_UPDATE_DOCUMENT};
use crate::models::documents::{Document, DocumentKind, NewDocument, NewSuggestion};
use crate::pricing::TokenUsage;
use crate::providers::{PromptMessage, ProviderRequest};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

const TEXT_PROMPT: &str =
    "Write about the given topic. Markdown is supported. Use headings wherever appropriate.";
const CODE_PROMPT: &str = "You are a code generator that creates self-contained, executable code snippets. \
Include helpful comments, keep snippets concise, and avoid external dependencies. \
Return only the code.";
const UPDATE_PROMPT: &str = "Improve the following contents of the document based on the given prompt.";
const SUGGESTIONS_PROMPT: &str = "You are a writing assistant. Given a piece of writing, offer suggestions \
to improve it and describe each change. Edits must contain full sentences instead of single words. \
Give at most 5 suggestions. Reply only with a JSON array of objects with the keys \
\"originalSentence\", \"suggestedSentence\" and \"description\".";
const MAX_SUGGESTIONS: usize = 5;

/// Runs the writer model once and returns its text and usage.
async fn write_with(
    writer: &Writer,
    system: String,
    prompt: String,
) -> Result<(String, TokenUsage), ToolError> {
    let request = ProviderRequest {
        model: writer.model.clone(),
        system: Some(system),
        messages: vec![PromptMessage::user_text(prompt)],
        tools: Vec::new(),
        max_output_tokens: None,
    };
    let completion = writer
        .provider
        .complete(request)
        .await
        .map_err(|e| ToolError::Writer(e.to_string()))?;
    Ok((completion.text, completion.usage.unwrap_or_default()))
}

fn parse_kind(args: &Value) -> Result<DocumentKind, ToolError> {
    match args.get("kind").and_then(|k| k.as_str()).unwrap_or("text") {
        "text" => Ok(DocumentKind::Text),
        "code" => Ok(DocumentKind::Code),
        other => Err(ToolError::InvalidArgs(format!("unknown kind `{}`", other))),
    }
}

fn uuid_arg(args: &Value, name: &str) -> Result<Uuid, ToolError> {
    let raw = str_arg(args, name)?;
    Uuid::parse_str(raw).map_err(|_| ToolError::InvalidArgs(format!("`{}` is not a valid id", name)))
}

fn latest_document(ctx: &ToolContext, id: Uuid) -> Result<Document, ToolError> {
    match ctx.db.get_document_by_id(id)? {
        Some(document) if document.user_id == ctx.user_id => Ok(document),
        _ => Err(ToolError::InvalidArgs(format!("document {} not found", id))),
    }
}

pub struct CreateDocumentTool;

impl CreateDocumentTool {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult, ToolError> {
        let title = str_arg(args, "title")?;
        let kind = parse_kind(args)?;
        let system = match kind {
            DocumentKind::Text => TEXT_PROMPT,
            DocumentKind::Code => CODE_PROMPT,
        };
        let (content, usage) = write_with(ctx.writer()?, system.to_string(), title.to_string()).await?;

        let document = ctx.db.save_document(NewDocument {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            title: title.to_string(),
            content: Some(content),
            kind: kind.as_str().to_string(),
            user_id: ctx.user_id,
        })?;
        info!("Created document {} for user {}", document.id, ctx.user_id);

        Ok(ToolResult::success(json!({
            "id": document.id,
            "title": document.title,
            "kind": document.kind,
            "content": "A document was created and is now visible to the user.",
        }))
        .with_usage(usage))
    }
}

#[async_trait]
impl Tool for CreateDocumentTool {
    fn name(&self) -> &str {
        TOOL_CREATE_DOCUMENT
    }

    fn description(&self) -> &str {
        "Create a document for writing or code. The content is generated from the title."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "kind": {"type": "string", "enum": ["text", "code"]}
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(ctx, &args).await.into()
    }
}

pub struct UpdateDocumentTool;

impl UpdateDocumentTool {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult, ToolError> {
        let id = uuid_arg(args, "id")?;
        let description = str_arg(args, "description")?;
        let current = latest_document(ctx, id)?;

        let system = format!(
            "{}\n\n{}",
            UPDATE_PROMPT,
            current.content.as_deref().unwrap_or_default()
        );
        let (content, usage) = write_with(ctx.writer()?, system, description.to_string()).await?;

        let document = ctx.db.save_document(NewDocument {
            id,
            created_at: Utc::now(),
            title: current.title,
            content: Some(content),
            kind: current.kind,
            user_id: ctx.user_id,
        })?;

        Ok(ToolResult::success(json!({
            "id": document.id,
            "title": document.title,
            "kind": document.kind,
            "content": "The document has been updated successfully.",
        }))
        .with_usage(usage))
    }
}

#[async_trait]
impl Tool for UpdateDocumentTool {
    fn name(&self) -> &str {
        TOOL_UPDATE_DOCUMENT
    }

    fn description(&self) -> &str {
        "Update a document with the given description of the changes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "The id of the document to update"},
                "description": {"type": "string", "description": "The changes to make"}
            },
            "required": ["id", "description"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(ctx, &args).await.into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftSuggestion {
    original_sentence: String,
    suggested_sentence: String,
    #[serde(default)]
    description: Option<String>,
}

/// Pulls the JSON array out of a model reply, tolerating code fences around it.
fn parse_suggestions(text: &str) -> Vec<DraftSuggestion> {
    let start = text.find('[');
    let end = text.rfind(']');
    let slice = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Vec::new(),
    };
    match serde_json::from_str::<Vec<DraftSuggestion>>(slice) {
        Ok(mut suggestions) => {
            suggestions.truncate(MAX_SUGGESTIONS);
            suggestions
        }
        Err(e) => {
            warn!("Could not parse suggestions: {}", e);
            Vec::new()
        }
    }
}

pub struct RequestSuggestionsTool;

impl RequestSuggestionsTool {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<ToolResult, ToolError> {
        let id = uuid_arg(args, "documentId")?;
        let document = latest_document(ctx, id)?;
        let content = document.content.clone().unwrap_or_default();

        let (reply, usage) =
            write_with(ctx.writer()?, SUGGESTIONS_PROMPT.to_string(), content).await?;
        let drafts = parse_suggestions(&reply);

        let suggestions: Vec<NewSuggestion> = drafts
            .into_iter()
            .map(|d| NewSuggestion {
                id: Uuid::new_v4(),
                document_id: document.id,
                document_created_at: document.created_at,
                original_text: d.original_sentence,
                suggested_text: d.suggested_sentence,
                description: d.description,
                is_resolved: false,
                user_id: ctx.user_id,
            })
            .collect();
        let count = suggestions.len();
        if count > 0 {
            ctx.db.save_suggestions(suggestions)?;
        }

        Ok(ToolResult::success(json!({
            "id": document.id,
            "title": document.title,
            "kind": document.kind,
            "message": format!("{} suggestions have been added to the document", count),
        }))
        .with_usage(usage))
    }
}

#[async_trait]
impl Tool for RequestSuggestionsTool {
    fn name(&self) -> &str {
        TOOL_REQUEST_SUGGESTIONS
    }

    fn description(&self) -> &str {
        "Request suggestions for a document"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "documentId": {"type": "string", "description": "The id of the document to request edits for"}
            },
            "required": ["documentId"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(ctx, &args).await.into()
    }
}
