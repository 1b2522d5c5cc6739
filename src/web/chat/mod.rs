use crate::db::DBError;
use crate::model_registry::{Capabilities, ModelDescriptor};
use crate::models::chats::{Chat, NewChat, Visibility};
use crate::models::messages::{text_of, ContentPart, Message, NewMessage, Role};
use crate::models::users::User;
use crate::providers::PromptMessage;
use crate::web::auth::validate_session;
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub mod dispatcher;
pub mod events;
pub mod sanitize;

use dispatcher::{generate_title, refund, Strategy, Turn};
use events::TurnEvent;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: Uuid,
    pub messages: Vec<IncomingMessage>,
    pub selected_chat_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "experimental_attachments")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatIdQuery {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChatRequest {
    pub id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Deserialize)]
pub struct TrailingRequest {
    #[serde(alias = "messageId")]
    pub message_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ChatWithMessages {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/chat",
            post(chat_turn)
                .delete(delete_chat)
                .patch(update_chat)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/chat/trailing",
            post(delete_trailing_messages)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/chat/:id",
            get(get_chat).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .with_state(app_state)
}

/// Content parts of the incoming user message, checked against what the model accepts.
fn user_parts(message: &IncomingMessage, caps: &Capabilities) -> Result<Vec<ContentPart>, ApiError> {
    let mut parts = Vec::with_capacity(message.attachments.len() + 1);
    if !message.content.trim().is_empty() {
        parts.push(ContentPart::text(message.content.clone()));
    }

    for attachment in &message.attachments {
        let content_type = attachment.content_type.clone();
        let is_image = content_type
            .as_deref()
            .map(|t| t.starts_with("image/"))
            .unwrap_or(false);
        if is_image {
            if !caps.accepts_images {
                debug!("Model does not accept image attachments");
                return Err(ApiError::BadRequest);
            }
            parts.push(ContentPart::Image {
                url: attachment.url.clone(),
                media_type: content_type,
            });
        } else {
            if !caps.accepts_files {
                debug!("Model does not accept file attachments");
                return Err(ApiError::BadRequest);
            }
            parts.push(ContentPart::File {
                url: attachment.url.clone(),
                name: attachment.name.clone(),
                media_type: content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            });
        }
    }

    if parts.is_empty() {
        return Err(ApiError::BadRequest);
    }
    Ok(parts)
}

/// Chat the caller may act on. Deleted chats are treated as missing.
pub(crate) fn owned_chat(state: &AppState, user_id: Uuid, chat_id: Uuid) -> Result<Chat, ApiError> {
    let chat = state
        .db
        .get_chat_by_id(chat_id)?
        .filter(|c| !c.is_deleted)
        .ok_or(ApiError::NotFound)?;
    if !chat.is_owned_by(user_id) {
        error!("User {} does not own chat {}", user_id, chat_id);
        return Err(ApiError::Unauthorized);
    }
    Ok(chat)
}

/// Flat bot cost taken up front; zero for chat models.
fn reserve(state: &AppState, user: &User, model: &ModelDescriptor) -> Result<BigDecimal, ApiError> {
    if !model.is_bot() {
        return Ok(BigDecimal::from(0));
    }
    let amount = model.pricing.api_cost_in_cents.clone();
    match state.db.try_debit_balance(user.id, &amount)? {
        Some(balance) => {
            debug!("Reserved {} cents for {}, balance {}", amount, model.id, balance);
            Ok(amount)
        }
        None => Err(ApiError::LimitExceeded),
    }
}

/// Creates the chat when needed, stores the user message and returns the prompt history.
async fn store_user_message(
    state: &AppState,
    user: &User,
    chat_id: Uuid,
    existing: Option<Chat>,
    message_id: Uuid,
    parts: &[ContentPart],
    created_at: DateTime<Utc>,
) -> Result<Vec<PromptMessage>, ApiError> {
    if existing.is_none() {
        let title = generate_title(state, &text_of(parts)).await;
        state
            .db
            .create_chat(NewChat::new(chat_id, user.id, title, Visibility::Private))?;
        info!("Created chat {} for user {}", chat_id, user.id);
    }

    let mut prompt = sanitize::prompt_history(&state.db.get_messages_by_chat_id(chat_id)?);

    let message = NewMessage::unbilled(message_id, chat_id, Role::User, parts, None, created_at)
        .map_err(DBError::from)?;
    state.db.save_messages(vec![message])?;

    prompt.push(PromptMessage {
        role: Role::User,
        parts: parts.to_vec(),
    });
    Ok(prompt)
}

pub async fn chat_turn(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    debug!("Entering chat_turn");

    if !user.has_spendable_balance() {
        info!("User {} has no balance left", user.id);
        return Err(ApiError::LimitExceeded);
    }

    let model = state
        .registry
        .get(&body.selected_chat_model)
        .cloned()
        .ok_or_else(|| {
            debug!("Unknown model {}", body.selected_chat_model);
            ApiError::NotFound
        })?;
    let strategy = Strategy::resolve(&state, &model)?;

    let incoming = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User.as_str())
        .ok_or(ApiError::BadRequest)?;
    let parts = user_parts(incoming, &model.capabilities)?;

    let existing = state.db.get_chat_by_id(body.id)?;
    if let Some(chat) = &existing {
        if !chat.is_owned_by(user.id) {
            error!("User {} tried to post to chat {}", user.id, chat.id);
            return Err(ApiError::Unauthorized);
        }
        if chat.is_deleted {
            return Err(ApiError::NotFound);
        }
    }

    let reserved = reserve(&state, &user, &model)?;

    let message_id = incoming.id.unwrap_or_else(Uuid::new_v4);
    let started_at = state.clock.now();
    let prompt = match store_user_message(
        &state, &user, body.id, existing, message_id, &parts, started_at,
    )
    .await
    {
        Ok(prompt) => prompt,
        Err(e) => {
            refund(state.db.as_ref(), user.id, &reserved);
            return Err(e);
        }
    };

    let (tx, mut rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let turn = Turn {
        state: state.clone(),
        user_id: user.id,
        chat_id: body.id,
        message_id,
        model,
        strategy,
        prompt,
        started_at,
        reserved,
        events: tx,
    };
    tokio::spawn(turn.run());

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<Event, Infallible>(event.to_sse());
        }
    };

    debug!("Exiting chat_turn");
    Ok(Sse::new(stream).into_response())
}

pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<ChatIdQuery>,
) -> Result<Json<Chat>, ApiError> {
    debug!("Entering delete_chat");
    let chat = owned_chat(&state, user.id, query.id)?;
    state.db.soft_delete_chat(chat.id, user.id)?;
    info!("Chat {} deleted by {}", chat.id, user.id);
    Ok(Json(Chat {
        is_deleted: true,
        ..chat
    }))
}

pub async fn update_chat(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<UpdateChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    debug!("Entering update_chat");
    let chat = owned_chat(&state, user.id, body.id)?;

    if let Some(title) = &body.title {
        let title = title.trim();
        if title.is_empty() {
            return Err(ApiError::BadRequest);
        }
        state.db.update_chat_title(chat.id, title)?;
    }
    if let Some(visibility) = body.visibility {
        state
            .db
            .update_chat_visibility(chat.id, user.id, visibility)?;
    }

    let updated = state.db.get_chat_by_id(chat.id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(updated))
}

pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<ChatWithMessages>, ApiError> {
    debug!("Entering get_chat");
    let chat = state
        .db
        .get_chat_by_id(chat_id)?
        .filter(|c| !c.is_deleted)
        .ok_or(ApiError::NotFound)?;
    if chat.visibility() == Visibility::Private && !chat.is_owned_by(user.id) {
        return Err(ApiError::Unauthorized);
    }
    let messages = state.db.get_messages_by_chat_id(chat.id)?;
    Ok(Json(ChatWithMessages { chat, messages }))
}

/// Deletes the given message and everything after it, for edit and retry.
pub async fn delete_trailing_messages(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<TrailingRequest>,
) -> Result<Json<DeletedResponse>, ApiError> {
    debug!("Entering delete_trailing_messages");
    let message = state
        .db
        .get_message_by_id(body.message_id)?
        .ok_or(ApiError::NotFound)?;
    let chat = owned_chat(&state, user.id, message.chat_id)?;
    let deleted = state
        .db
        .delete_messages_by_chat_id_after_timestamp(chat.id, message.created_at)?;
    debug!("Deleted {} messages from chat {}", deleted, chat.id);
    Ok(Json(DeletedResponse { deleted }))
}
