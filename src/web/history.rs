use crate::model_registry::ModelDescriptor;
use crate::models::chats::Chat;
use crate::models::documents::{Document, DocumentKind, NewDocument, Suggestion};
use crate::models::messages::Vote;
use crate::models::users::User;
use crate::web::auth::validate_session;
use crate::web::chat::owned_chat;
use crate::{ApiError, AppState};
use axum::{
    extract::{Query, State},
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteQuery {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub vote_type: VoteType,
}

#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SaveDocumentRequest {
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    pub kind: DocumentKind,
}

#[derive(Debug, Deserialize)]
pub struct DeleteVersionsRequest {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DeletedVersions {
    pub deleted: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsQuery {
    pub document_id: Uuid,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/history",
            get(get_history).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/vote",
            get(get_votes)
                .patch(vote_message)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/document",
            get(get_document_versions)
                .post(save_document)
                .patch(delete_document_versions)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/suggestions",
            get(get_suggestions).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route("/api/models", get(list_models))
        .with_state(app_state)
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    debug!("Entering get_history");
    let chats = state.db.get_not_deleted_chats_by_user_id(user.id)?;
    Ok(Json(chats))
}

pub async fn get_votes(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<VoteQuery>,
) -> Result<Json<Vec<Vote>>, ApiError> {
    let chat = owned_chat(&state, user.id, query.chat_id)?;
    Ok(Json(state.db.get_votes_by_chat_id(chat.id)?))
}

pub async fn vote_message(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<VoteRequest>,
) -> Result<Json<Vote>, ApiError> {
    debug!("Entering vote_message");
    let chat = owned_chat(&state, user.id, body.chat_id)?;
    let message = state
        .db
        .get_message_by_id(body.message_id)?
        .filter(|m| m.chat_id == chat.id)
        .ok_or(ApiError::NotFound)?;

    let vote = Vote {
        chat_id: chat.id,
        message_id: message.id,
        is_upvoted: body.vote_type == VoteType::Up,
    };
    state.db.vote_message(vote.clone())?;
    Ok(Json(vote))
}

/// Versions of a document, oldest first. Empty for documents that do not exist yet.
fn owned_versions(state: &AppState, user_id: Uuid, id: Uuid) -> Result<Vec<Document>, ApiError> {
    let versions = state.db.get_documents_by_id(id)?;
    if versions.iter().any(|d| d.user_id != user_id) {
        error!("User {} does not own document {}", user_id, id);
        return Err(ApiError::Unauthorized);
    }
    Ok(versions)
}

pub async fn get_document_versions(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let versions = owned_versions(&state, user.id, query.id)?;
    if versions.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(versions))
}

/// Stores a new version of the document.
pub async fn save_document(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<DocumentQuery>,
    Json(body): Json<SaveDocumentRequest>,
) -> Result<Json<Document>, ApiError> {
    debug!("Entering save_document");
    owned_versions(&state, user.id, query.id)?;
    if body.title.trim().is_empty() {
        return Err(ApiError::BadRequest);
    }

    let document = state.db.save_document(NewDocument {
        id: query.id,
        created_at: state.clock.now(),
        title: body.title,
        content: body.content,
        kind: body.kind.as_str().to_string(),
        user_id: user.id,
    })?;
    Ok(Json(document))
}

/// Drops every version newer than `timestamp`, with their suggestions.
pub async fn delete_document_versions(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<DocumentQuery>,
    Json(body): Json<DeleteVersionsRequest>,
) -> Result<Json<DeletedVersions>, ApiError> {
    debug!("Entering delete_document_versions");
    if owned_versions(&state, user.id, query.id)?.is_empty() {
        return Err(ApiError::NotFound);
    }
    let deleted = state
        .db
        .delete_documents_by_id_after_timestamp(query.id, body.timestamp)?;
    Ok(Json(DeletedVersions { deleted }))
}

pub async fn get_suggestions(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Query(query): Query<SuggestionsQuery>,
) -> Result<Json<Vec<Suggestion>>, ApiError> {
    let document = state
        .db
        .get_document_by_id(query.document_id)?
        .ok_or(ApiError::NotFound)?;
    if document.user_id != user.id {
        return Err(ApiError::Unauthorized);
    }
    Ok(Json(state.db.get_suggestions_by_document_id(document.id)?))
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelDescriptor>> {
    Json(state.registry.all().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryDb;
    use crate::db::DBConnection;
    use crate::models::chats::{NewChat, Visibility};
    use crate::models::documents::NewSuggestion;
    use crate::models::messages::{ContentPart, NewMessage, Role};
    use crate::test_support;
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;

    fn setup() -> (Arc<InMemoryDb>, User, User, Arc<AppState>) {
        let db = Arc::new(InMemoryDb::new());
        let user = db.insert_user("rahim@example.com", BigDecimal::from(100));
        let other = db.insert_user("karim@example.com", BigDecimal::from(100));
        let state = Arc::new(test_support::state(db.clone()));
        (db, user, other, state)
    }

    fn chat(db: &InMemoryDb, owner: Uuid, title: &str) -> Chat {
        db.create_chat(NewChat::new(
            Uuid::new_v4(),
            owner,
            title.to_string(),
            Visibility::Private,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_history_lists_own_live_chats() {
        let (db, user, other, state) = setup();
        let kept = chat(&db, user.id, "Kept");
        let gone = chat(&db, user.id, "Gone");
        chat(&db, other.id, "Not mine");
        db.soft_delete_chat(gone.id, user.id).unwrap();

        let Json(chats) = get_history(State(state), axum::Extension(user)).await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_vote_replaces_previous_vote() {
        let (db, user, other, state) = setup();
        let chat = chat(&db, user.id, "Votes");
        let message = NewMessage::unbilled(
            Uuid::new_v4(),
            chat.id,
            Role::Assistant,
            &[ContentPart::text("Dhaka is 31°C")],
            None,
            Utc::now(),
        )
        .unwrap();
        let message_id = message.id;
        db.save_messages(vec![message]).unwrap();

        for vote_type in [VoteType::Up, VoteType::Down] {
            vote_message(
                State(state.clone()),
                axum::Extension(user.clone()),
                Json(VoteRequest {
                    chat_id: chat.id,
                    message_id,
                    vote_type,
                }),
            )
            .await
            .unwrap();
        }

        let Json(votes) = get_votes(
            State(state.clone()),
            axum::Extension(user),
            Query(VoteQuery { chat_id: chat.id }),
        )
        .await
        .unwrap();
        assert_eq!(votes.len(), 1);
        assert!(!votes[0].is_upvoted);

        let denied = get_votes(
            State(state),
            axum::Extension(other),
            Query(VoteQuery { chat_id: chat.id }),
        )
        .await;
        assert_eq!(denied.err(), Some(ApiError::Unauthorized));
    }

    #[test]
    fn test_vote_request_uses_client_field_names() {
        let body: VoteRequest = serde_json::from_value(serde_json::json!({
            "chatId": Uuid::nil(),
            "messageId": Uuid::nil(),
            "type": "up"
        }))
        .unwrap();
        assert_eq!(body.vote_type, VoteType::Up);
    }

    #[tokio::test]
    async fn test_document_versions_and_rollback() {
        let (db, user, other, state) = setup();
        let id = Uuid::new_v4();
        let first = Utc.with_ymd_and_hms(2025, 1, 9, 8, 0, 0).unwrap();
        db.save_document(NewDocument {
            id,
            created_at: first,
            title: "Essay".to_string(),
            content: Some("Draft".to_string()),
            kind: "text".to_string(),
            user_id: user.id,
        })
        .unwrap();

        let Json(saved) = save_document(
            State(state.clone()),
            axum::Extension(user.clone()),
            Query(DocumentQuery { id }),
            Json(SaveDocumentRequest {
                title: "Essay".to_string(),
                content: Some("Final".to_string()),
                kind: DocumentKind::Text,
            }),
        )
        .await
        .unwrap();
        assert_eq!(saved.content.as_deref(), Some("Final"));

        let Json(versions) = get_document_versions(
            State(state.clone()),
            axum::Extension(user.clone()),
            Query(DocumentQuery { id }),
        )
        .await
        .unwrap();
        assert_eq!(versions.len(), 2);

        let hijack = save_document(
            State(state.clone()),
            axum::Extension(other),
            Query(DocumentQuery { id }),
            Json(SaveDocumentRequest {
                title: "Mine now".to_string(),
                content: None,
                kind: DocumentKind::Text,
            }),
        )
        .await;
        assert_eq!(hijack.err(), Some(ApiError::Unauthorized));

        let Json(deleted) = delete_document_versions(
            State(state),
            axum::Extension(user),
            Query(DocumentQuery { id }),
            Json(DeleteVersionsRequest { timestamp: first }),
        )
        .await
        .unwrap();
        assert_eq!(deleted.deleted, 1);
        assert_eq!(
            db.get_document_by_id(id).unwrap().unwrap().content.as_deref(),
            Some("Draft")
        );
    }

    #[tokio::test]
    async fn test_suggestions_are_owner_only() {
        let (db, user, other, state) = setup();
        let document = db
            .save_document(NewDocument {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                title: "Essay".to_string(),
                content: Some("Teh end".to_string()),
                kind: "text".to_string(),
                user_id: user.id,
            })
            .unwrap();
        db.save_suggestions(vec![NewSuggestion {
            id: Uuid::new_v4(),
            document_id: document.id,
            document_created_at: document.created_at,
            original_text: "Teh".to_string(),
            suggested_text: "The".to_string(),
            description: Some("Typo".to_string()),
            is_resolved: false,
            user_id: user.id,
        }])
        .unwrap();

        let Json(suggestions) = get_suggestions(
            State(state.clone()),
            axum::Extension(user),
            Query(SuggestionsQuery {
                document_id: document.id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].suggested_text, "The");

        let denied = get_suggestions(
            State(state),
            axum::Extension(other),
            Query(SuggestionsQuery {
                document_id: document.id,
            }),
        )
        .await;
        assert_eq!(denied.err(), Some(ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn test_models_are_listed() {
        let (_db, _user, _other, state) = setup();
        let Json(models) = list_models(State(state)).await;
        assert!(models.iter().any(|m| m.id == "gpt-4o-azure"));
        assert!(models.iter().any(|m| m.id == "citation-finder"));
    }
}
