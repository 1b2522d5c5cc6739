use crate::models::users::User;
use crate::web::auth::validate_session;
use crate::{ApiError, AppState};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    middleware::from_fn_with_state,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Jpeg,
    Png,
    Pdf,
}

impl FileKind {
    /// Identifies accepted files by their leading bytes.
    pub fn sniff(data: &[u8]) -> Option<FileKind> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(FileKind::Jpeg)
        } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(FileKind::Png)
        } else if data.starts_with(b"%PDF-") {
            Some(FileKind::Pdf)
        } else {
            None
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileKind::Jpeg => "image/jpeg",
            FileKind::Png => "image/png",
            FileKind::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Jpeg => "jpg",
            FileKind::Png => "png",
            FileKind::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub pathname: String,
    pub content_type: String,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/files/upload",
            post(upload_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .with_state(app_state)
}

/// Content addressed name, so re-uploading the same file reuses one path.
pub fn stored_name(data: &[u8], kind: FileKind) -> String {
    format!("{}.{}", hex::encode(Sha256::digest(data)), kind.extension())
}

pub fn check_upload(data: &[u8]) -> Result<FileKind, ApiError> {
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    FileKind::sniff(data).ok_or(ApiError::UnsupportedMediaType)
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    debug!("Entering upload_file");
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("Multipart error: {}", e);
        ApiError::BadRequest
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let data = field.bytes().await.map_err(|e| {
            warn!("Failed to read upload: {}", e);
            ApiError::PayloadTooLarge
        })?;
        let response = store_upload(&state, &data).await?;
        info!(
            "User {} uploaded {} ({} bytes)",
            user.id,
            response.pathname,
            data.len()
        );
        return Ok(Json(response));
    }
    Err(ApiError::BadRequest)
}

async fn store_upload(state: &AppState, data: &[u8]) -> Result<UploadResponse, ApiError> {
    let kind = check_upload(data)?;
    let name = stored_name(data, kind);
    let path = Path::new(&state.config.upload_dir).join(&name);
    tokio::fs::write(&path, data).await.map_err(|e| {
        error!("Failed to write upload {}: {}", path.display(), e);
        ApiError::InternalServerError
    })?;

    Ok(UploadResponse {
        url: format!(
            "{}/uploads/{}",
            state.config.public_base_url.trim_end_matches('/'),
            name
        ),
        pathname: name,
        content_type: kind.content_type().to_string(),
    })
}
