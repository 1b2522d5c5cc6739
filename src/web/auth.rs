use crate::db::DBError;
use crate::jwt::{validate_token, USER_ACCESS};
use crate::models::users::UserError;
use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

const SESSION_COOKIE: &str = "affortable_session";

/// Bearer token, or the session cookie set by the web client.
fn session_token(req: &Request<Body>) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }

    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Validates the session and puts the caller's `User` into the request extensions.
pub async fn validate_session(
    State(data): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match session_token(&req) {
        Some(token) => token,
        None => return ApiError::Unauthorized.into_response(),
    };

    let user_uuid = match validate_token(&token, &data.config.jwt_secret, USER_ACCESS) {
        Ok(uuid) => uuid,
        Err(e) => {
            tracing::debug!("Rejected session token: {}", e);
            return ApiError::InvalidJwt.into_response();
        }
    };

    let user = match data.db.get_user_by_uuid(user_uuid) {
        Ok(user) => user,
        Err(DBError::UserError(UserError::NotFound)) => {
            tracing::debug!("Session for unknown user {}", user_uuid);
            return ApiError::Unauthorized.into_response();
        }
        Err(e) => {
            tracing::error!("Error getting user: {:?}", e);
            return ApiError::InternalServerError.into_response();
        }
    };

    req.extensions_mut().insert(user);
    next.run(req).await
}
