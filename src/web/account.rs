use crate::email::{EmailError, SupportTicket};
use crate::models::audit::{NewIpHistory, NewUserInterestLog};
use crate::models::users::User;
use crate::web::auth::validate_session;
use crate::{ApiError, AppState};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use validator::Validate;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance_cents: BigDecimal,
    pub message_count: i32,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UserInterestRequest {
    #[validate(length(min = 1, max = 200))]
    pub interest: String,
    #[validate(length(max = 200))]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SupportTicketRequest {
    #[validate(length(min = 1, max = 200))]
    pub subject: String,
    #[validate(length(min = 1, max = 5000))]
    pub message: String,
    #[validate(email, length(max = 254))]
    pub email: Option<String>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/balance",
            get(get_balance).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/referral",
            post(redeem_referral).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/coupon",
            post(redeem_coupon).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/log-ip",
            post(log_ip).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/user-interest",
            post(log_user_interest)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route(
            "/api/support-ticket",
            post(create_support_ticket)
                .layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .with_state(app_state)
}

pub async fn get_balance(
    axum::Extension(user): axum::Extension<User>,
) -> Json<BalanceResponse> {
    Json(BalanceResponse {
        balance_cents: user.api_balance_cents,
        message_count: user.message_count,
    })
}

fn normalized_code(code: &str) -> Result<&str, ApiError> {
    let code = code.trim();
    if code.is_empty() || code.len() > 64 {
        return Err(ApiError::BadRequest);
    }
    Ok(code)
}

pub async fn redeem_referral(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<CodeRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    debug!("Entering redeem_referral");
    let code = normalized_code(&body.code)?;
    let balance_cents = state.db.redeem_referral(user.id, code)?;
    info!("User {} redeemed referral code {}", user.id, code);
    Ok(Json(BalanceResponse {
        balance_cents,
        message_count: user.message_count,
    }))
}

pub async fn redeem_coupon(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<CodeRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    debug!("Entering redeem_coupon");
    let code = normalized_code(&body.code)?;
    let balance_cents = state.db.redeem_coupon(user.id, code, state.clock.now())?;
    info!("User {} redeemed coupon {}", user.id, code);
    Ok(Json(BalanceResponse {
        balance_cents,
        message_count: user.message_count,
    }))
}

/// First address of `x-forwarded-for`, then `x-real-ip`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

pub async fn log_ip(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ip_address = client_ip(&headers).ok_or(ApiError::BadRequest)?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.db.log_ip(NewIpHistory {
        user_id: user.id,
        ip_address,
        user_agent,
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn log_user_interest(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<UserInterestRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate().map_err(|e| {
        debug!("Invalid interest: {}", e);
        ApiError::BadRequest
    })?;
    state.db.log_user_interest(NewUserInterestLog {
        user_id: user.id,
        interest: body.interest,
        source: body.source,
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_support_ticket(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(body): Json<SupportTicketRequest>,
) -> Result<StatusCode, ApiError> {
    debug!("Entering create_support_ticket");
    body.validate().map_err(|e| {
        debug!("Invalid support ticket: {}", e);
        ApiError::BadRequest
    })?;

    let ticket = SupportTicket {
        user_id: user.id,
        account_email: user.email,
        contact_email: body.email,
        subject: body.subject.trim().to_string(),
        message: body.message,
    };
    state
        .mailer
        .send_support_ticket(&ticket)
        .await
        .map_err(|e| match e {
            EmailError::NotConfigured => ApiError::ServiceUnavailable,
            EmailError::UnknownError => {
                error!("Could not send support ticket for {}", ticket.user_id);
                ApiError::InternalServerError
            }
        })?;
    info!("Support ticket sent for user {}", ticket.user_id);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryDb;
    use crate::db::DBConnection;
    use crate::email::test_support::RecordingMailer;
    use crate::models::referrals::Coupon;
    use crate::test_support;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_coupon_credits_once() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.insert_user("rahim@example.com", BigDecimal::from(0));
        db.insert_coupon(Coupon {
            code: "EID2025".to_string(),
            amount_cents: BigDecimal::from(200),
            max_uses: 100,
            times_used: 0,
            is_active: true,
            expires_at: Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        });
        let state = Arc::new(test_support::state(db.clone()));

        let redeem = || {
            redeem_coupon(
                State(state.clone()),
                axum::Extension(user.clone()),
                Json(CodeRequest {
                    code: " EID2025 ".to_string(),
                }),
            )
        };

        let Json(first) = redeem().await.unwrap();
        assert_eq!(first.balance_cents, BigDecimal::from(200));
        assert_eq!(redeem().await.err(), Some(ApiError::AlreadyRedeemed));
        assert_eq!(db.get_balance(user.id).unwrap(), BigDecimal::from(200));
    }

    #[tokio::test]
    async fn test_referral_limit_is_enforced() {
        let db = Arc::new(InMemoryDb::new());
        let owner = db.insert_user("owner@example.com", BigDecimal::from(0));
        db.insert_referral("FRIEND", Some(owner.id), BigDecimal::from(50), 1);
        let state = Arc::new(test_support::state(db.clone()));

        let first = db.insert_user("first@example.com", BigDecimal::from(0));
        let second = db.insert_user("second@example.com", BigDecimal::from(0));
        for (user, expected) in [(first, Ok(50)), (second, Err(ApiError::CodeLimitReached))] {
            let result = redeem_referral(
                State(state.clone()),
                axum::Extension(user),
                Json(CodeRequest {
                    code: "FRIEND".to_string(),
                }),
            )
            .await
            .map(|Json(r)| r.balance_cents);
            assert_eq!(result, expected.map(BigDecimal::from));
        }

        let own = redeem_referral(
            State(state),
            axum::Extension(owner),
            Json(CodeRequest {
                code: "FRIEND".to_string(),
            }),
        )
        .await;
        assert_eq!(own.err(), Some(ApiError::OwnReferralCode));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("103.4.145.2, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("103.4.145.2"));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_log_ip_updates_last_ip() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.insert_user("rahim@example.com", BigDecimal::from(0));
        let state = Arc::new(test_support::state(db.clone()));
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("103.4.145.2"));

        let status = log_ip(State(state), axum::Extension(user.clone()), headers)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let snapshot = db.snapshot();
        assert_eq!(snapshot.users[&user.id].last_ip.as_deref(), Some("103.4.145.2"));
        assert_eq!(snapshot.ip_history.len(), 1);
    }

    #[tokio::test]
    async fn test_support_ticket_is_validated_and_sent() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.insert_user("rahim@example.com", BigDecimal::from(0));
        let mailer = Arc::new(RecordingMailer::default());
        let mut state = test_support::state(db);
        state.mailer = mailer.clone();
        let state = Arc::new(state);

        let invalid = create_support_ticket(
            State(state.clone()),
            axum::Extension(user.clone()),
            Json(SupportTicketRequest {
                subject: "Refund".to_string(),
                message: "Paid twice".to_string(),
                email: Some("not-an-email".to_string()),
            }),
        )
        .await;
        assert_eq!(invalid.err(), Some(ApiError::BadRequest));

        let status = create_support_ticket(
            State(state),
            axum::Extension(user.clone()),
            Json(SupportTicketRequest {
                subject: " Refund ".to_string(),
                message: "Paid twice for one top-up".to_string(),
                email: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Refund");
        assert_eq!(sent[0].account_email, "rahim@example.com");
    }

    #[tokio::test]
    async fn test_interest_is_logged() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.insert_user("rahim@example.com", BigDecimal::from(0));
        let state = Arc::new(test_support::state(db.clone()));

        log_user_interest(
            State(state.clone()),
            axum::Extension(user.clone()),
            Json(UserInterestRequest {
                interest: "video-generation".to_string(),
                source: Some("pricing-page".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(db.snapshot().interests.len(), 1);

        let empty = log_user_interest(
            State(state),
            axum::Extension(user),
            Json(UserInterestRequest {
                interest: String::new(),
                source: None,
            }),
        )
        .await;
        assert_eq!(empty.err(), Some(ApiError::BadRequest));
    }
}
