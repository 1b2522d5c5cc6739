use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, ConfigError};
use crate::db::{setup_db, DBConnection, DBError};
use crate::email::{DisabledMailer, Mailer, ResendMailer};
use crate::model_registry::ModelRegistry;
use crate::models::chats::ChatError;
use crate::models::documents::DocumentError;
use crate::models::messages::MessageError;
use crate::models::referrals::{CouponError, ReferralError};
use crate::models::users::UserError;
use crate::payments::bkash::{BkashClient, BkashError, BkashTokenCache};
use crate::payments::exchange::ExchangeRates;
use crate::providers::{HttpTransport, ProviderSet};
use crate::tools::{ToolError, ToolRegistry};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod db;
mod email;
mod jwt;
mod model_registry;
mod models;
mod payments;
mod pricing;
mod providers;
mod tokens;
mod tools;
mod web;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Tool setup error: {0}")]
    Tools(#[from] ToolError),
    #[error("bKash setup error: {0}")]
    Bkash(#[from] BkashError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ApiError {
    #[error("Invalid JWT")]
    InvalidJwt,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error")]
    InternalServerError,

    #[error("Bad Request")]
    BadRequest,

    #[error("Resource not found")]
    NotFound,

    #[error("Insufficient balance")]
    LimitExceeded,

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Invalid code")]
    InvalidCode,

    #[error("You cannot use your own referral code")]
    OwnReferralCode,

    #[error("A referral code has already been used on this account")]
    ReferralAlreadyUsed,

    #[error("Code usage limit reached")]
    CodeLimitReached,

    #[error("Coupon is no longer active")]
    CouponUnavailable,

    #[error("Coupon already redeemed")]
    AlreadyRedeemed,

    #[error("File is too large")]
    PayloadTooLarge,

    #[error("Unsupported file type")]
    UnsupportedMediaType,

    #[error("Payment gateway error")]
    PaymentGatewayError,

    #[error("Message already exists")]
    MessageExists,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    status: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidJwt => StatusCode::UNAUTHORIZED,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::LimitExceeded => StatusCode::FORBIDDEN,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidCode => StatusCode::BAD_REQUEST,
            ApiError::OwnReferralCode => StatusCode::BAD_REQUEST,
            ApiError::ReferralAlreadyUsed => StatusCode::CONFLICT,
            ApiError::CodeLimitReached => StatusCode::CONFLICT,
            ApiError::CouponUnavailable => StatusCode::BAD_REQUEST,
            ApiError::AlreadyRedeemed => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PaymentGatewayError => StatusCode::BAD_GATEWAY,
            ApiError::MessageExists => StatusCode::CONFLICT,
        }
    }

    /// Machine readable code for errors the client branches on.
    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::LimitExceeded => Some("limit_exceeded"),
            ApiError::AlreadyRedeemed => Some("already_redeemed"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message: self.to_string(),
                error: self.code(),
            }),
        )
            .into_response()
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        match err {
            DBError::UserError(UserError::NotFound) => ApiError::Unauthorized,
            DBError::ChatError(ChatError::NotFound) => ApiError::NotFound,
            DBError::ChatError(ChatError::InvalidVisibility(_)) => ApiError::BadRequest,
            DBError::MessageError(MessageError::NotFound) => ApiError::NotFound,
            DBError::MessageError(MessageError::DuplicateId) => ApiError::MessageExists,
            DBError::DocumentError(DocumentError::NotFound) => ApiError::NotFound,
            DBError::ReferralError(ReferralError::UnknownCode) => ApiError::InvalidCode,
            DBError::ReferralError(ReferralError::OwnCode) => ApiError::OwnReferralCode,
            DBError::ReferralError(ReferralError::AlreadyUsedReferral) => {
                ApiError::ReferralAlreadyUsed
            }
            DBError::ReferralError(ReferralError::LimitReached) => ApiError::CodeLimitReached,
            DBError::CouponError(CouponError::UnknownCode) => ApiError::InvalidCode,
            DBError::CouponError(CouponError::Inactive | CouponError::Expired) => {
                ApiError::CouponUnavailable
            }
            DBError::CouponError(CouponError::AlreadyRedeemed) => ApiError::AlreadyRedeemed,
            DBError::CouponError(CouponError::LimitReached) => ApiError::CodeLimitReached,
            err => {
                error!("Database error: {:?}", err);
                ApiError::InternalServerError
            }
        }
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub registry: ModelRegistry,
    pub providers: ProviderSet,
    pub tools: ToolRegistry,
    pub bkash: Option<BkashTokenCache>,
    pub exchange: ExchangeRates,
    pub mailer: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: AppConfig, db: Arc<dyn DBConnection + Send + Sync>) -> Result<Self, Error> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let providers = ProviderSet::from_config(&config, HttpTransport::new());
        let tools = ToolRegistry::from_config(&config)?;

        let bkash = match &config.bkash {
            Some(bkash_config) => Some(BkashTokenCache::new(
                Arc::new(BkashClient::new(bkash_config.clone())?),
                db.clone(),
                clock.clone(),
            )),
            None => None,
        };
        let exchange = ExchangeRates::new(
            config.exchange_rate_url.clone(),
            config.fallback_bdt_per_usd.clone(),
            clock.clone(),
        );
        let mailer: Arc<dyn Mailer> = match &config.email {
            Some(email) => Arc::new(ResendMailer::new(email)),
            None => Arc::new(DisabledMailer),
        };

        Ok(Self {
            config,
            db,
            registry: ModelRegistry::builtin(),
            providers,
            tools,
            bkash,
            exchange,
            mailer,
            clock,
        })
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!("Starting with {:?}", config);

    let db = setup_db(config.database_url.clone());
    let bind_addr = format!("{}:{}", config.host, config.port);
    let upload_dir = config.upload_dir.clone();
    tokio::fs::create_dir_all(&upload_dir).await?;

    let app_state = Arc::new(AppState::new(config, db)?);

    let app = Router::new()
        .route("/health-check", get(health_check))
        .merge(web::chat::router(app_state.clone()))
        .merge(web::history::router(app_state.clone()))
        .merge(web::account::router(app_state.clone()))
        .merge(web::payments::router(app_state.clone()))
        .merge(web::files::router(app_state.clone()))
        .nest_service("/uploads", ServeDir::new(upload_dir))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::test_config;
    use crate::db::memory::InMemoryDb;
    use crate::email::test_support::RecordingMailer;
    use bigdecimal::BigDecimal;
    use chrono::{TimeZone, Utc};

    /// Application state over an in-memory database with no providers or tools.
    pub fn state(db: Arc<InMemoryDb>) -> AppState {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        ));
        AppState {
            config: test_config(),
            db,
            registry: ModelRegistry::builtin(),
            providers: ProviderSet::new(),
            tools: ToolRegistry::new(),
            bkash: None,
            exchange: ExchangeRates::fixed(BigDecimal::from(122), clock.clone()),
            mailer: Arc::new(RecordingMailer::default()),
            clock,
        }
    }

    pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
