//! bKash tokenized checkout.
//!
//! Gateway tokens are cached per user in `bkash_auth_tokens` and reused while
//! younger than [`TOKEN_TTL_MINUTES`]; older ones are refreshed, falling back
//! to a fresh grant when the refresh is rejected.

use crate::clock::Clock;
use crate::config::BkashConfig;
use crate::db::{DBConnection, DBError};
use crate::models::bkash::BkashAuthToken;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Duration as ChronoDuration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TOKEN_TTL_MINUTES: i64 = 55;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SUCCESS_CODE: &str = "0000";

#[derive(Debug, thiserror::Error)]
pub enum BkashError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("bKash rejected the request: {code} - {message}")]
    Rejected { code: String, message: String },
    #[error("Database error: {0}")]
    Database(#[from] DBError),
}

#[derive(Clone, Deserialize)]
pub struct BkashTokens {
    pub id_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for BkashTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkashTokens")
            .field("id_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayment {
    pub mode: String,
    pub payer_reference: String,
    #[serde(rename = "callbackURL")]
    pub callback_url: String,
    pub amount: String,
    pub currency: String,
    pub intent: String,
    pub merchant_invoice_number: String,
}

impl CreatePayment {
    pub fn sale(user_id: Uuid, amount_bdt: &BigDecimal, callback_url: String) -> Self {
        Self {
            mode: "0011".to_string(),
            payer_reference: user_id.to_string(),
            callback_url,
            amount: amount_bdt.with_scale(2).to_string(),
            currency: "BDT".to_string(),
            intent: "sale".to_string(),
            merchant_invoice_number: format!("Inv{}", Uuid::new_v4().simple()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CreatedPayment {
    #[serde(rename = "paymentID")]
    pub payment_id: String,
    #[serde(rename = "bkashURL")]
    pub bkash_url: String,
}

/// State of a payment as reported by execute or query.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentState {
    #[serde(rename = "paymentID")]
    pub payment_id: String,
    #[serde(rename = "trxID", default)]
    pub trx_id: Option<String>,
    #[serde(rename = "transactionStatus", default)]
    pub transaction_status: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(rename = "customerMsisdn", default)]
    pub customer_msisdn: Option<String>,
}

impl PaymentState {
    pub fn is_completed(&self) -> bool {
        self.transaction_status.as_deref() == Some("Completed")
    }
}

#[async_trait]
pub trait BkashGateway: Send + Sync {
    async fn grant_token(&self) -> Result<BkashTokens, BkashError>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<BkashTokens, BkashError>;
    async fn create_payment(
        &self,
        id_token: &str,
        request: &CreatePayment,
    ) -> Result<CreatedPayment, BkashError>;
    async fn execute_payment(&self, id_token: &str, payment_id: &str)
        -> Result<PaymentState, BkashError>;
    async fn query_payment(&self, id_token: &str, payment_id: &str)
        -> Result<PaymentState, BkashError>;
}

/// bKash reports most failures as HTTP 200 with a non-zero `statusCode`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "statusCode", default)]
    status_code: Option<String>,
    #[serde(rename = "statusMessage", default)]
    status_message: Option<String>,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

impl Envelope {
    fn check(self) -> Result<(), BkashError> {
        if let Some(code) = self.error_code {
            return Err(BkashError::Rejected {
                code,
                message: self.error_message.unwrap_or_default(),
            });
        }
        match self.status_code {
            Some(code) if code != SUCCESS_CODE => Err(BkashError::Rejected {
                code,
                message: self.status_message.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, BkashError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|e| BkashError::Api {
        status: 200,
        message: format!("unreadable response: {}", e),
    })?;
    envelope.check()?;
    serde_json::from_str(body).map_err(|e| BkashError::Api {
        status: 200,
        message: format!("unexpected response: {}", e),
    })
}

/// reqwest client for the tokenized checkout endpoints.
#[derive(Clone)]
pub struct BkashClient {
    client: reqwest::Client,
    config: Arc<BkashConfig>,
}

impl BkashClient {
    pub fn new(config: BkashConfig) -> Result<Self, BkashError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(BkashError::Request)?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/tokenized/checkout/{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BkashError> {
        let response = request.header("Accept", "application/json").send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BkashError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        decode(&body)
    }

    async fn token_request(&self, path: &str, body: serde_json::Value) -> Result<BkashTokens, BkashError> {
        let request = self
            .client
            .post(self.url(path))
            .header("username", &self.config.username)
            .header("password", &self.config.password)
            .json(&body);
        self.send(request).await
    }

    fn authorized(&self, path: &str, id_token: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("Authorization", id_token)
            .header("X-App-Key", &self.config.app_key)
    }
}

impl std::fmt::Debug for BkashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkashClient")
            .field("base_url", &self.config.base_url)
            .field("credentials", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl BkashGateway for BkashClient {
    async fn grant_token(&self) -> Result<BkashTokens, BkashError> {
        self.token_request(
            "token/grant",
            json!({
                "app_key": self.config.app_key,
                "app_secret": self.config.app_secret,
            }),
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<BkashTokens, BkashError> {
        self.token_request(
            "token/refresh",
            json!({
                "app_key": self.config.app_key,
                "app_secret": self.config.app_secret,
                "refresh_token": refresh_token,
            }),
        )
        .await
    }

    async fn create_payment(
        &self,
        id_token: &str,
        request: &CreatePayment,
    ) -> Result<CreatedPayment, BkashError> {
        self.send(self.authorized("create", id_token).json(request))
            .await
    }

    async fn execute_payment(
        &self,
        id_token: &str,
        payment_id: &str,
    ) -> Result<PaymentState, BkashError> {
        self.send(
            self.authorized("execute", id_token)
                .json(&json!({ "paymentID": payment_id })),
        )
        .await
    }

    async fn query_payment(
        &self,
        id_token: &str,
        payment_id: &str,
    ) -> Result<PaymentState, BkashError> {
        self.send(
            self.authorized("payment/status", id_token)
                .json(&json!({ "paymentID": payment_id })),
        )
        .await
    }
}

/// Per-user gateway tokens backed by the database.
#[derive(Clone)]
pub struct BkashTokenCache {
    gateway: Arc<dyn BkashGateway>,
    db: Arc<dyn DBConnection + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl BkashTokenCache {
    pub fn new(
        gateway: Arc<dyn BkashGateway>,
        db: Arc<dyn DBConnection + Send + Sync>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { gateway, db, clock }
    }

    /// A usable id token for `user_id`.
    pub async fn id_token_for(&self, user_id: Uuid) -> Result<String, BkashError> {
        let now = self.clock.now();
        let cached = self.db.get_bkash_auth_token(user_id)?;

        if let Some(token) = &cached {
            if now - token.created_at < ChronoDuration::minutes(TOKEN_TTL_MINUTES) {
                debug!("Reusing bKash token for user {}", user_id);
                return Ok(token.id_token.clone());
            }
        }

        let tokens = match cached {
            Some(token) => match self.gateway.refresh_token(&token.refresh_token).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("bKash token refresh failed, granting a new one: {}", e);
                    self.gateway.grant_token().await?
                }
            },
            None => self.gateway.grant_token().await?,
        };
        info!("Stored new bKash token for user {}", user_id);

        self.db.upsert_bkash_auth_token(BkashAuthToken {
            user_id,
            id_token: tokens.id_token.clone(),
            refresh_token: tokens.refresh_token,
            created_at: now,
        })?;
        Ok(tokens.id_token)
    }

    pub fn gateway(&self) -> &Arc<dyn BkashGateway> {
        &self.gateway
    }
}
