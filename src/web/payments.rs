use crate::db::Settlement;
use crate::models::bkash::{NewBkashPayment, PaymentOutcome, PaymentStatus};
use crate::models::users::User;
use crate::payments::bkash::{BkashError, CreatePayment, PaymentState};
use crate::payments::exchange::bdt_to_cents;
use crate::payments::stripe;
use crate::web::auth::validate_session;
use crate::{ApiError, AppState};
use axum::{
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize)]
pub struct ExchangeRateResponse {
    pub bdt_per_usd: BigDecimal,
    pub multiplier: BigDecimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Bkash,
    Stripe,
}

#[derive(Debug, Deserialize)]
pub struct MakePaymentRequest {
    pub method: PaymentMethod,
    #[serde(default)]
    pub amount_bdt: Option<BigDecimal>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MakePaymentResponse {
    Bkash { payment_id: String, bkash_url: String },
    Stripe { url: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "paymentID", default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/exchange-rate", get(get_exchange_rate))
        .route(
            "/api/make-payment",
            post(make_payment).layer(from_fn_with_state(app_state.clone(), validate_session)),
        )
        .route("/api/callback", get(bkash_callback))
        .with_state(app_state)
}

fn gateway_error(err: BkashError) -> ApiError {
    match err {
        BkashError::Database(e) => ApiError::from(e),
        e => {
            error!("bKash request failed: {}", e);
            ApiError::PaymentGatewayError
        }
    }
}

async fn get_exchange_rate(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ExchangeRateResponse>, ApiError> {
    let now = state.clock.now();
    let promo = &state.config.promo;
    Ok(Json(ExchangeRateResponse {
        bdt_per_usd: state.exchange.bdt_per_usd().await,
        multiplier: promo.multiplier_at(now),
        promo_ends_at: promo.ends_at.filter(|ends_at| now < *ends_at),
    }))
}

async fn make_payment(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<User>,
    Json(request): Json<MakePaymentRequest>,
) -> Result<Json<MakePaymentResponse>, ApiError> {
    debug!("Entering make_payment");
    match request.method {
        PaymentMethod::Bkash => {
            let amount = request.amount_bdt.ok_or(ApiError::BadRequest)?;
            if amount <= BigDecimal::zero() {
                return Err(ApiError::BadRequest);
            }
            let bkash = state.bkash.as_ref().ok_or(ApiError::ServiceUnavailable)?;

            let id_token = bkash.id_token_for(user.id).await.map_err(gateway_error)?;
            let callback_url = format!(
                "{}/api/callback",
                state.config.public_base_url.trim_end_matches('/')
            );
            let created = bkash
                .gateway()
                .create_payment(&id_token, &CreatePayment::sale(user.id, &amount, callback_url))
                .await
                .map_err(gateway_error)?;

            state.db.create_bkash_payment(NewBkashPayment::initiated(
                created.payment_id.clone(),
                user.id,
                amount.clone(),
            ))?;
            info!(
                "Created bKash payment {} for user {} ({} BDT)",
                created.payment_id, user.id, amount
            );
            Ok(Json(MakePaymentResponse::Bkash {
                payment_id: created.payment_id,
                bkash_url: created.bkash_url,
            }))
        }
        PaymentMethod::Stripe => {
            let stripe_id = state
                .config
                .stripe_id
                .as_deref()
                .ok_or(ApiError::ServiceUnavailable)?;
            let url = stripe::payment_link(stripe_id, user.id).map_err(|e| {
                error!("Invalid Stripe payment link: {}", e);
                ApiError::InternalServerError
            })?;
            Ok(Json(MakePaymentResponse::Stripe { url }))
        }
    }
}

/// bKash redirects the payer here; the outcome is settled and the payer sent home.
async fn bkash_callback(
    State(state): State<Arc<AppState>>,
    query: Option<Query<CallbackQuery>>,
) -> Redirect {
    let Query(query) = query.unwrap_or_default();
    match (query.payment_id.as_deref(), query.status.as_deref()) {
        (Some(payment_id), Some(status)) => {
            match settle_callback(&state, payment_id, status).await {
                Ok(Some(settlement)) => {
                    info!("bKash payment {} settled: {:?}", payment_id, settlement)
                }
                Ok(None) => {}
                Err(e) => error!("bKash callback for {} failed: {:?}", payment_id, e),
            }
        }
        _ => warn!("Malformed bKash callback: {:?}", query),
    }
    Redirect::to(&format!(
        "{}/",
        state.config.public_base_url.trim_end_matches('/')
    ))
}

async fn settle_callback(
    state: &AppState,
    payment_id: &str,
    status: &str,
) -> Result<Option<Settlement>, ApiError> {
    let payment = match state.db.get_bkash_payment(payment_id)? {
        Some(payment) => payment,
        None => {
            warn!("Callback for unknown bKash payment {}", payment_id);
            return Ok(None);
        }
    };
    if payment.status().map_or(true, |s| s.is_final()) {
        return Ok(Some(Settlement::AlreadySettled));
    }

    let outcome = match status {
        "cancel" => PaymentOutcome::without_credit(PaymentStatus::Canceled),
        "failure" => PaymentOutcome::without_credit(PaymentStatus::Failure),
        "success" => {
            let bkash = state.bkash.as_ref().ok_or(ApiError::ServiceUnavailable)?;
            let id_token = bkash
                .id_token_for(payment.user_id)
                .await
                .map_err(gateway_error)?;
            let gateway_state = execute_or_query(state, &id_token, payment_id).await?;

            if gateway_state.is_completed() {
                let rate = state.exchange.bdt_per_usd().await;
                let multiplier = state.config.promo.multiplier_at(state.clock.now());
                PaymentOutcome {
                    status: PaymentStatus::Successful,
                    trx_id: gateway_state.trx_id,
                    mobile_number: gateway_state.customer_msisdn,
                    credited_cents: Some(bdt_to_cents(&payment.amount_bdt, &rate, &multiplier)),
                }
            } else {
                warn!(
                    "bKash payment {} not completed: {:?}",
                    payment_id, gateway_state.transaction_status
                );
                PaymentOutcome {
                    trx_id: gateway_state.trx_id,
                    ..PaymentOutcome::without_credit(PaymentStatus::Failure)
                }
            }
        }
        other => {
            warn!("Unexpected bKash callback status {} for {}", other, payment_id);
            return Ok(None);
        }
    };

    Ok(Some(state.db.settle_bkash_payment(payment_id, outcome)?))
}

/// Execute can fail after bKash already captured the money, so fall back to a status query.
async fn execute_or_query(
    state: &AppState,
    id_token: &str,
    payment_id: &str,
) -> Result<PaymentState, ApiError> {
    let bkash = state.bkash.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    match bkash.gateway().execute_payment(id_token, payment_id).await {
        Ok(gateway_state) => Ok(gateway_state),
        Err(e) => {
            warn!("bKash execute for {} failed, querying: {}", payment_id, e);
            bkash
                .gateway()
                .query_payment(id_token, payment_id)
                .await
                .map_err(gateway_error)
        }
    }
}
