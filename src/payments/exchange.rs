use crate::clock::Clock;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CACHE_TTL_MINUTES: i64 = 60;
const FALLBACK_TTL_MINUTES: i64 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CREDIT_SCALE: i64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    rates: HashMap<String, Value>,
}

impl RatesResponse {
    fn bdt(&self) -> Result<BigDecimal, ExchangeError> {
        if let Some(result) = &self.result {
            if result != "success" {
                return Err(ExchangeError::Api(format!("result was {}", result)));
            }
        }
        let raw = self
            .rates
            .get("BDT")
            .and_then(|v| v.as_f64().map(|_| v.to_string()))
            .ok_or_else(|| ExchangeError::Api("no BDT rate".to_string()))?;
        let rate = BigDecimal::from_str(&raw).map_err(|e| ExchangeError::Api(e.to_string()))?;
        if rate <= BigDecimal::from(0) {
            return Err(ExchangeError::Api(format!("non-positive rate {}", rate)));
        }
        Ok(rate)
    }
}

#[derive(Debug, Clone)]
struct CachedRate {
    bdt_per_usd: BigDecimal,
    expires_at: DateTime<Utc>,
}

/// Live BDT per USD rate, cached for an hour, with a configured fallback.
/// A failed fetch caches the fallback for a few minutes before retrying.
#[derive(Clone)]
pub struct ExchangeRates {
    client: reqwest::Client,
    url: Option<String>,
    fallback: BigDecimal,
    clock: Arc<dyn Clock>,
    cached: Arc<RwLock<Option<CachedRate>>>,
}

impl ExchangeRates {
    pub fn new(url: String, fallback: BigDecimal, clock: Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: Some(url),
            fallback,
            clock,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// A rate that is never fetched.
    pub fn fixed(bdt_per_usd: BigDecimal, clock: Arc<dyn Clock>) -> Self {
        Self {
            url: None,
            ..Self::new(String::new(), bdt_per_usd, clock)
        }
    }

    pub async fn bdt_per_usd(&self) -> BigDecimal {
        let Some(url) = &self.url else {
            return self.fallback.clone();
        };
        let now = self.clock.now();
        if let Some(cached) = self.cached.read().await.as_ref() {
            if now < cached.expires_at {
                return cached.bdt_per_usd.clone();
            }
        }

        let (rate, ttl) = match self.fetch(url).await {
            Ok(rate) => {
                debug!("Fetched exchange rate {} BDT/USD", rate);
                (rate, CACHE_TTL_MINUTES)
            }
            Err(e) => {
                warn!("Exchange rate unavailable, using fallback: {}", e);
                (self.fallback.clone(), FALLBACK_TTL_MINUTES)
            }
        };
        *self.cached.write().await = Some(CachedRate {
            bdt_per_usd: rate.clone(),
            expires_at: now + ChronoDuration::minutes(ttl),
        });
        rate
    }

    async fn fetch(&self, url: &str) -> Result<BigDecimal, ExchangeError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExchangeError::Api(format!("status {}", status)));
        }
        response.json::<RatesResponse>().await?.bdt()
    }
}

/// USD cents credited for a BDT payment: `amount / rate * 100 * multiplier`.
pub fn bdt_to_cents(amount_bdt: &BigDecimal, bdt_per_usd: &BigDecimal, multiplier: &BigDecimal) -> BigDecimal {
    (amount_bdt / bdt_per_usd * BigDecimal::from(100) * multiplier)
        .round(CREDIT_SCALE)
        .normalized()
}
