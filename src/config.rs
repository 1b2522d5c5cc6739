use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_EXCHANGE_RATE_URL: &str = "https://open.er-api.com/v6/latest/USD";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct AzureOpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
}

#[derive(Clone)]
pub struct AzureInferenceConfig {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Clone)]
pub struct BkashConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub app_key: String,
    pub app_secret: String,
}

#[derive(Clone, Default)]
pub struct ToolKeys {
    pub slide_speak_key: Option<String>,
    pub rapidapi_key: Option<String>,
    pub rapidapi_clothing_host: Option<String>,
    pub rephrasy_api_key: Option<String>,
    pub rephrasy_url: Option<String>,
    pub supadata_api_key: Option<String>,
    pub ailabtool_api_key: Option<String>,
}

#[derive(Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub support_email: String,
    pub from: String,
}

#[derive(Clone)]
pub struct PromoConfig {
    pub multiplier: BigDecimal,
    pub ends_at: Option<DateTime<Utc>>,
}

impl PromoConfig {
    /// Multiplier applied to bKash credits at `now`; 1 outside the promotion window.
    pub fn multiplier_at(&self, now: DateTime<Utc>) -> BigDecimal {
        match self.ends_at {
            Some(ends_at) if now < ends_at => self.multiplier.clone(),
            Some(_) => BigDecimal::from(1),
            None => self.multiplier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    pub upload_dir: String,
    pub title_model: String,
    pub max_tool_steps: usize,
    pub openai_api_key: Option<String>,
    pub azure_openai: Option<AzureOpenAiConfig>,
    pub azure_inference: Option<AzureInferenceConfig>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub bkash: Option<BkashConfig>,
    pub stripe_id: Option<String>,
    pub tools: ToolKeys,
    pub email: Option<EmailConfig>,
    pub exchange_rate_url: String,
    pub fallback_bdt_per_usd: BigDecimal,
    pub promo: PromoConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("public_base_url", &self.public_base_url)
            .field("upload_dir", &self.upload_dir)
            .field("title_model", &self.title_model)
            .field("openai", &self.openai_api_key.is_some())
            .field("azure_openai", &self.azure_openai.is_some())
            .field("azure_inference", &self.azure_inference.is_some())
            .field("anthropic", &self.anthropic_api_key.is_some())
            .field("google", &self.google_api_key.is_some())
            .field("bkash", &self.bkash.is_some())
            .field("email", &self.email.is_some())
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL")
            .or_else(|| get("POSTGRES_URL"))
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let azure_openai = match (
            get("AZURE_OPENAI_ENDPOINT"),
            get("AZURE_OPENAI_API_KEY"),
        ) {
            (Some(endpoint), Some(api_key)) => Some(AzureOpenAiConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key,
                api_version: get("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| "2024-10-21".to_string()),
            }),
            _ => None,
        };

        let azure_inference = match (
            get("AZURE_INFERENCE_ENDPOINT"),
            get("AZURE_INFERENCE_API_KEY"),
        ) {
            (Some(endpoint), Some(api_key)) => Some(AzureInferenceConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key,
            }),
            _ => None,
        };

        let bkash = match (
            get("BKASH_BASE_URL"),
            get("BKASH_USERNAME"),
            get("BKASH_PASSWORD"),
            get("BKASH_APP_KEY"),
            get("BKASH_APP_SECRET"),
        ) {
            (Some(base_url), Some(username), Some(password), Some(app_key), Some(app_secret)) => {
                Some(BkashConfig {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    username,
                    password,
                    app_key,
                    app_secret,
                })
            }
            _ => None,
        };

        let email = match (get("RESEND_API_KEY"), get("SUPPORT_EMAIL")) {
            (Some(resend_api_key), Some(support_email)) => Some(EmailConfig {
                resend_api_key,
                from: get("EMAIL_FROM").unwrap_or_else(|| support_email.clone()),
                support_email,
            }),
            _ => None,
        };

        let promo_ends_at = match get("PROMO_ENDS_AT") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|_| ConfigError::Invalid {
                        name: "PROMO_ENDS_AT",
                        value: raw.clone(),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Self {
            database_url,
            jwt_secret,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", get("PORT"), 3000)?,
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            upload_dir: get("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string()),
            title_model: get("TITLE_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_tool_steps: parse_or("MAX_TOOL_STEPS", get("MAX_TOOL_STEPS"), 5)?,
            openai_api_key: get("OPENAI_API_KEY"),
            azure_openai,
            azure_inference,
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            google_api_key: get("GOOGLE_GENERATIVE_AI_API_KEY"),
            bkash,
            stripe_id: get("STRIPE_ID"),
            tools: ToolKeys {
                slide_speak_key: get("SLIDE_SPEAK_KEY"),
                rapidapi_key: get("RAPIDAPI_KEY"),
                rapidapi_clothing_host: get("RAPIDAPI_CLOTHING_HOST"),
                rephrasy_api_key: get("REPHRASY_API_KEY"),
                rephrasy_url: get("REPHRASY_URL"),
                supadata_api_key: get("SUPADATA_API_KEY"),
                ailabtool_api_key: get("AILABTOOL_API_KEY"),
            },
            email,
            exchange_rate_url: get("EXCHANGE_RATE_URL")
                .unwrap_or_else(|| DEFAULT_EXCHANGE_RATE_URL.to_string()),
            fallback_bdt_per_usd: parse_or(
                "FALLBACK_BDT_PER_USD",
                get("FALLBACK_BDT_PER_USD"),
                BigDecimal::from(122),
            )?,
            promo: PromoConfig {
                multiplier: parse_or(
                    "PROMO_MULTIPLIER",
                    get("PROMO_MULTIPLIER"),
                    BigDecimal::from(1),
                )?,
                ends_at: promo_ends_at,
            },
        })
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    let vars = HashMap::from([
        (
            "DATABASE_URL".to_string(),
            "postgres://localhost/affortable_test".to_string(),
        ),
        ("JWT_SECRET".to_string(), "test-secret".to_string()),
        (
            "PUBLIC_BASE_URL".to_string(),
            "https://affortable.test".to_string(),
        ),
    ]);
    AppConfig::from_map(&vars).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> HashMap<String, String> {
        HashMap::from([
            ("POSTGRES_URL".to_string(), "postgres://db/app".to_string()),
            ("JWT_SECRET".to_string(), "s3cret".to_string()),
        ])
    }

    #[test]
    fn test_defaults_apply() {
        let config = AppConfig::from_map(&base()).unwrap();
        assert_eq!(config.database_url, "postgres://db/app");
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_tool_steps, 5);
        assert_eq!(config.fallback_bdt_per_usd, BigDecimal::from(122));
        assert_eq!(config.title_model, "gpt-4o-mini");
        assert!(config.bkash.is_none());
        assert!(config.email.is_none());
    }

    #[test]
    fn test_missing_secret_is_reported() {
        let mut vars = base();
        vars.remove("JWT_SECRET");
        assert_eq!(
            AppConfig::from_map(&vars).err(),
            Some(ConfigError::Missing("JWT_SECRET"))
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let mut vars = base();
        vars.insert("PORT".to_string(), "eighty".to_string());
        assert!(matches!(
            AppConfig::from_map(&vars),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));
    }

    #[test]
    fn test_bkash_requires_all_credentials() {
        let mut vars = base();
        vars.insert("BKASH_BASE_URL".to_string(), "https://tokenized.sandbox.bka.sh/v1.2.0-beta/".to_string());
        vars.insert("BKASH_USERNAME".to_string(), "user".to_string());
        assert!(AppConfig::from_map(&vars).unwrap().bkash.is_none());

        vars.insert("BKASH_PASSWORD".to_string(), "pass".to_string());
        vars.insert("BKASH_APP_KEY".to_string(), "key".to_string());
        vars.insert("BKASH_APP_SECRET".to_string(), "secret".to_string());
        let bkash = AppConfig::from_map(&vars).unwrap().bkash.unwrap();
        assert_eq!(bkash.base_url, "https://tokenized.sandbox.bka.sh/v1.2.0-beta");
    }

    #[test]
    fn test_promo_multiplier_expires() {
        let now = Utc::now();
        let promo = PromoConfig {
            multiplier: BigDecimal::from(2),
            ends_at: Some(now + Duration::hours(1)),
        };
        assert_eq!(promo.multiplier_at(now), BigDecimal::from(2));
        assert_eq!(
            promo.multiplier_at(now + Duration::hours(2)),
            BigDecimal::from(1)
        );
    }
}
