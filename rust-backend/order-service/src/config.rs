use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Order-flow settings injected into the orchestrator and sweeper.
#[derive(Debug, Clone)]
pub struct OrderConfig {
    pub reservation_ttl: chrono::Duration,
    /// Hard radius applied before the store's own `max_km`.
    pub max_radius_km: Option<Decimal>,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl OrderConfig {
    pub fn success_url_for(&self, public_id: &str) -> String {
        self.success_url.replace("{order}", public_id)
    }

    pub fn cancel_url_for(&self, public_id: &str) -> String {
        self.cancel_url.replace("{order}", public_id)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub host: String,
    pub port: u16,
    pub redis_url: Option<String>,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_country: String,
    pub geocode_cache_ttl: chrono::Duration,
    pub payment_api_url: String,
    pub payment_secret_key: Option<String>,
    pub payment_webhook_secret: Option<String>,
    pub cleanup_secret: Option<String>,
    pub admin_secret: Option<String>,
    pub sweep_interval_secs: u64,
    pub order: OrderConfig,
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Development keeps reservations short so expiry paths are easy to exercise.
pub fn default_reservation_ttl_minutes(app_env: &str) -> i64 {
    if app_env.eq_ignore_ascii_case("development") {
        2
    } else {
        15
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let app_env = optional("APP_ENV").unwrap_or_else(|| "production".to_string());
        let ttl_minutes = parsed("RESERVATION_TTL_MINUTES", default_reservation_ttl_minutes(&app_env))?;
        if ttl_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "RESERVATION_TTL_MINUTES",
                value: ttl_minutes.to_string(),
            });
        }

        let max_radius_km = match optional("MAX_DELIVERY_RADIUS_KM") {
            None => None,
            Some(value) => Some(Decimal::from_str(&value).map_err(|_| ConfigError::Invalid {
                key: "MAX_DELIVERY_RADIUS_KM",
                value,
            })?),
        };

        let site_url = optional("SITE_URL").unwrap_or_else(|| "http://localhost:3000".to_string());
        let site_url = site_url.trim_end_matches('/').to_string();

        Ok(Self {
            database_url,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 5)?,
            host: optional("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parsed("PORT", 3001)?,
            redis_url: optional("REDIS_URL"),
            geocoder_url: optional("GEOCODER_URL")
                .unwrap_or_else(|| "https://nominatim.openstreetmap.org".to_string()),
            geocoder_user_agent: optional("GEOCODER_USER_AGENT")
                .unwrap_or_else(|| "order-service/0.1".to_string()),
            geocoder_country: optional("GEOCODER_COUNTRY").unwrap_or_else(|| "it".to_string()),
            geocode_cache_ttl: chrono::Duration::days(parsed("GEOCODE_CACHE_TTL_DAYS", 7)?),
            payment_api_url: optional("PAYMENT_API_URL")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            payment_secret_key: optional("PAYMENT_SECRET_KEY"),
            payment_webhook_secret: optional("PAYMENT_WEBHOOK_SECRET"),
            cleanup_secret: optional("CLEANUP_SECRET"),
            admin_secret: optional("ADMIN_SECRET"),
            sweep_interval_secs: parsed("SWEEP_INTERVAL_SECS", 60)?,
            order: OrderConfig {
                reservation_ttl: chrono::Duration::minutes(ttl_minutes),
                max_radius_km,
                currency: optional("PAYMENT_CURRENCY").unwrap_or_else(|| "eur".to_string()),
                success_url: format!("{site_url}/checkout/success?order={{order}}"),
                cancel_url: format!("{site_url}/checkout/cancel?order={{order}}"),
            },
        })
    }
}
