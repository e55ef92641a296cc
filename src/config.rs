// config.rs
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_account_reference: String,
    pub mpesa_callback_url: String,
    pub mpesa_environment: String,
    pub mpesa_base_url: Option<String>,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub admin_groups: Vec<String>,
    pub port: u16,
    pub host: String,
    pub system_id_prefix: String,
    pub publish_process_channel: Option<String>,
    pub allow_query_status: bool,
    pub token_refresh_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_stale_mins: u64,
    pub reconcile_concurrency: usize,
}

/// Endpoints of the Daraja API for the selected environment.
#[derive(Debug, Clone)]
pub struct MpesaUrls {
    pub auth_url: String,
    pub stk_url: String,
    pub query_url: String,
}

/// Values the STK flows need at request time.
#[derive(Debug, Clone)]
pub struct MpesaSettings {
    pub short_code: String,
    pub account_reference: String,
    pub passkey: String,
    pub callback_url: String,
    pub request_cache_ttl: Duration,
    pub push_timeout: Duration,
}

impl MpesaSettings {
    pub fn new(
        short_code: impl Into<String>,
        account_reference: impl Into<String>,
        passkey: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            short_code: short_code.into(),
            account_reference: account_reference.into(),
            passkey: passkey.into(),
            callback_url: callback_url.into(),
            request_cache_ttl: Duration::from_secs(15 * 60),
            push_timeout: Duration::from_secs(15),
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::configuration(format!("{} must be set", name)))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T> {
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::configuration(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mpesa_environment =
            optional("MPESA_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string());

        let admin_groups = optional("ADMIN_GROUPS")
            .unwrap_or_else(|| "admin".to_string())
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();

        let config = AppConfig {
            mpesa_consumer_key: required("MPESA_CONSUMER_KEY")?,
            mpesa_consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            mpesa_short_code: required("MPESA_SHORT_CODE")?,
            mpesa_passkey: required("MPESA_PASSKEY")?,
            mpesa_account_reference: required("MPESA_ACCOUNT_REFERENCE")?,
            mpesa_callback_url: required("MPESA_CALLBACK_URL")?,
            mpesa_environment,
            mpesa_base_url: optional("MPESA_BASE_URL"),
            database_url: required("DATABASE_URL")?,
            redis_url: optional("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            admin_groups,
            port: parsed("PORT", 3000)?,
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            system_id_prefix: optional("STK_SYSTEM_ID_PREFIX")
                .unwrap_or_else(|| "SYS".to_string()),
            publish_process_channel: optional("STK_PUBLISH_PROCESS_CHANNEL"),
            allow_query_status: parsed("STK_ALLOW_QUERY_STATUS", true)?,
            token_refresh_secs: parsed("STK_TOKEN_REFRESH_SECS", 15 * 60)?,
            reconcile_interval_secs: parsed("STK_RECONCILE_INTERVAL_SECS", 5 * 60)?,
            reconcile_stale_mins: parsed("STK_RECONCILE_STALE_MINS", 10)?,
            reconcile_concurrency: parsed("STK_RECONCILE_CONCURRENCY", 5)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.mpesa_environment.as_str() {
            "sandbox" | "production" => {}
            other => {
                return Err(AppError::configuration(format!(
                    "MPESA_ENVIRONMENT must be sandbox or production, got {}",
                    other
                )))
            }
        }
        if self.reconcile_concurrency == 0 {
            return Err(AppError::configuration(
                "STK_RECONCILE_CONCURRENCY must be at least 1",
            ));
        }
        if self.token_refresh_secs == 0 || self.reconcile_interval_secs == 0 {
            return Err(AppError::configuration("worker intervals must be positive"));
        }
        Ok(())
    }

    pub fn get_mpesa_urls(&self) -> MpesaUrls {
        let base_url = match &self.mpesa_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.is_production() => "https://api.safaricom.co.ke".to_string(),
            None => "https://sandbox.safaricom.co.ke".to_string(),
        };

        MpesaUrls {
            auth_url: format!("{}/oauth/v1/generate?grant_type=client_credentials", base_url),
            stk_url: format!("{}/mpesa/stkpush/v1/processrequest", base_url),
            query_url: format!("{}/mpesa/stkpushquery/v1/query", base_url),
        }
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    pub fn mpesa_settings(&self) -> MpesaSettings {
        MpesaSettings::new(
            self.mpesa_short_code.clone(),
            self.mpesa_account_reference.clone(),
            self.mpesa_passkey.clone(),
            self.mpesa_callback_url.clone(),
        )
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.mpesa_environment,
            "is_production": self.is_production(),
            "business_shortcode": self.mpesa_short_code,
            "callback_url": self.mpesa_callback_url,
            "consumer_key_set": !self.mpesa_consumer_key.is_empty(),
            "consumer_secret_set": !self.mpesa_consumer_secret.is_empty(),
            "query_status": self.allow_query_status,
            "process_channel": self.publish_process_channel,
            "port": self.port,
            "host": self.host,
        })
    }
}
