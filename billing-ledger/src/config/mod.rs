//! Configuration module for billing-ledger.
//!
//! Explicit, validated configuration loaded once at startup; invalid values
//! are rejected here rather than tolerated at use time.

use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub tax: TaxConfig,
    pub gateway: GatewayConfig,
    pub billing: BillingRules,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Flat GST-style tax configuration.
#[derive(Debug, Clone)]
pub struct TaxConfig {
    /// Tax rate in percent, applied to the post-discount amount.
    pub rate: Decimal,
    /// Two-digit state code of the platform's place of business.
    pub platform_state_code: String,
}

impl TaxConfig {
    fn validate(self) -> Result<Self, AppError> {
        if self.rate < Decimal::ZERO || self.rate > Decimal::from(100) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TAX_RATE must be between 0 and 100, got {}",
                self.rate
            )));
        }
        if self.platform_state_code.len() != 2
            || !self.platform_state_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PLATFORM_STATE_CODE must be a two-digit GST state code"
            )));
        }
        Ok(self)
    }
}

/// Payment gateway webhook configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub webhook_secret: Secret<String>,
    pub signature_required: bool,
}

/// Business rules that are deployment-specific.
#[derive(Debug, Clone)]
pub struct BillingRules {
    /// Days a past_due subscription waits before grace_elapsed cancels it.
    pub grace_period_days: i64,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let tax = TaxConfig {
            rate: env::var("TAX_RATE")
                .unwrap_or_else(|_| "18".to_string())
                .parse()
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid TAX_RATE: {}", e)))?,
            platform_state_code: env::var("PLATFORM_STATE_CODE")
                .unwrap_or_else(|_| "29".to_string()),
        }
        .validate()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "billing-ledger".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            tax,
            gateway: GatewayConfig {
                webhook_secret: Secret::new(
                    env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_else(|_| "dev-secret".to_string()),
                ),
                signature_required: env::var("GATEWAY_SIGNATURE_REQUIRED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
            },
            billing: BillingRules {
                grace_period_days: env::var("GRACE_PERIOD_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(7),
            },
        })
    }
}
