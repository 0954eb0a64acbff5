//! Configuration for checkout-service.

use std::env;
use store_core::error::AppError;

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub service_name: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub qr_provider: QrProviderConfig,
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Settings for the external QR-image provider (VietQR-compatible API).
#[derive(Debug, Clone)]
pub struct QrProviderConfig {
    pub base_url: String,
    pub account_number: String,
    pub account_name: String,
    /// Acquirer bank identification number.
    pub bank_bin: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Lifetime of an order snapshot in the reconciliation cache.
    pub snapshot_ttl_minutes: i64,
}

impl CheckoutConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "checkout-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
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
            qr_provider: QrProviderConfig {
                base_url: env::var("QR_PROVIDER_URL")
                    .unwrap_or_else(|_| "https://api.vietqr.io".to_string()),
                account_number: env::var("QR_ACCOUNT_NUMBER").unwrap_or_default(),
                account_name: env::var("QR_ACCOUNT_NAME").unwrap_or_default(),
                bank_bin: env::var("QR_BANK_BIN").unwrap_or_default(),
                timeout_secs: env::var("QR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            },
            reconciliation: ReconciliationConfig {
                snapshot_ttl_minutes: env::var("SNAPSHOT_TTL_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
        })
    }
}
