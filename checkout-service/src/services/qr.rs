//! VietQR payment-QR provider client.

use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use store_core::error::AppError;
use tracing::{info, instrument, warn};

use crate::config::QrProviderConfig;
use crate::services::metrics::QR_REQUESTS;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    #[serde(rename = "accountNo")]
    account_no: &'a str,
    #[serde(rename = "accountName")]
    account_name: &'a str,
    #[serde(rename = "acqId")]
    acq_id: &'a str,
    amount: i64,
    #[serde(rename = "addInfo")]
    add_info: &'a str,
    template: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    code: String,
    desc: Option<String>,
    data: Option<QrPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrPayload {
    /// Raw EMVCo QR string.
    #[serde(rename = "qrCode")]
    pub qr_code: String,
    /// Rendered image as a base64 data URL.
    #[serde(rename = "qrDataURL")]
    pub qr_data_url: Option<String>,
}

/// HTTP client for the QR provider. Failures surface as
/// [`AppError::ExternalService`] and never mutate order state.
#[derive(Clone)]
pub struct QrClient {
    client: reqwest::Client,
    config: QrProviderConfig,
}

impl QrClient {
    pub fn new(config: QrProviderConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client, config })
    }

    /// Request a QR image for a bank transfer carrying `gencode` as the
    /// transfer memo.
    #[instrument(skip(self), fields(gencode = %gencode, amount = %amount))]
    pub async fn generate(&self, gencode: &str, amount: Decimal) -> Result<QrPayload, AppError> {
        let amount_units = amount.trunc().to_i64().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("amount {} not representable", amount))
        })?;

        let request = GenerateRequest {
            account_no: &self.config.account_number,
            account_name: &self.config.account_name,
            acq_id: &self.config.bank_bin,
            amount: amount_units,
            add_info: gencode,
            template: "compact2",
        };

        let url = format!("{}/v2/generate", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                QR_REQUESTS.with_label_values(&["transport_error"]).inc();
                AppError::ExternalService(format!("QR provider unreachable: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            QR_REQUESTS.with_label_values(&["http_error"]).inc();
            warn!(status = %status, "QR provider returned error status");
            return Err(AppError::ExternalService(format!(
                "QR provider returned {}",
                status
            )));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            QR_REQUESTS.with_label_values(&["decode_error"]).inc();
            AppError::ExternalService(format!("QR provider response malformed: {}", e))
        })?;

        if body.code != "00" {
            QR_REQUESTS.with_label_values(&["provider_error"]).inc();
            return Err(AppError::ExternalService(format!(
                "QR provider rejected request: {} {}",
                body.code,
                body.desc.unwrap_or_default()
            )));
        }

        let payload = body.data.ok_or_else(|| {
            QR_REQUESTS.with_label_values(&["decode_error"]).inc();
            AppError::ExternalService("QR provider returned success with no data".to_string())
        })?;

        QR_REQUESTS.with_label_values(&["success"]).inc();
        info!("QR code generated");
        Ok(payload)
    }
}
