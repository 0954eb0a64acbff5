//! Payment-QR issuance.
//!
//! Issuing a QR also primes the reconciliation snapshot cache so the
//! webhook path can match the incoming transfer without a database read.

use std::sync::Arc;

use chrono::Utc;
use store_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    Notification, NotificationEvent, OrderStatus, PaymentMethod, SnapshotLine,
};
use crate::services::cache::SnapshotCache;
use crate::services::notifier::Notifier;
use crate::services::qr::{QrClient, QrPayload};
use crate::services::store::Store;

pub struct PaymentService {
    store: Arc<dyn Store>,
    cache: Arc<SnapshotCache>,
    qr: QrClient,
    notifier: Arc<Notifier>,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<SnapshotCache>,
        qr: QrClient,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            cache,
            qr,
            notifier,
        }
    }

    /// Generate a transfer QR for a pending order owned by `user_id`.
    ///
    /// The order snapshot is cached before the provider call so a transfer
    /// made the instant the QR renders can already be matched. Provider
    /// failure leaves the order and the cache entry intact; the caller may
    /// simply retry.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn generate_qr(
        &self,
        user_id: Option<Uuid>,
        order_id: Uuid,
    ) -> Result<QrPayload, AppError> {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("order {} not found", order_id)))?;

        if order.user_id != user_id {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "order {} not found",
                order_id
            )));
        }
        if order.order_status() != OrderStatus::Pending {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "order {} is not awaiting payment",
                order_id
            )));
        }
        // The tagged method carries the gencode only on its Transfer
        // variant, so a transfer order missing its code cannot pass here.
        let gencode = match order.payment_method() {
            Some(PaymentMethod::Transfer { gencode }) => gencode,
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "order {} is not a bank-transfer order",
                    order_id
                )));
            }
            None => {
                return Err(AppError::InternalError(anyhow::anyhow!(
                    "transfer order {} has no payment code",
                    order_id
                )));
            }
        };

        let lines: Vec<SnapshotLine> = self
            .store
            .order_lines(order_id)
            .await?
            .iter()
            .map(SnapshotLine::from)
            .collect();
        self.cache.set(&order, lines.clone());

        let payload = self.qr.generate(&gencode, order.total_amount).await?;

        info!(order_id = %order_id, gencode = %gencode, "Payment QR issued");
        self.notifier.dispatch(
            order.user_id,
            Notification {
                event: NotificationEvent::QrCodeGenerated,
                order_id,
                amount: order.total_amount,
                gencode: Some(gencode),
                lines,
                sent_utc: Utc::now(),
            },
        );

        Ok(payload)
    }
}
