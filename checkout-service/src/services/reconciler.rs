//! Bank-webhook reconciliation.
//!
//! Every delivery is persisted as a balance-change record before any
//! matching is attempted, so an unmatched or malformed transfer is never
//! lost. Matching goes snapshot cache first, then the durable gencode
//! index; settlement is a compare-and-set so duplicate deliveries and
//! races collapse to exactly one applied payment.

use std::sync::Arc;

use chrono::Utc;
use store_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    BankWebhookEvent, NewBalanceChange, Notification, NotificationEvent, OrderRecord,
    OrderStatus, ReconcileOutcome, ResolutionStatus, SettleOutcome, SnapshotLine,
};
use crate::services::cache::SnapshotCache;
use crate::services::metrics::WEBHOOK_EVENTS;
use crate::services::notifier::Notifier;
use crate::services::payment_code;
use crate::services::store::Store;

pub struct WebhookReconciler {
    store: Arc<dyn Store>,
    cache: Arc<SnapshotCache>,
    notifier: Arc<Notifier>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn Store>, cache: Arc<SnapshotCache>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            cache,
            notifier,
        }
    }

    /// Process one webhook delivery to a terminal outcome.
    #[instrument(skip(self, event), fields(transaction_id = %event.transaction_id))]
    pub async fn process(&self, event: BankWebhookEvent) -> Result<ReconcileOutcome, AppError> {
        let raw_payload = serde_json::to_string(&event)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("payload serialize: {}", e)))?;

        // Wallet gateways put the memo in `content`, banks in `description`.
        let memo = event
            .content
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(event.description.as_deref())
            .unwrap_or("")
            .to_string();
        let gencode = payment_code::extract(&memo);

        let record = self
            .store
            .record_balance_change(NewBalanceChange {
                transaction_ref: event.transaction_id.clone(),
                amount: event.amount,
                memo: memo.clone(),
                raw_payload,
                gencode: gencode.clone(),
            })
            .await?;

        let Some(gencode) = gencode else {
            warn!(
                record_id = %record.record_id,
                memo = %memo,
                "No payment code in transfer memo, cannot match"
            );
            WEBHOOK_EVENTS.with_label_values(&["unmatched"]).inc();
            self.store
                .resolve_balance_change(record.record_id, ResolutionStatus::Failed, None)
                .await?;
            return Ok(ReconcileOutcome::Unmatched {
                record_id: record.record_id,
            });
        };

        let order = self.locate(&gencode).await?;
        let Some(order) = order else {
            warn!(
                record_id = %record.record_id,
                gencode = %gencode,
                "Payment code resolves to no open order"
            );
            WEBHOOK_EVENTS.with_label_values(&["unresolved"]).inc();
            self.store
                .resolve_balance_change(record.record_id, ResolutionStatus::Failed, None)
                .await?;
            return Ok(ReconcileOutcome::Unresolved {
                record_id: record.record_id,
                gencode,
            });
        };

        if order.order_status() == OrderStatus::Paid {
            info!(
                record_id = %record.record_id,
                order_id = %order.order_id,
                "Order already paid, duplicate delivery"
            );
            WEBHOOK_EVENTS.with_label_values(&["duplicate"]).inc();
            self.store
                .resolve_balance_change(
                    record.record_id,
                    ResolutionStatus::Duplicate,
                    Some(order.order_id),
                )
                .await?;
            return Ok(ReconcileOutcome::AlreadyProcessed {
                record_id: record.record_id,
                order_id: order.order_id,
            });
        }

        // Partial and overpaid transfers still settle; the discrepancy is
        // logged for manual follow-up.
        if event.amount != order.total_amount {
            warn!(
                order_id = %order.order_id,
                expected = %order.total_amount,
                received = %event.amount,
                "Transfer amount differs from order total"
            );
        }

        match self.store.settle_order(order.order_id).await? {
            SettleOutcome::Settled(settled) => {
                self.store
                    .resolve_balance_change(
                        record.record_id,
                        ResolutionStatus::Processed,
                        Some(settled.order_id),
                    )
                    .await?;
                self.cache.remove(&gencode);
                WEBHOOK_EVENTS.with_label_values(&["applied"]).inc();
                info!(
                    record_id = %record.record_id,
                    order_id = %settled.order_id,
                    "Payment applied"
                );

                self.notify_paid(&settled).await;

                Ok(ReconcileOutcome::Applied {
                    record_id: record.record_id,
                    order_id: settled.order_id,
                })
            }
            SettleOutcome::AlreadyPaid(paid) => {
                // Lost the race to a concurrent delivery of the same code.
                self.store
                    .resolve_balance_change(
                        record.record_id,
                        ResolutionStatus::Duplicate,
                        Some(paid.order_id),
                    )
                    .await?;
                WEBHOOK_EVENTS.with_label_values(&["duplicate"]).inc();
                Ok(ReconcileOutcome::AlreadyProcessed {
                    record_id: record.record_id,
                    order_id: paid.order_id,
                })
            }
            SettleOutcome::NotPending(other) => {
                warn!(
                    record_id = %record.record_id,
                    order_id = %other.order_id,
                    status = %other.status,
                    "Matched order cannot settle"
                );
                WEBHOOK_EVENTS.with_label_values(&["unresolved"]).inc();
                self.store
                    .resolve_balance_change(record.record_id, ResolutionStatus::Failed, None)
                    .await?;
                Ok(ReconcileOutcome::Unresolved {
                    record_id: record.record_id,
                    gencode,
                })
            }
            SettleOutcome::NotFound => {
                WEBHOOK_EVENTS.with_label_values(&["unresolved"]).inc();
                self.store
                    .resolve_balance_change(record.record_id, ResolutionStatus::Failed, None)
                    .await?;
                Ok(ReconcileOutcome::Unresolved {
                    record_id: record.record_id,
                    gencode,
                })
            }
        }
    }

    /// Snapshot cache first, durable index as fallback. A cache hit still
    /// re-reads the order row so settlement acts on current status.
    async fn locate(&self, gencode: &str) -> Result<Option<OrderRecord>, AppError> {
        if let Some(snapshot) = self.cache.get(gencode) {
            if let Some(order) = self.store.order(snapshot.order_id).await? {
                return Ok(Some(order));
            }
        }
        self.store.find_order_by_gencode(gencode).await
    }

    async fn notify_paid(&self, order: &OrderRecord) {
        let lines: Vec<SnapshotLine> = match self.store.order_lines(order.order_id).await {
            Ok(lines) => lines.iter().map(SnapshotLine::from).collect(),
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "Failed to load lines for notification");
                Vec::new()
            }
        };
        self.notifier.dispatch(
            order.user_id,
            Notification {
                event: NotificationEvent::PaymentConfirmed,
                order_id: order.order_id,
                amount: order.total_amount,
                gencode: order.gencode.clone(),
                lines,
                sent_utc: Utc::now(),
            },
        );
    }
}

/// Helper for resolving a record id out of any outcome, used by callers
/// that audit the ledger after processing.
pub fn outcome_record_id(outcome: &ReconcileOutcome) -> Uuid {
    match outcome {
        ReconcileOutcome::Applied { record_id, .. }
        | ReconcileOutcome::AlreadyProcessed { record_id, .. }
        | ReconcileOutcome::Unmatched { record_id }
        | ReconcileOutcome::Unresolved { record_id, .. } => *record_id,
    }
}
