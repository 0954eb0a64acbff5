pub mod config;
pub mod models;
pub mod services;

use std::sync::Arc;

use store_core::error::AppError;
use tracing::info;

use crate::config::CheckoutConfig;
use crate::services::cache::SnapshotCache;
use crate::services::checkout::CheckoutService;
use crate::services::database::PgStore;
use crate::services::notifier::Notifier;
use crate::services::payment::PaymentService;
use crate::services::qr::QrClient;
use crate::services::reconciler::WebhookReconciler;
use crate::services::store::Store;

/// Wired checkout engine: one store, one snapshot cache, one notifier,
/// shared by the checkout, payment and reconciliation services.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub cache: Arc<SnapshotCache>,
    pub notifier: Arc<Notifier>,
    pub checkout: CheckoutService,
    pub payment: PaymentService,
    pub reconciler: WebhookReconciler,
}

impl Engine {
    /// Wire the engine over an existing store. Used directly by tests
    /// with an in-memory store.
    pub fn build(store: Arc<dyn Store>, qr: QrClient, snapshot_ttl_minutes: i64) -> Self {
        let cache = Arc::new(SnapshotCache::new(snapshot_ttl_minutes));
        let notifier = Arc::new(Notifier::new());

        let checkout = CheckoutService::new(Arc::clone(&store));
        let payment = PaymentService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            qr,
            Arc::clone(&notifier),
        );
        let reconciler = WebhookReconciler::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&notifier),
        );

        Self {
            store,
            cache,
            notifier,
            checkout,
            payment,
            reconciler,
        }
    }

    /// Connect to Postgres, run migrations and wire the engine.
    pub async fn from_config(config: &CheckoutConfig) -> Result<Self, AppError> {
        info!(service = %config.service_name, "Building checkout engine");

        services::metrics::init_metrics();

        let store = PgStore::connect(&config.database).await?;
        store.run_migrations().await?;

        let qr = QrClient::new(config.qr_provider.clone())?;

        Ok(Self::build(
            Arc::new(store),
            qr,
            config.reconciliation.snapshot_ttl_minutes,
        ))
    }
}
