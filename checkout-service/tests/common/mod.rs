//! Shared test harness: an engine wired over the in-memory store.

use std::sync::{Arc, Once};

use checkout_service::config::QrProviderConfig;
use checkout_service::models::{BankWebhookEvent, NewProduct, Product};
use checkout_service::services::memory::MemoryStore;
use checkout_service::services::qr::QrClient;
use checkout_service::Engine;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var("TEST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "debug".into()),
                )
                .with_test_writer()
                .init();
        }
    });
}

pub struct TestApp {
    pub engine: Engine,
    pub memory: Arc<MemoryStore>,
}

/// Engine over the in-memory store. The QR provider points at a closed
/// port; tests that exercise QR issuance use [`spawn_app_with_qr`] and a
/// mock server instead.
pub fn spawn_app() -> TestApp {
    spawn_app_with_qr("http://127.0.0.1:9", 30)
}

pub fn spawn_app_with_qr(qr_base_url: &str, snapshot_ttl_minutes: i64) -> TestApp {
    init_tracing();

    let memory = Arc::new(MemoryStore::new());
    let qr = QrClient::new(QrProviderConfig {
        base_url: qr_base_url.trim_end_matches('/').to_string(),
        account_number: "0011002233".to_string(),
        account_name: "STORE CO".to_string(),
        bank_bin: "970436".to_string(),
        timeout_secs: 2,
    })
    .expect("failed to build QR client");

    let engine = Engine::build(memory.clone(), qr, snapshot_ttl_minutes);
    TestApp { engine, memory }
}

impl TestApp {
    /// Create a product and import `stock` serial units for it.
    pub async fn seed_product(
        &self,
        name: &str,
        unit_price: Decimal,
        warranty_months: i32,
        stock: u32,
    ) -> Product {
        let product = self
            .engine
            .store
            .create_product(NewProduct {
                name: name.to_string(),
                unit_price,
                warranty_months,
                image_url: None,
            })
            .await
            .expect("failed to create product");
        if stock > 0 {
            self.engine
                .store
                .increase_stock(product.product_id, stock)
                .await
                .expect("failed to import stock");
        }
        product
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        self.engine
            .store
            .add_cart_line(user_id, product_id, quantity)
            .await
            .expect("failed to add cart line");
    }
}

/// Inbound transfer webhook with the memo in `content`.
pub fn transfer_event(amount: Decimal, memo: &str) -> BankWebhookEvent {
    BankWebhookEvent {
        transaction_id: Uuid::new_v4().to_string(),
        amount,
        description: None,
        content: Some(memo.to_string()),
        sender_account: Some("1122334455".to_string()),
        sender_name: Some("NGUYEN VAN A".to_string()),
        receiver_account: Some("0011002233".to_string()),
        receiver_name: Some("STORE CO".to_string()),
        bank_code: Some("VCB".to_string()),
        transaction_utc: Some(Utc::now()),
        direction: Some("in".to_string()),
    }
}
