mod common;

use checkout_service::models::{NotificationEvent, PaymentKind};
use common::{spawn_app, spawn_app_with_qr};
use rust_decimal::Decimal;
use serde_json::json;
use store_core::error::AppError;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn qr_issuance_returns_payload_and_primes_the_cache() {
    let server = MockServer::start().await;
    let app = spawn_app_with_qr(&server.uri(), 30);
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Earbuds Pro", Decimal::new(4_500_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let mut notifications = app.engine.notifier.subscribe(user_id);
    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let gencode = order.gencode.clone().unwrap();

    Mock::given(method("POST"))
        .and(path("/v2/generate"))
        .and(body_partial_json(json!({
            "addInfo": gencode,
            "amount": 4_500_000i64,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "00",
            "desc": "Gen VietQR successful!",
            "data": {
                "qrCode": "00020101021238570010A000000727012700069704360113001100223302",
                "qrDataURL": "data:image/png;base64,iVBORw0KGgo="
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payload = app
        .engine
        .payment
        .generate_qr(Some(user_id), order.order_id)
        .await
        .expect("QR issuance failed");

    assert!(payload.qr_code.starts_with("000201"));
    assert!(payload.qr_data_url.is_some());

    // Snapshot is cached under the gencode for the webhook path.
    let snapshot = app.engine.cache.get(&gencode).expect("snapshot missing");
    assert_eq!(snapshot.order_id, order.order_id);
    assert_eq!(snapshot.lines.len(), 1);

    let note = notifications.recv().await.unwrap();
    assert_eq!(note.event, NotificationEvent::QrCodeGenerated);
    assert_eq!(note.gencode.as_deref(), Some(gencode.as_str()));
}

#[tokio::test]
async fn provider_failure_leaves_the_order_pending() {
    let server = MockServer::start().await;
    let app = spawn_app_with_qr(&server.uri(), 30);
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Smart Plug", Decimal::new(300_000, 0), 6, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/v2/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = app
        .engine
        .payment
        .generate_qr(Some(user_id), order.order_id)
        .await;
    assert!(matches!(result, Err(AppError::ExternalService(_))));

    let still = app
        .engine
        .store
        .order(order.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.status, "pending");
}

#[tokio::test]
async fn provider_level_rejection_is_surfaced() {
    let server = MockServer::start().await;
    let app = spawn_app_with_qr(&server.uri(), 30);
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("LED Strip", Decimal::new(250_000, 0), 6, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/v2/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "42",
            "desc": "Invalid acqId",
            "data": null
        })))
        .mount(&server)
        .await;

    let result = app
        .engine
        .payment
        .generate_qr(Some(user_id), order.order_id)
        .await;
    assert!(matches!(result, Err(AppError::ExternalService(msg)) if msg.contains("42")));
}

#[tokio::test]
async fn qr_is_refused_for_foreign_cod_or_missing_orders() {
    let app = spawn_app();
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Desk Lamp", Decimal::new(400_000, 0), 6, 4)
        .await;

    // COD order: nothing to transfer.
    app.add_to_cart(user_id, product.product_id, 1).await;
    let cod = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Cod)
        .await
        .unwrap();
    let result = app.engine.payment.generate_qr(Some(user_id), cod.order_id).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    // Another user's order is reported as not found, not as forbidden.
    app.add_to_cart(user_id, product.product_id, 1).await;
    let transfer = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let result = app
        .engine
        .payment
        .generate_qr(Some(Uuid::new_v4()), transfer.order_id)
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    let result = app
        .engine
        .payment
        .generate_qr(Some(user_id), Uuid::new_v4())
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}
