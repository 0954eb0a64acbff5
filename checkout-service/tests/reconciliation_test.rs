mod common;

use checkout_service::models::{
    NotificationEvent, PaymentKind, ReconcileOutcome, ResolutionStatus,
};
use checkout_service::services::reconciler::outcome_record_id;
use common::{spawn_app, spawn_app_with_qr, transfer_event};
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::test]
async fn transfer_webhook_settles_the_matching_order() {
    let app = spawn_app();
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Router AX", Decimal::new(1_990_000, 0), 24, 3)
        .await;
    app.add_to_cart(user_id, product.product_id, 2).await;

    let mut notifications = app.engine.notifier.subscribe(user_id);
    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let gencode = order.gencode.clone().unwrap();

    let event = transfer_event(
        order.total_amount,
        &format!("chuyen tien {gencode} don hang"),
    );
    let outcome = app.engine.reconciler.process(event).await.unwrap();

    let record_id = match outcome {
        ReconcileOutcome::Applied {
            record_id,
            order_id,
        } => {
            assert_eq!(order_id, order.order_id);
            record_id
        }
        other => panic!("expected Applied, got {other:?}"),
    };

    let settled = app
        .engine
        .store
        .order(order.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, "paid");

    // The audit record resolved to processed and points at the order.
    let record = app
        .engine
        .store
        .balance_change(record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.resolution_status(), ResolutionStatus::Processed);
    assert_eq!(record.resolved_order_id, Some(order.order_id));
    assert_eq!(record.gencode.as_deref(), Some(gencode.as_str()));

    // Exactly one payment notification, carrying the order lines.
    let note = notifications.recv().await.unwrap();
    assert_eq!(note.event, NotificationEvent::PaymentConfirmed);
    assert_eq!(note.order_id, order.order_id);
    assert_eq!(note.lines.len(), 1);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_delivery_does_not_renotify() {
    let app = spawn_app();
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Webcam", Decimal::new(900_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let mut notifications = app.engine.notifier.subscribe(user_id);
    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let memo = order.gencode.clone().unwrap();

    let first = app
        .engine
        .reconciler
        .process(transfer_event(order.total_amount, &memo))
        .await
        .unwrap();
    assert!(matches!(first, ReconcileOutcome::Applied { .. }));

    let second = app
        .engine
        .reconciler
        .process(transfer_event(order.total_amount, &memo))
        .await
        .unwrap();
    let record_id = match second {
        ReconcileOutcome::AlreadyProcessed {
            record_id,
            order_id,
        } => {
            assert_eq!(order_id, order.order_id);
            record_id
        }
        other => panic!("expected AlreadyProcessed, got {other:?}"),
    };

    let record = app
        .engine
        .store
        .balance_change(record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.resolution_status(), ResolutionStatus::Duplicate);

    // Only the first delivery notified.
    assert!(notifications.recv().await.is_some());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn memo_without_gencode_is_logged_as_unmatched() {
    let app = spawn_app();

    let event = transfer_event(Decimal::new(500_000, 0), "tien thue nha thang 8");
    let outcome = app.engine.reconciler.process(event).await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Unmatched { .. }));
    let record_id = outcome_record_id(&outcome);

    // The raw event is still on the books for manual review.
    let record = app
        .engine
        .store
        .balance_change(record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.resolution_status(), ResolutionStatus::Failed);
    assert!(record.gencode.is_none());
    assert!(record.raw_payload.contains("tien thue nha"));
}

#[tokio::test]
async fn gencode_with_no_open_order_is_unresolved() {
    let app = spawn_app();

    let event = transfer_event(Decimal::new(500_000, 0), "PAYZZ999");
    let outcome = app.engine.reconciler.process(event).await.unwrap();

    assert!(matches!(
        outcome,
        ReconcileOutcome::Unresolved { ref gencode, .. } if gencode == "PAYZZ999"
    ));
    let record = app
        .engine
        .store
        .balance_change(outcome_record_id(&outcome))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.resolution_status(), ResolutionStatus::Failed);
}

#[tokio::test]
async fn amount_mismatch_still_settles_with_a_warning() {
    let app = spawn_app();
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Power Bank", Decimal::new(650_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let memo = order.gencode.clone().unwrap();

    // Underpaid by 150k; the transfer is applied anyway.
    let outcome = app
        .engine
        .reconciler
        .process(transfer_event(Decimal::new(500_000, 0), &memo))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));

    let settled = app
        .engine
        .store
        .order(order.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, "paid");
}

#[tokio::test]
async fn expired_snapshot_falls_back_to_the_durable_index() {
    // Zero TTL: every snapshot is already expired when read.
    let app = spawn_app_with_qr("http://127.0.0.1:9", 0);
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Mesh Node", Decimal::new(1_500_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let gencode = order.gencode.clone().unwrap();

    // Prime the cache the way QR issuance would, then let it expire.
    let lines = app.engine.store.order_lines(order.order_id).await.unwrap();
    let record = app
        .engine
        .store
        .order(order.order_id)
        .await
        .unwrap()
        .unwrap();
    app.engine.cache.set(
        &record,
        lines
            .iter()
            .map(checkout_service::models::SnapshotLine::from)
            .collect(),
    );
    assert!(app.engine.cache.get(&gencode).is_none(), "TTL 0 must expire");

    let outcome = app
        .engine
        .reconciler
        .process(transfer_event(order.total_amount, &gencode))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
}

#[tokio::test]
async fn memo_extraction_prefers_content_over_description() {
    let app = spawn_app();
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Dock Station", Decimal::new(2_400_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let gencode = order.gencode.clone().unwrap();

    let mut event = transfer_event(order.total_amount, &format!("ck {gencode}"));
    event.description = Some("PAYQQ777 stale memo".to_string());

    let outcome = app.engine.reconciler.process(event).await.unwrap();
    match outcome {
        ReconcileOutcome::Applied { order_id, .. } => assert_eq!(order_id, order.order_id),
        other => panic!("expected Applied via content memo, got {other:?}"),
    }
}
