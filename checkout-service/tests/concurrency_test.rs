mod common;

use std::sync::Arc;

use checkout_service::models::{CheckoutError, PaymentKind, ReconcileOutcome};
use common::{spawn_app, transfer_event};
use futures::future::join_all;
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let app = Arc::new(spawn_app());
    let stock = 6u32;
    let contenders = 10usize;
    let product = app
        .seed_product("Flash Sale Phone", Decimal::new(9_990_000, 0), 12, stock)
        .await;

    let tasks: Vec<_> = (0..contenders)
        .map(|_| {
            let app = Arc::clone(&app);
            let product_id = product.product_id;
            tokio::spawn(async move {
                app.engine
                    .checkout
                    .test_checkout(Some(Uuid::new_v4()), product_id, 1, PaymentKind::Cod)
                    .await
            })
        })
        .collect();

    let mut placed = 0;
    let mut out_of_stock = 0;
    for joined in join_all(tasks).await {
        match joined.expect("task panicked") {
            Ok(_) => placed += 1,
            Err(CheckoutError::OutOfStock { .. }) => out_of_stock += 1,
            Err(other) => panic!("unexpected checkout error: {other:?}"),
        }
    }

    assert_eq!(placed, stock as usize);
    assert_eq!(out_of_stock, contenders - stock as usize);
    assert_eq!(
        app.engine
            .store
            .available_unit_count(product.product_id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_multi_unit_checkouts_are_all_or_nothing() {
    let app = Arc::new(spawn_app());
    // 5 units, three buyers of 2 each: exactly one buyer must lose.
    let product = app
        .seed_product("Soundbar", Decimal::new(3_500_000, 0), 12, 5)
        .await;

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let app = Arc::clone(&app);
            let product_id = product.product_id;
            tokio::spawn(async move {
                app.engine
                    .checkout
                    .test_checkout(Some(Uuid::new_v4()), product_id, 2, PaymentKind::Cod)
                    .await
            })
        })
        .collect();

    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|j| j.expect("task panicked"))
        .collect();

    let placed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(placed, 2);
    // The loser reserved nothing: 5 - 2*2 = 1 unit remains.
    assert_eq!(
        app.engine
            .store
            .available_unit_count(product.product_id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn opposite_cart_orders_both_check_out() {
    let app = Arc::new(spawn_app());
    let first = app
        .seed_product("CPU", Decimal::new(7_500_000, 0), 36, 4)
        .await;
    let second = app
        .seed_product("Mainboard", Decimal::new(4_200_000, 0), 36, 4)
        .await;

    // Same two products carted in opposite orders by two users.
    let user_a = Uuid::new_v4();
    app.add_to_cart(user_a, first.product_id, 1).await;
    app.add_to_cart(user_a, second.product_id, 1).await;
    let user_b = Uuid::new_v4();
    app.add_to_cart(user_b, second.product_id, 1).await;
    app.add_to_cart(user_b, first.product_id, 1).await;

    let tasks: Vec<_> = [user_a, user_b]
        .into_iter()
        .map(|user_id| {
            let app = Arc::clone(&app);
            tokio::spawn(
                async move { app.engine.checkout.checkout(user_id, PaymentKind::Cod).await },
            )
        })
        .collect();

    for joined in join_all(tasks).await {
        let order = joined
            .expect("task panicked")
            .expect("both checkouts must succeed with sufficient stock");
        assert_eq!(order.lines.len(), 2);
    }

    assert_eq!(
        app.engine
            .store
            .available_unit_count(first.product_id)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        app.engine
            .store
            .available_unit_count(second.product_id)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn duplicate_webhook_deliveries_settle_exactly_once() {
    let app = Arc::new(spawn_app());
    let user_id = Uuid::new_v4();
    let product = app
        .seed_product("Tablet", Decimal::new(8_000_000, 0), 12, 2)
        .await;
    app.add_to_cart(user_id, product.product_id, 1).await;

    let order = app
        .engine
        .checkout
        .checkout(user_id, PaymentKind::Transfer)
        .await
        .unwrap();
    let gencode = order.gencode.clone().unwrap();
    let memo = format!("thanh toan {gencode}");

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let app = Arc::clone(&app);
            let event = transfer_event(order.total_amount, &memo);
            tokio::spawn(async move { app.engine.reconciler.process(event).await })
        })
        .collect();

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|j| j.expect("task panicked").expect("reconcile failed"))
        .collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Applied { .. }))
        .count();
    let duplicate = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::AlreadyProcessed { .. }))
        .count();
    assert_eq!(applied, 1, "exactly one delivery wins the settlement");
    assert_eq!(duplicate, 1);

    let settled = app
        .engine
        .store
        .order(order.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, "paid");
}
