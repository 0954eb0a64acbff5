//! Checkout orchestration over the [`Store`] seam.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{CheckoutError, OrderDraft, OrderProjection, OrderSource, PaymentKind};
use crate::services::metrics::CHECKOUT_OPERATIONS;
use crate::services::store::Store;

/// Places orders from carts and from direct single-product requests.
#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn Store>,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Place an order from the user's cart. The cart is consumed on
    /// success and left untouched on any failure.
    #[instrument(skip(self), fields(user_id = %user_id, payment = payment.as_str()))]
    pub async fn checkout(
        &self,
        user_id: Uuid,
        payment: PaymentKind,
    ) -> Result<OrderProjection, CheckoutError> {
        let draft = OrderDraft {
            user_id: Some(user_id),
            payment,
            source: OrderSource::Cart,
        };
        self.place(draft, "cart").await
    }

    /// Place an order for a single product without touching any cart.
    /// Used for buy-now flows and smoke checks against live stock.
    #[instrument(skip(self), fields(product_id = %product_id, quantity = quantity))]
    pub async fn test_checkout(
        &self,
        user_id: Option<Uuid>,
        product_id: Uuid,
        quantity: i32,
        payment: PaymentKind,
    ) -> Result<OrderProjection, CheckoutError> {
        if quantity <= 0 {
            CHECKOUT_OPERATIONS
                .with_label_values(&["direct", "rejected"])
                .inc();
            return Err(CheckoutError::InvalidQuantity(quantity));
        }
        let draft = OrderDraft {
            user_id,
            payment,
            source: OrderSource::Direct {
                product_id,
                quantity,
            },
        };
        self.place(draft, "direct").await
    }

    async fn place(
        &self,
        draft: OrderDraft,
        path: &str,
    ) -> Result<OrderProjection, CheckoutError> {
        match self.store.place_order(draft).await {
            Ok(placed) => {
                CHECKOUT_OPERATIONS
                    .with_label_values(&[path, "placed"])
                    .inc();
                info!(
                    order_id = %placed.order.order_id,
                    total = %placed.order.total_amount,
                    lines = placed.lines.len(),
                    warranties = placed.warranties.len(),
                    "Checkout completed"
                );
                Ok(OrderProjection::from(&placed))
            }
            Err(e) => {
                let status = match &e {
                    CheckoutError::Store(_) => "error",
                    _ => "rejected",
                };
                CHECKOUT_OPERATIONS.with_label_values(&[path, status]).inc();
                warn!(error = %e, "Checkout failed");
                Err(e)
            }
        }
    }
}
