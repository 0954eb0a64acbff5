//! Storage seam for the checkout engine.
//!
//! The trait exposes the operations the engine needs at the granularity
//! where atomicity matters: `place_order` covers the entire allocate-and-
//! persist sequence so an implementation can run it inside one transaction.
//! Two implementations exist: `PgStore` (sqlx/Postgres, row-level locking)
//! and `MemoryStore` (mutex-serialized, used by the test suite and
//! embedded deployments).

use async_trait::async_trait;
use store_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    BalanceChangeRecord, CartLine, CheckoutError, NewBalanceChange, NewProduct, OrderDraft,
    OrderLine, OrderRecord, PlacedOrder, Product, ResolutionStatus, SerialUnit, SettleOutcome,
    Warranty,
};

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Catalog / serial ledger
    // ------------------------------------------------------------------

    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError>;

    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, AppError>;

    async fn set_product_disabled(&self, product_id: Uuid, disabled: bool)
        -> Result<(), AppError>;

    /// Explicit stock increase: creates `count` serial units and refreshes
    /// the cached stock column. The only way units come into existence.
    async fn increase_stock(
        &self,
        product_id: Uuid,
        count: u32,
    ) -> Result<Vec<SerialUnit>, AppError>;

    /// Retire a single unit (warranty voided / damaged); it no longer
    /// counts as available and can never be allocated.
    async fn disable_unit(&self, unit_id: Uuid) -> Result<(), AppError>;

    /// Derived availability: count of units with sold=false, disabled=false.
    async fn available_unit_count(&self, product_id: Uuid) -> Result<i64, AppError>;

    // ------------------------------------------------------------------
    // Cart
    // ------------------------------------------------------------------

    /// Add a line to a user's cart, snapshotting the current price.
    /// Re-adding the same product accumulates quantity.
    async fn add_cart_line(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartLine, AppError>;

    async fn cart_lines(&self, user_id: Uuid) -> Result<Vec<CartLine>, AppError>;

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    /// Atomically convert a draft into an order: validate lines, reserve
    /// serial units (all-or-nothing), persist order/lines/warranties,
    /// refresh cached stock, and clear the cart on the cart path. Any
    /// failure leaves no partial state behind.
    async fn place_order(&self, draft: OrderDraft) -> Result<PlacedOrder, CheckoutError>;

    async fn order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, AppError>;

    async fn order_lines(&self, order_id: Uuid) -> Result<Vec<OrderLine>, AppError>;

    async fn warranties_for_order(&self, order_id: Uuid) -> Result<Vec<Warranty>, AppError>;

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Durable fallback lookup: resolve a gencode among orders that are
    /// not cancelled. Paid orders still resolve so duplicate deliveries
    /// can be classified instead of reported as unknown.
    async fn find_order_by_gencode(&self, gencode: &str)
        -> Result<Option<OrderRecord>, AppError>;

    /// Compare-and-set pending -> paid. The arbiter for concurrent
    /// deliveries of the same gencode: exactly one caller observes
    /// `Settled`.
    async fn settle_order(&self, order_id: Uuid) -> Result<SettleOutcome, AppError>;

    // ------------------------------------------------------------------
    // Webhook audit log
    // ------------------------------------------------------------------

    async fn record_balance_change(
        &self,
        new: NewBalanceChange,
    ) -> Result<BalanceChangeRecord, AppError>;

    async fn resolve_balance_change(
        &self,
        record_id: Uuid,
        status: ResolutionStatus,
        resolved_order_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    async fn balance_change(&self, record_id: Uuid)
        -> Result<Option<BalanceChangeRecord>, AppError>;
}
