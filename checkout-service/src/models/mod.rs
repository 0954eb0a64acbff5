//! Domain models for the checkout engine.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Catalog / Inventory Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    /// Warranty period in months. 0 means the product carries no warranty.
    pub warranty_months: i32,
    /// Cached count of available units, refreshed after every allocation.
    /// Display-only; the serial ledger is the ground truth.
    pub stock: i32,
    pub disabled: bool,
    pub image_url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub unit_price: Decimal,
    pub warranty_months: i32,
    pub image_url: Option<String>,
}

/// One physical, individually trackable unit of a product.
///
/// Units are created by `increase_stock` and never deleted; selling flips
/// `sold`, retiring flips `disabled`. Available stock for a product is
/// always derivable as count(sold=false, disabled=false).
#[derive(Debug, Clone, FromRow)]
pub struct SerialUnit {
    pub unit_id: Uuid,
    /// Monotonic sequence; allocation selects available units in ascending
    /// order so audits read deterministically.
    pub unit_seq: i64,
    pub product_id: Uuid,
    pub serial_number: String,
    pub sold: bool,
    pub disabled: bool,
    pub imported_utc: DateTime<Utc>,
}

/// Generate a serial-number string for a freshly imported unit.
pub fn generate_serial() -> String {
    let token = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("SN-{}", &token[..12])
}

#[derive(Debug, Clone, FromRow)]
pub struct CartLine {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    /// Price snapshot taken when the line was added to the cart.
    pub price_at_add: Decimal,
    pub added_utc: DateTime<Utc>,
}

// ============================================================================
// Order Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "paid" => Self::Paid,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Payment method chosen at checkout time. The code for Transfer orders is
/// generated by the engine, so callers only name the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Cod,
    Transfer,
    Atm,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cod => "COD",
            Self::Transfer => "Transfer",
            Self::Atm => "ATM",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "COD" => Self::Cod,
            "Transfer" => Self::Transfer,
            "ATM" => Self::Atm,
            _ => Self::Cod,
        }
    }
}

/// Payment method as stored on an order. Only the Transfer variant carries
/// a gencode, which makes the "gencode iff Transfer" invariant structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMethod {
    Cod,
    Transfer { gencode: String },
    Atm,
}

impl PaymentMethod {
    pub fn kind(&self) -> PaymentKind {
        match self {
            Self::Cod => PaymentKind::Cod,
            Self::Transfer { .. } => PaymentKind::Transfer,
            Self::Atm => PaymentKind::Atm,
        }
    }

    pub fn gencode(&self) -> Option<&str> {
        match self {
            Self::Transfer { gencode } => Some(gencode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OrderRecord {
    pub order_id: Uuid,
    /// Absent for anonymous/test orders.
    pub user_id: Option<Uuid>,
    pub total_amount: Decimal,
    pub status: String,
    pub payment_type: String,
    pub gencode: Option<String>,
    pub placed_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OrderRecord {
    pub fn order_status(&self) -> OrderStatus {
        OrderStatus::from_str(&self.status)
    }

    pub fn payment_kind(&self) -> PaymentKind {
        PaymentKind::from_str(&self.payment_type)
    }

    /// Structural payment method. Returns None for a row that violates the
    /// gencode/Transfer invariant (should not occur outside manual edits).
    pub fn payment_method(&self) -> Option<PaymentMethod> {
        match self.payment_kind() {
            PaymentKind::Cod => Some(PaymentMethod::Cod),
            PaymentKind::Atm => Some(PaymentMethod::Atm),
            PaymentKind::Transfer => self.gencode.clone().map(|gencode| PaymentMethod::Transfer { gencode }),
        }
    }
}

/// Line of an order. Name, price and image are snapshots taken at purchase
/// time so the order history survives later product edits or deletion.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrderLine {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub image_url: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// One warranty per allocated unit sold, tied to that unit's serial number.
#[derive(Debug, Clone, FromRow)]
pub struct Warranty {
    pub warranty_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub product_id: Uuid,
    pub serial_number: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

/// Warranty end date: start plus the product's period in months.
/// Saturates at `start` on calendar overflow.
pub fn warranty_end(start: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    start
        .checked_add_months(chrono::Months::new(months.max(0) as u32))
        .unwrap_or(start)
}

// ============================================================================
// Checkout Inputs / Outputs
// ============================================================================

#[derive(Debug, Clone)]
pub enum OrderSource {
    /// Consume the user's cart; the consumed lines are deleted on success.
    Cart,
    /// Direct (product, quantity) checkout used by the test/shortcut path.
    Direct { product_id: Uuid, quantity: i32 },
}

#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub user_id: Option<Uuid>,
    pub payment: PaymentKind,
    pub source: OrderSource,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: OrderRecord,
    pub lines: Vec<OrderLine>,
    pub warranties: Vec<Warranty>,
}

/// Order projection returned to the (external) HTTP layer after checkout.
#[derive(Debug, Clone, Serialize)]
pub struct OrderProjection {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: &'static str,
    pub total_amount: Decimal,
    pub payment_type: &'static str,
    pub gencode: Option<String>,
    pub lines: Vec<SnapshotLine>,
}

impl From<&PlacedOrder> for OrderProjection {
    fn from(placed: &PlacedOrder) -> Self {
        Self {
            order_id: placed.order.order_id,
            user_id: placed.order.user_id,
            status: placed.order.order_status().as_str(),
            total_amount: placed.order.total_amount,
            payment_type: placed.order.payment_kind().as_str(),
            gencode: placed.order.gencode.clone(),
            lines: placed.lines.iter().map(SnapshotLine::from).collect(),
        }
    }
}

/// Result of the pending -> paid compare-and-set.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// This caller won the transition.
    Settled(OrderRecord),
    /// The order was already paid (duplicate delivery or lost race).
    AlreadyPaid(OrderRecord),
    /// The order is in a state that cannot settle (cancelled).
    NotPending(OrderRecord),
    NotFound,
}

// ============================================================================
// Reconciliation Models
// ============================================================================

/// Ephemeral cached projection of an order, keyed by gencode. Disposable:
/// losing it only forces the durable fallback lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub gencode: String,
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub total_amount: Decimal,
    pub status: String,
    pub payment_type: String,
    pub lines: Vec<SnapshotLine>,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl OrderSnapshot {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl From<&OrderLine> for SnapshotLine {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id,
            name: line.product_name.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Pending,
    Processed,
    Duplicate,
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processed" => Self::Processed,
            "duplicate" => Self::Duplicate,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Durable audit row for every inbound webhook delivery. Written before
/// matching begins; only the resolution fields are ever updated.
#[derive(Debug, Clone, FromRow)]
pub struct BalanceChangeRecord {
    pub record_id: Uuid,
    pub transaction_ref: String,
    pub amount: Decimal,
    pub memo: String,
    pub raw_payload: String,
    pub gencode: Option<String>,
    pub resolution: String,
    pub resolved_order_id: Option<Uuid>,
    pub received_utc: DateTime<Utc>,
}

impl BalanceChangeRecord {
    pub fn resolution_status(&self) -> ResolutionStatus {
        ResolutionStatus::from_str(&self.resolution)
    }
}

#[derive(Debug, Clone)]
pub struct NewBalanceChange {
    pub transaction_ref: String,
    pub amount: Decimal,
    pub memo: String,
    pub raw_payload: String,
    pub gencode: Option<String>,
}

/// Inbound bank-transfer webhook payload as delivered by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankWebhookEvent {
    pub transaction_id: String,
    pub amount: Decimal,
    /// Free-text transfer memo; some gateways put the memo here.
    pub description: Option<String>,
    /// Alternate memo field used by wallet gateways; checked first.
    pub content: Option<String>,
    pub sender_account: Option<String>,
    pub sender_name: Option<String>,
    pub receiver_account: Option<String>,
    pub receiver_name: Option<String>,
    pub bank_code: Option<String>,
    pub transaction_utc: Option<DateTime<Utc>>,
    /// "in" for inbound credit, "out" for outbound debit.
    pub direction: Option<String>,
}

/// Terminal classification of one webhook delivery.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Order transitioned pending -> paid; notification dispatched.
    Applied { record_id: Uuid, order_id: Uuid },
    /// Order was already paid. Reported as success so the sender stops
    /// retrying; no second notification is emitted.
    AlreadyProcessed { record_id: Uuid, order_id: Uuid },
    /// No gencode token in the memo. Raw event stays logged.
    Unmatched { record_id: Uuid },
    /// Gencode extracted but no open order resolves it (expired snapshot
    /// and no durable match). Manual/ops follow-up; no automatic retry.
    Unresolved { record_id: Uuid, gencode: String },
}

// ============================================================================
// Notification Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationEvent {
    PaymentConfirmed,
    QrCodeGenerated,
}

/// Outbound push carried on a per-user channel. Fire-and-forget: delivery
/// failure never rolls back the payment it reports.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub gencode: Option<String>,
    pub lines: Vec<SnapshotLine>,
    pub sent_utc: DateTime<Utc>,
}

// ============================================================================
// Checkout Error Taxonomy
// ============================================================================

/// Typed checkout rejections. Business-rule failures carry the offending
/// product so the caller can present a specific reason.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("product {0} does not exist")]
    UnknownProduct(Uuid),

    #[error("product '{name}' is disabled")]
    ProductDisabled { product_id: Uuid, name: String },

    #[error("product '{name}' has only {available} unit(s) left, {requested} requested")]
    OutOfStock {
        product_id: Uuid,
        name: String,
        requested: i32,
        available: i32,
    },

    #[error(transparent)]
    Store(#[from] store_core::error::AppError),
}
