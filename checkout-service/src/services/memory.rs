//! In-memory store.
//!
//! Serializes every operation through one async mutex, which gives the
//! same isolation the Postgres implementation gets from row locks: two
//! concurrent checkouts for one product can never observe the same units
//! as available. Writes are staged and applied at the end of each
//! operation, so a failure mid-way leaves no partial state.
//!
//! Used by the integration test suite and by embedded deployments that do
//! not want an external database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use store_core::error::AppError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    generate_serial, warranty_end, BalanceChangeRecord, CartLine, CheckoutError, NewBalanceChange, NewProduct,
    OrderDraft, OrderLine, OrderRecord, OrderSource, PaymentKind, PlacedOrder, Product,
    ResolutionStatus, SerialUnit, SettleOutcome, Warranty,
};
use crate::services::payment_code;
use crate::services::store::Store;

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    units: Vec<SerialUnit>,
    carts: HashMap<Uuid, Vec<CartLine>>,
    orders: HashMap<Uuid, OrderRecord>,
    order_lines: HashMap<Uuid, Vec<OrderLine>>,
    warranties: HashMap<Uuid, Vec<Warranty>>,
    balance_changes: HashMap<Uuid, BalanceChangeRecord>,
}

impl State {
    fn available_indices(&self, product_id: Uuid) -> Vec<usize> {
        let mut idx: Vec<usize> = self
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.product_id == product_id && !u.sold && !u.disabled)
            .map(|(i, _)| i)
            .collect();
        idx.sort_by_key(|&i| self.units[i].unit_seq);
        idx
    }

    fn refresh_stock(&mut self, product_id: Uuid) {
        let available = self.available_indices(product_id).len() as i32;
        if let Some(product) = self.products.get_mut(&product_id) {
            product.stock = available;
            product.updated_utc = Utc::now();
        }
    }

    fn gencode_in_use(&self, gencode: &str) -> bool {
        self.orders
            .values()
            .any(|o| o.status == "pending" && o.gencode.as_deref() == Some(gencode))
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    unit_seq: AtomicI64,
    fail_order_persist: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            unit_seq: AtomicI64::new(1),
            fail_order_persist: AtomicBool::new(false),
        }
    }

    /// Fault injection for atomicity tests: the next `place_order` fails
    /// after unit selection but before anything is committed.
    pub fn fail_next_order_persist(&self) {
        self.fail_order_persist.store(true, Ordering::SeqCst);
    }

    fn next_seq(&self) -> i64 {
        self.unit_seq.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError> {
        let now = Utc::now();
        let product = Product {
            product_id: Uuid::new_v4(),
            name: new.name,
            unit_price: new.unit_price,
            warranty_months: new.warranty_months,
            stock: 0,
            disabled: false,
            image_url: new.image_url,
            created_utc: now,
            updated_utc: now,
        };
        let mut state = self.state.lock().await;
        state.products.insert(product.product_id, product.clone());
        Ok(product)
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, AppError> {
        let state = self.state.lock().await;
        Ok(state.products.get(&product_id).cloned())
    }

    async fn set_product_disabled(
        &self,
        product_id: Uuid,
        disabled: bool,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("product {} not found", product_id)))?;
        product.disabled = disabled;
        product.updated_utc = Utc::now();
        Ok(())
    }

    async fn increase_stock(
        &self,
        product_id: Uuid,
        count: u32,
    ) -> Result<Vec<SerialUnit>, AppError> {
        let mut state = self.state.lock().await;
        if !state.products.contains_key(&product_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "product {} not found",
                product_id
            )));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let unit = SerialUnit {
                unit_id: Uuid::new_v4(),
                unit_seq: self.next_seq(),
                product_id,
                serial_number: generate_serial(),
                sold: false,
                disabled: false,
                imported_utc: now,
            };
            state.units.push(unit.clone());
            created.push(unit);
        }
        state.refresh_stock(product_id);
        Ok(created)
    }

    async fn disable_unit(&self, unit_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let product_id = {
            let unit = state
                .units
                .iter_mut()
                .find(|u| u.unit_id == unit_id)
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unit {} not found", unit_id)))?;
            unit.disabled = true;
            unit.product_id
        };
        state.refresh_stock(product_id);
        Ok(())
    }

    async fn available_unit_count(&self, product_id: Uuid) -> Result<i64, AppError> {
        let state = self.state.lock().await;
        Ok(state.available_indices(product_id).len() as i64)
    }

    async fn add_cart_line(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartLine, AppError> {
        if quantity <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "quantity must be positive"
            )));
        }
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get(&product_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("product {} not found", product_id)))?;
        if product.disabled {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "product '{}' is disabled",
                product.name
            )));
        }

        let cart = state.carts.entry(user_id).or_default();
        if let Some(line) = cart.iter_mut().find(|l| l.product_id == product_id) {
            line.quantity += quantity;
            return Ok(line.clone());
        }
        let line = CartLine {
            user_id,
            product_id,
            quantity,
            price_at_add: product.unit_price,
            added_utc: Utc::now(),
        };
        cart.push(line.clone());
        Ok(line)
    }

    async fn cart_lines(&self, user_id: Uuid) -> Result<Vec<CartLine>, AppError> {
        let state = self.state.lock().await;
        Ok(state.carts.get(&user_id).cloned().unwrap_or_default())
    }

    async fn place_order(&self, draft: OrderDraft) -> Result<PlacedOrder, CheckoutError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        // Resolve the draft into (product, quantity, price) lines.
        let resolved: Vec<(Product, i32, rust_decimal::Decimal)> = match &draft.source {
            OrderSource::Cart => {
                let user_id = draft.user_id.ok_or(CheckoutError::EmptyCart)?;
                let cart = state.carts.get(&user_id).cloned().unwrap_or_default();
                if cart.is_empty() {
                    return Err(CheckoutError::EmptyCart);
                }
                let mut lines = Vec::with_capacity(cart.len());
                for line in cart {
                    let product = state
                        .products
                        .get(&line.product_id)
                        .cloned()
                        .ok_or(CheckoutError::UnknownProduct(line.product_id))?;
                    lines.push((product, line.quantity, line.price_at_add));
                }
                lines
            }
            OrderSource::Direct {
                product_id,
                quantity,
            } => {
                if *quantity <= 0 {
                    return Err(CheckoutError::InvalidQuantity(*quantity));
                }
                let product = state
                    .products
                    .get(product_id)
                    .cloned()
                    .ok_or(CheckoutError::UnknownProduct(*product_id))?;
                let price = product.unit_price;
                vec![(product, *quantity, price)]
            }
        };

        for (product, _, _) in &resolved {
            if product.disabled {
                return Err(CheckoutError::ProductDisabled {
                    product_id: product.product_id,
                    name: product.name.clone(),
                });
            }
        }

        // Select units for every line before touching anything; a shortfall
        // on any line aborts the whole checkout with nothing reserved.
        let mut claimed: Vec<usize> = Vec::new();
        let mut allocations: Vec<Vec<usize>> = Vec::with_capacity(resolved.len());
        for (product, quantity, _) in &resolved {
            let candidates: Vec<usize> = state
                .available_indices(product.product_id)
                .into_iter()
                .filter(|i| !claimed.contains(i))
                .collect();
            if (candidates.len() as i32) < *quantity {
                return Err(CheckoutError::OutOfStock {
                    product_id: product.product_id,
                    name: product.name.clone(),
                    requested: *quantity,
                    available: candidates.len() as i32,
                });
            }
            let picked: Vec<usize> = candidates.into_iter().take(*quantity as usize).collect();
            claimed.extend(picked.iter().copied());
            allocations.push(picked);
        }

        if self.fail_order_persist.swap(false, Ordering::SeqCst) {
            return Err(CheckoutError::Store(AppError::InternalError(
                anyhow::anyhow!("injected order persistence failure"),
            )));
        }

        let total: rust_decimal::Decimal = resolved
            .iter()
            .map(|(_, quantity, price)| *price * rust_decimal::Decimal::from(*quantity))
            .sum();

        let gencode = match draft.payment {
            PaymentKind::Transfer => {
                let mut candidate = payment_code::generate();
                while state.gencode_in_use(&candidate) {
                    candidate = payment_code::generate();
                }
                Some(candidate)
            }
            _ => None,
        };

        // Commit point: everything below mutates, nothing below can fail.
        let order_id = Uuid::new_v4();
        for picked in &allocations {
            for &i in picked {
                state.units[i].sold = true;
            }
        }

        let order = OrderRecord {
            order_id,
            user_id: draft.user_id,
            total_amount: total,
            status: "pending".to_string(),
            payment_type: draft.payment.as_str().to_string(),
            gencode,
            placed_utc: now,
            updated_utc: now,
        };
        state.orders.insert(order_id, order.clone());

        let mut lines = Vec::with_capacity(resolved.len());
        let mut warranties = Vec::new();
        for ((product, quantity, price), picked) in resolved.iter().zip(&allocations) {
            lines.push(OrderLine {
                order_id,
                product_id: product.product_id,
                product_name: product.name.clone(),
                quantity: *quantity,
                unit_price: *price,
                image_url: product.image_url.clone(),
                created_utc: now,
            });
            if product.warranty_months > 0 {
                for &i in picked {
                    warranties.push(Warranty {
                        warranty_id: Uuid::new_v4(),
                        order_id,
                        user_id: draft.user_id,
                        product_id: product.product_id,
                        serial_number: state.units[i].serial_number.clone(),
                        start_utc: now,
                        end_utc: warranty_end(now, product.warranty_months),
                    });
                }
            }
        }
        state.order_lines.insert(order_id, lines.clone());
        state.warranties.insert(order_id, warranties.clone());

        for (product, _, _) in &resolved {
            state.refresh_stock(product.product_id);
        }

        if let (OrderSource::Cart, Some(user_id)) = (&draft.source, draft.user_id) {
            state.carts.remove(&user_id);
        }

        Ok(PlacedOrder {
            order,
            lines,
            warranties,
        })
    }

    async fn order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn order_lines(&self, order_id: Uuid) -> Result<Vec<OrderLine>, AppError> {
        let state = self.state.lock().await;
        Ok(state.order_lines.get(&order_id).cloned().unwrap_or_default())
    }

    async fn warranties_for_order(&self, order_id: Uuid) -> Result<Vec<Warranty>, AppError> {
        let state = self.state.lock().await;
        Ok(state.warranties.get(&order_id).cloned().unwrap_or_default())
    }

    async fn find_order_by_gencode(
        &self,
        gencode: &str,
    ) -> Result<Option<OrderRecord>, AppError> {
        let state = self.state.lock().await;
        // Prefer the open order; fall back to a settled one so duplicate
        // deliveries can still be classified.
        let mut paid_match: Option<&OrderRecord> = None;
        for order in state.orders.values() {
            if order.gencode.as_deref() != Some(gencode) || order.status == "cancelled" {
                continue;
            }
            if order.status == "pending" {
                return Ok(Some(order.clone()));
            }
            if paid_match.map_or(true, |o| o.updated_utc < order.updated_utc) {
                paid_match = Some(order);
            }
        }
        Ok(paid_match.cloned())
    }

    async fn settle_order(&self, order_id: Uuid) -> Result<SettleOutcome, AppError> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(SettleOutcome::NotFound);
        };
        match order.status.as_str() {
            "pending" => {
                order.status = "paid".to_string();
                order.updated_utc = Utc::now();
                Ok(SettleOutcome::Settled(order.clone()))
            }
            "paid" => Ok(SettleOutcome::AlreadyPaid(order.clone())),
            _ => Ok(SettleOutcome::NotPending(order.clone())),
        }
    }

    async fn record_balance_change(
        &self,
        new: NewBalanceChange,
    ) -> Result<BalanceChangeRecord, AppError> {
        let record = BalanceChangeRecord {
            record_id: Uuid::new_v4(),
            transaction_ref: new.transaction_ref,
            amount: new.amount,
            memo: new.memo,
            raw_payload: new.raw_payload,
            gencode: new.gencode,
            resolution: ResolutionStatus::Pending.as_str().to_string(),
            resolved_order_id: None,
            received_utc: Utc::now(),
        };
        let mut state = self.state.lock().await;
        state.balance_changes.insert(record.record_id, record.clone());
        Ok(record)
    }

    async fn resolve_balance_change(
        &self,
        record_id: Uuid,
        status: ResolutionStatus,
        resolved_order_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let record = state.balance_changes.get_mut(&record_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("balance change {} not found", record_id))
        })?;
        record.resolution = status.as_str().to_string();
        record.resolved_order_id = resolved_order_id;
        Ok(())
    }

    async fn balance_change(
        &self,
        record_id: Uuid,
    ) -> Result<Option<BalanceChangeRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state.balance_changes.get(&record_id).cloned())
    }
}
