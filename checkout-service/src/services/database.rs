//! Postgres store for checkout-service.
//!
//! The entire allocate-and-persist checkout sequence runs inside one
//! transaction; unit selection takes row locks (`FOR UPDATE`) so two
//! concurrent checkouts can never reserve overlapping serials.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use store_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    generate_serial, warranty_end, BalanceChangeRecord, CartLine, CheckoutError, NewBalanceChange,
    NewProduct, OrderDraft, OrderLine, OrderRecord, OrderSource, PaymentKind, PlacedOrder,
    Product, ResolutionStatus, SerialUnit, SettleOutcome, Warranty,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::payment_code;
use crate::services::store::Store;

const GENCODE_ATTEMPTS: u32 = 5;

const PRODUCT_COLUMNS: &str =
    "product_id, name, unit_price, warranty_months, stock, disabled, image_url, created_utc, updated_utc";
const UNIT_COLUMNS: &str =
    "unit_id, unit_seq, product_id, serial_number, sold, disabled, imported_utc";
const ORDER_COLUMNS: &str =
    "order_id, user_id, total_amount, status, payment_type, gencode, placed_utc, updated_utc";

/// Database connection pool wrapper implementing [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool from config.
    #[instrument(skip(config), fields(service = "checkout-service"))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, new), fields(name = %new.name))]
    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_product"])
            .start_timer();

        let product = sqlx::query_as::<_, Product>(&format!(
            r#"
            INSERT INTO products (product_id, name, unit_price, warranty_months, image_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {PRODUCT_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(new.unit_price)
        .bind(new.warranty_months)
        .bind(&new.image_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create product: {}", e)))?;

        timer.observe_duration();
        info!(product_id = %product.product_id, "Product created");

        Ok(product)
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_product"])
            .start_timer();

        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_id = $1",
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get product: {}", e)))?;

        timer.observe_duration();
        Ok(product)
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn set_product_disabled(
        &self,
        product_id: Uuid,
        disabled: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE products SET disabled = $2, updated_utc = now() WHERE product_id = $1",
        )
        .bind(product_id)
        .bind(disabled)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update product: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "product {} not found",
                product_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %product_id, count = count))]
    async fn increase_stock(
        &self,
        product_id: Uuid,
        count: u32,
    ) -> Result<Vec<SerialUnit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increase_stock"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM products WHERE product_id = $1)")
                .bind(product_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to check product: {}", e))
                })?;
        if !exists {
            tx.rollback().await.ok();
            return Err(AppError::NotFound(anyhow::anyhow!(
                "product {} not found",
                product_id
            )));
        }

        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let unit = sqlx::query_as::<_, SerialUnit>(&format!(
                r#"
                INSERT INTO serial_units (unit_id, product_id, serial_number)
                VALUES ($1, $2, $3)
                RETURNING {UNIT_COLUMNS}
                "#,
            ))
            .bind(Uuid::new_v4())
            .bind(product_id)
            .bind(generate_serial())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert unit: {}", e))
            })?;
            created.push(unit);
        }

        refresh_stock(&mut tx, product_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(product_id = %product_id, created = created.len(), "Stock increased");

        Ok(created)
    }

    #[instrument(skip(self), fields(unit_id = %unit_id))]
    async fn disable_unit(&self, unit_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let product_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE serial_units SET disabled = TRUE WHERE unit_id = $1 RETURNING product_id",
        )
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to disable unit: {}", e)))?;

        let Some(product_id) = product_id else {
            tx.rollback().await.ok();
            return Err(AppError::NotFound(anyhow::anyhow!(
                "unit {} not found",
                unit_id
            )));
        };

        refresh_stock(&mut tx, product_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn available_unit_count(&self, product_id: Uuid) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM serial_units
            WHERE product_id = $1 AND sold = FALSE AND disabled = FALSE
            "#,
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count units: {}", e)))?;
        Ok(count)
    }

    #[instrument(skip(self), fields(user_id = %user_id, product_id = %product_id))]
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

        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_cart_line"])
            .start_timer();

        let product = self
            .product(product_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("product {} not found", product_id)))?;
        if product.disabled {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "product '{}' is disabled",
                product.name
            )));
        }

        let line = sqlx::query_as::<_, CartLine>(
            r#"
            INSERT INTO cart_lines (user_id, product_id, quantity, price_at_add)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, product_id)
            DO UPDATE SET quantity = cart_lines.quantity + EXCLUDED.quantity
            RETURNING user_id, product_id, quantity, price_at_add, added_utc
            "#,
        )
        .bind(user_id)
        .bind(product_id)
        .bind(quantity)
        .bind(product.unit_price)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add cart line: {}", e)))?;

        timer.observe_duration();
        Ok(line)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn cart_lines(&self, user_id: Uuid) -> Result<Vec<CartLine>, AppError> {
        let lines = sqlx::query_as::<_, CartLine>(
            r#"
            SELECT user_id, product_id, quantity, price_at_add, added_utc
            FROM cart_lines WHERE user_id = $1 ORDER BY added_utc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load cart: {}", e)))?;
        Ok(lines)
    }

    #[instrument(skip(self, draft), fields(payment = draft.payment.as_str()))]
    async fn place_order(&self, draft: OrderDraft) -> Result<PlacedOrder, CheckoutError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["place_order"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        // Resolve the draft into (product_id, quantity, price) lines.
        let mut requested: Vec<(Uuid, i32, Option<Decimal>)> = match &draft.source {
            OrderSource::Cart => {
                let user_id = draft.user_id.ok_or(CheckoutError::EmptyCart)?;
                let cart = sqlx::query_as::<_, CartLine>(
                    r#"
                    SELECT user_id, product_id, quantity, price_at_add, added_utc
                    FROM cart_lines WHERE user_id = $1 ORDER BY added_utc
                    "#,
                )
                .bind(user_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| {
                    CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to load cart: {}",
                        e
                    )))
                })?;
                if cart.is_empty() {
                    tx.rollback().await.ok();
                    return Err(CheckoutError::EmptyCart);
                }
                cart.into_iter()
                    .map(|l| (l.product_id, l.quantity, Some(l.price_at_add)))
                    .collect()
            }
            OrderSource::Direct {
                product_id,
                quantity,
            } => {
                if *quantity <= 0 {
                    tx.rollback().await.ok();
                    return Err(CheckoutError::InvalidQuantity(*quantity));
                }
                vec![(*product_id, *quantity, None)]
            }
        };

        // Product row locks are taken in product_id order, the same order
        // for every transaction. Locking in cart order would let two
        // checkouts sharing products deadlock across each other.
        requested.sort_by_key(|(product_id, _, _)| *product_id);

        // Validate and allocate line by line. The product row lock
        // serializes concurrent allocations for the same product.
        let mut resolved: Vec<(Product, i32, Decimal)> = Vec::with_capacity(requested.len());
        let mut reserved: Vec<Vec<SerialUnit>> = Vec::with_capacity(requested.len());

        for (product_id, quantity, price_override) in requested {
            let product = sqlx::query_as::<_, Product>(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_id = $1 FOR UPDATE",
            ))
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to load product: {}",
                    e
                )))
            })?;

            let Some(product) = product else {
                tx.rollback().await.ok();
                return Err(CheckoutError::UnknownProduct(product_id));
            };
            if product.disabled {
                tx.rollback().await.ok();
                return Err(CheckoutError::ProductDisabled {
                    product_id,
                    name: product.name,
                });
            }

            let units = sqlx::query_as::<_, SerialUnit>(&format!(
                r#"
                SELECT {UNIT_COLUMNS} FROM serial_units
                WHERE product_id = $1 AND sold = FALSE AND disabled = FALSE
                ORDER BY unit_seq
                LIMIT $2
                FOR UPDATE
                "#,
            ))
            .bind(product_id)
            .bind(quantity as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to select units: {}",
                    e
                )))
            })?;

            if (units.len() as i32) < quantity {
                let available = units.len() as i32;
                tx.rollback().await.ok();
                return Err(CheckoutError::OutOfStock {
                    product_id,
                    name: product.name,
                    requested: quantity,
                    available,
                });
            }

            let unit_ids: Vec<Uuid> = units.iter().map(|u| u.unit_id).collect();
            sqlx::query("UPDATE serial_units SET sold = TRUE WHERE unit_id = ANY($1)")
                .bind(&unit_ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to mark units sold: {}",
                        e
                    )))
                })?;

            let price = price_override.unwrap_or(product.unit_price);
            resolved.push((product, quantity, price));
            reserved.push(units);
        }

        let total: Decimal = resolved
            .iter()
            .map(|(_, quantity, price)| *price * Decimal::from(*quantity))
            .sum();

        // Gencode uniqueness is checked against open orders only; the
        // partial unique index is the backstop for write races.
        let gencode = if draft.payment == PaymentKind::Transfer {
            let mut candidate = None;
            for _ in 0..GENCODE_ATTEMPTS {
                let code = payment_code::generate();
                let in_use: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM orders WHERE gencode = $1 AND status = 'pending')",
                )
                .bind(&code)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to check gencode: {}",
                        e
                    )))
                })?;
                if !in_use {
                    candidate = Some(code);
                    break;
                }
            }
            match candidate {
                Some(code) => Some(code),
                None => {
                    tx.rollback().await.ok();
                    return Err(CheckoutError::Store(AppError::Conflict(anyhow::anyhow!(
                        "could not issue a unique payment code"
                    ))));
                }
            }
        } else {
            None
        };

        let order_result = sqlx::query_as::<_, OrderRecord>(&format!(
            r#"
            INSERT INTO orders (order_id, user_id, total_amount, status, payment_type, gencode)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING {ORDER_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(draft.user_id)
        .bind(total)
        .bind(draft.payment.as_str())
        .bind(&gencode)
        .fetch_one(&mut *tx)
        .await;

        let order = match order_result {
            Ok(order) => order,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Another checkout won the same gencode between our check
                // and the insert. Rare enough that the caller retries.
                tx.rollback().await.ok();
                return Err(CheckoutError::Store(AppError::Conflict(anyhow::anyhow!(
                    "payment code collided with a concurrent checkout"
                ))));
            }
            Err(e) => {
                tx.rollback().await.ok();
                return Err(CheckoutError::Store(AppError::DatabaseError(
                    anyhow::anyhow!("Failed to insert order: {}", e),
                )));
            }
        };

        let now = Utc::now();
        let mut lines = Vec::with_capacity(resolved.len());
        let mut warranties = Vec::new();
        for ((product, quantity, price), units) in resolved.iter().zip(&reserved) {
            let line = sqlx::query_as::<_, OrderLine>(
                r#"
                INSERT INTO order_lines (order_id, product_id, product_name, quantity, unit_price, image_url)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING order_id, product_id, product_name, quantity, unit_price, image_url, created_utc
                "#,
            )
            .bind(order.order_id)
            .bind(product.product_id)
            .bind(&product.name)
            .bind(quantity)
            .bind(price)
            .bind(&product.image_url)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert order line: {}",
                    e
                )))
            })?;
            lines.push(line);

            if product.warranty_months > 0 {
                let end_utc = warranty_end(now, product.warranty_months);
                for unit in units {
                    let warranty = sqlx::query_as::<_, Warranty>(
                        r#"
                        INSERT INTO warranties (warranty_id, order_id, user_id, product_id, serial_number, start_utc, end_utc)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        RETURNING warranty_id, order_id, user_id, product_id, serial_number, start_utc, end_utc
                        "#,
                    )
                    .bind(Uuid::new_v4())
                    .bind(order.order_id)
                    .bind(draft.user_id)
                    .bind(product.product_id)
                    .bind(&unit.serial_number)
                    .bind(now)
                    .bind(end_utc)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| {
                        CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                            "Failed to insert warranty: {}",
                            e
                        )))
                    })?;
                    warranties.push(warranty);
                }
            }

            refresh_stock(&mut tx, product.product_id)
                .await
                .map_err(CheckoutError::Store)?;
        }

        if let (OrderSource::Cart, Some(user_id)) = (&draft.source, draft.user_id) {
            sqlx::query("DELETE FROM cart_lines WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to clear cart: {}",
                        e
                    )))
                })?;
        }

        tx.commit().await.map_err(|e| {
            CheckoutError::Store(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to commit transaction: {}",
                e
            )))
        })?;

        timer.observe_duration();
        info!(
            order_id = %order.order_id,
            total = %order.total_amount,
            payment = %order.payment_type,
            "Order placed"
        );

        Ok(PlacedOrder {
            order,
            lines,
            warranties,
        })
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, AppError> {
        let order = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1",
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order: {}", e)))?;
        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn order_lines(&self, order_id: Uuid) -> Result<Vec<OrderLine>, AppError> {
        let lines = sqlx::query_as::<_, OrderLine>(
            r#"
            SELECT order_id, product_id, product_name, quantity, unit_price, image_url, created_utc
            FROM order_lines WHERE order_id = $1 ORDER BY product_id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load order lines: {}", e)))?;
        Ok(lines)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn warranties_for_order(&self, order_id: Uuid) -> Result<Vec<Warranty>, AppError> {
        let warranties = sqlx::query_as::<_, Warranty>(
            r#"
            SELECT warranty_id, order_id, user_id, product_id, serial_number, start_utc, end_utc
            FROM warranties WHERE order_id = $1 ORDER BY serial_number
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load warranties: {}", e)))?;
        Ok(warranties)
    }

    #[instrument(skip(self), fields(gencode = %gencode))]
    async fn find_order_by_gencode(
        &self,
        gencode: &str,
    ) -> Result<Option<OrderRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_order_by_gencode"])
            .start_timer();

        // Prefer the open order; fall back to the latest settled one so a
        // duplicate delivery can still be classified.
        let order = sqlx::query_as::<_, OrderRecord>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE gencode = $1 AND status <> 'cancelled'
            ORDER BY CASE WHEN status = 'pending' THEN 0 ELSE 1 END, updated_utc DESC
            LIMIT 1
            "#,
        ))
        .bind(gencode)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to look up gencode: {}", e))
        })?;

        timer.observe_duration();
        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn settle_order(&self, order_id: Uuid) -> Result<SettleOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_order"])
            .start_timer();

        // Compare-and-set: under concurrent deliveries exactly one UPDATE
        // matches the pending row.
        let settled = sqlx::query_as::<_, OrderRecord>(&format!(
            r#"
            UPDATE orders SET status = 'paid', updated_utc = now()
            WHERE order_id = $1 AND status = 'pending'
            RETURNING {ORDER_COLUMNS}
            "#,
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to settle order: {}", e)))?;

        timer.observe_duration();

        if let Some(order) = settled {
            return Ok(SettleOutcome::Settled(order));
        }

        match self.order(order_id).await? {
            Some(order) if order.status == "paid" => Ok(SettleOutcome::AlreadyPaid(order)),
            Some(order) => {
                warn!(order_id = %order_id, status = %order.status, "Order not settleable");
                Ok(SettleOutcome::NotPending(order))
            }
            None => Ok(SettleOutcome::NotFound),
        }
    }

    #[instrument(skip(self, new), fields(transaction_ref = %new.transaction_ref))]
    async fn record_balance_change(
        &self,
        new: NewBalanceChange,
    ) -> Result<BalanceChangeRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_balance_change"])
            .start_timer();

        let record = sqlx::query_as::<_, BalanceChangeRecord>(
            r#"
            INSERT INTO balance_changes (record_id, transaction_ref, amount, memo, raw_payload, gencode)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING record_id, transaction_ref, amount, memo, raw_payload, gencode, resolution, resolved_order_id, received_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.transaction_ref)
        .bind(new.amount)
        .bind(&new.memo)
        .bind(&new.raw_payload)
        .bind(&new.gencode)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record balance change: {}", e))
        })?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn resolve_balance_change(
        &self,
        record_id: Uuid,
        status: ResolutionStatus,
        resolved_order_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE balance_changes SET resolution = $2, resolved_order_id = $3
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .bind(status.as_str())
        .bind(resolved_order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resolve balance change: {}", e))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "balance change {} not found",
                record_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn balance_change(
        &self,
        record_id: Uuid,
    ) -> Result<Option<BalanceChangeRecord>, AppError> {
        let record = sqlx::query_as::<_, BalanceChangeRecord>(
            r#"
            SELECT record_id, transaction_ref, amount, memo, raw_payload, gencode, resolution, resolved_order_id, received_utc
            FROM balance_changes WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get balance change: {}", e))
        })?;
        Ok(record)
    }
}

/// Recompute the cached stock column from the serial ledger.
async fn refresh_stock(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    product_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE products SET
            stock = (
                SELECT COUNT(*) FROM serial_units
                WHERE product_id = $1 AND sold = FALSE AND disabled = FALSE
            ),
            updated_utc = now()
        WHERE product_id = $1
        "#,
    )
    .bind(product_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to refresh stock: {}", e)))?;
    Ok(())
}
