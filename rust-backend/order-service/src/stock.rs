//! Stock reservation gateway.
//!
//! `reserve` and `release` are the only operations that mutate
//! `products.stock`. Both are idempotent per order and take row locks in a
//! fixed order (order row, hold row, product rows by id) so concurrent orders
//! racing for the same product are serialised by Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::models::FulfillmentLine;

#[derive(Debug, Error)]
pub enum StockError {
    #[error("insufficient stock for {product}")]
    InsufficientStock { product: String },
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait StockGateway: Send + Sync {
    /// All-or-nothing decrement of every limited line item of the order.
    /// No-op while the order already holds stock.
    async fn reserve(&self, order_id: Uuid) -> Result<(), StockError>;
    /// Gives back exactly what `reserve` took. No-op when nothing is held.
    async fn release(&self, order_id: Uuid) -> Result<(), StockError>;
    async fn preview(&self, order_id: Uuid) -> Result<Vec<FulfillmentLine>, StockError>;
}

/// Per-product quantities in line-item order, repeated products summed.
pub fn aggregate_lines(lines: &[(String, Decimal)]) -> Vec<(String, Decimal)> {
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, Decimal> = HashMap::new();

    for (product_id, qty) in lines {
        let entry = totals.entry(product_id.clone()).or_insert_with(|| {
            order.push(product_id.clone());
            Decimal::ZERO
        });
        *entry += *qty;
    }

    order
        .into_iter()
        .map(|id| {
            let qty = totals.get(&id).copied().unwrap_or_default();
            (id, qty)
        })
        .collect()
}

#[derive(Clone)]
pub struct PgStockGateway {
    pool: PgPool,
}

impl PgStockGateway {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    async fn lock_products(
        tx: &mut Transaction<'_, Postgres>,
        product_ids: &[String],
    ) -> Result<HashMap<String, (String, Decimal, bool)>, sqlx::Error> {
        let mut ids = product_ids.to_vec();
        ids.sort();

        let rows = sqlx::query_as::<_, (String, String, Decimal, bool)>(
            r#"
                SELECT id, name, stock, stock_unlimited
                FROM products
                WHERE id = ANY($1)
                ORDER BY id
                FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, stock, unlimited)| (id, (name, stock, unlimited)))
            .collect())
    }
}

#[async_trait]
impl StockGateway for PgStockGateway {
    async fn reserve(&self, order_id: Uuid) -> Result<(), StockError> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_scalar::<_, Uuid>("SELECT id FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;
        if order.is_none() {
            tx.rollback().await?;
            return Err(StockError::OrderNotFound(order_id));
        }

        let hold = sqlx::query_scalar::<_, bool>(
            "SELECT released FROM stock_holds WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;
        if hold == Some(false) {
            // already holding stock for this order
            tx.commit().await?;
            return Ok(());
        }

        let items = sqlx::query_as::<_, (String, Decimal)>(
            "SELECT product_id, quantity FROM order_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await?;
        let wanted = aggregate_lines(&items);

        let product_ids: Vec<String> = wanted.iter().map(|(id, _)| id.clone()).collect();
        let products = Self::lock_products(&mut tx, &product_ids).await?;

        let mut taken: Vec<(String, Decimal)> = Vec::new();
        for (product_id, qty) in &wanted {
            let Some((name, stock, unlimited)) = products.get(product_id) else {
                tx.rollback().await?;
                return Err(StockError::InsufficientStock { product: product_id.clone() });
            };
            if *unlimited {
                continue;
            }
            if stock < qty {
                tx.rollback().await?;
                return Err(StockError::InsufficientStock { product: name.clone() });
            }
            taken.push((product_id.clone(), *qty));
        }

        for (product_id, qty) in &taken {
            sqlx::query("UPDATE products SET stock = stock - $2 WHERE id = $1")
                .bind(product_id)
                .bind(qty)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
                INSERT INTO stock_holds (order_id, released, created_at, released_at)
                VALUES ($1, false, NOW(), NULL)
                ON CONFLICT (order_id)
                DO UPDATE SET released = false, created_at = NOW(), released_at = NULL
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM stock_hold_lines WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        for (product_id, qty) in &taken {
            sqlx::query(
                "INSERT INTO stock_hold_lines (order_id, product_id, quantity) VALUES ($1, $2, $3)",
            )
            .bind(order_id)
            .bind(product_id)
            .bind(qty)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(%order_id, lines = taken.len(), "stock reserved");
        Ok(())
    }

    async fn release(&self, order_id: Uuid) -> Result<(), StockError> {
        let mut tx = self.pool.begin().await?;

        let hold = sqlx::query_scalar::<_, bool>(
            "SELECT released FROM stock_holds WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        if hold != Some(false) {
            // nothing held, or already given back
            tx.rollback().await?;
            return Ok(());
        }

        let lines = sqlx::query_as::<_, (String, Decimal)>(
            "SELECT product_id, quantity FROM stock_hold_lines WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await?;

        let product_ids: Vec<String> = lines.iter().map(|(id, _)| id.clone()).collect();
        Self::lock_products(&mut tx, &product_ids).await?;

        for (product_id, qty) in &lines {
            sqlx::query("UPDATE products SET stock = stock + $2 WHERE id = $1")
                .bind(product_id)
                .bind(qty)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE stock_holds SET released = true, released_at = NOW() WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(%order_id, lines = lines.len(), "stock released");
        Ok(())
    }

    async fn preview(&self, order_id: Uuid) -> Result<Vec<FulfillmentLine>, StockError> {
        let rows = sqlx::query_as::<_, (String, String, Decimal, Decimal, bool)>(
            r#"
                SELECT oi.product_id, p.name, oi.quantity, p.stock, p.stock_unlimited
                FROM order_items oi
                JOIN products p ON p.id = oi.product_id
                WHERE oi.order_id = $1
                ORDER BY oi.position
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(product_id, product_name, requested, stock, unlimited)| FulfillmentLine {
                product_id,
                product_name,
                requested,
                available: (!unlimited).then_some(stock),
                sufficient: unlimited || stock >= requested,
            })
            .collect())
    }
}
