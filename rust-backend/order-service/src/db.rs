use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    NewOrder, NewOrderItem, Order, OrderItem, OrderStatus, PaymentStatus, Product, StoreSettings,
};

pub async fn get_db_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Result of applying a payment confirmation to an order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentConfirmation {
    Confirmed,
    AlreadyPaid,
    /// Payment landed after the order was cancelled; money must be refunded.
    OrderCancelled,
    NotFound,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError>;
    async fn insert_items(&self, order_id: Uuid, items: &[NewOrderItem]) -> Result<(), StoreError>;
    /// Removes the order and, by cascade, its line items and stock ledger.
    async fn delete_order(&self, order_id: Uuid) -> Result<(), StoreError>;
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;
    async fn get_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError>;

    /// Sets `stock_committed`; a `Some` expiry also opens the temporary hold.
    async fn mark_stock_committed(
        &self,
        order_id: Uuid,
        reserve_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn set_payment_session(&self, order_id: Uuid, session_id: &str) -> Result<(), StoreError>;

    async fn confirm_payment(
        &self,
        order_id: Uuid,
        stock_committed: bool,
    ) -> Result<PaymentConfirmation, StoreError>;
    /// Ends a checkout that expired or failed: the order becomes cancelled with
    /// `payment_status=failed`. Returns false when the order is paid or no
    /// longer pending.
    async fn cancel_failed_checkout(&self, order_id: Uuid) -> Result<bool, StoreError>;

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;
    /// Cancels the order only if it still matches the expired-reservation filter.
    async fn cancel_expired(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Cancels any unpaid order.
    async fn cancel_order(&self, order_id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn store_settings(&self) -> Result<StoreSettings, StoreError>;
    async fn products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>, StoreError>;
}

#[derive(Clone)]
pub struct OrderRepo {
    pool: PgPool,
}

impl OrderRepo {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl OrderStore for OrderRepo {
    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, Order>(
            r#"
                INSERT INTO orders (
                    id, public_id, status, payment_method, payment_status,
                    subtotal, delivery_fee, total, distance_km, address,
                    stock_reserved, stock_committed
                )
                VALUES ($1, $2, 'pending', $3, 'pending', $4, $5, $6, $7, $8, false, false)
                RETURNING *
            "#,
        )
        .bind(order.id)
        .bind(&order.public_id)
        .bind(order.payment_method)
        .bind(order.subtotal)
        .bind(order.delivery_fee)
        .bind(order.total)
        .bind(order.distance_km)
        .bind(Json(&order.address))
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_items(&self, order_id: Uuid, items: &[NewOrderItem]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                    INSERT INTO order_items (id, order_id, position, product_id, quantity, unit_price)
                    VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(position as i32)
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(item.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_order(&self, order_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn get_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT * FROM order_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn mark_stock_committed(
        &self,
        order_id: Uuid,
        reserve_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE orders
                SET
                    stock_committed = true,
                    stock_reserved = $2,
                    reserve_expires_at = $3
                WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(reserve_expires_at.is_some())
        .bind(reserve_expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn set_payment_session(&self, order_id: Uuid, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET payment_session_id = $2 WHERE id = $1")
            .bind(order_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn confirm_payment(
        &self,
        order_id: Uuid,
        stock_committed: bool,
    ) -> Result<PaymentConfirmation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, (OrderStatus, PaymentStatus)>(
            "SELECT status, payment_status FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match current {
            None => PaymentConfirmation::NotFound,
            Some((_, PaymentStatus::Paid)) => PaymentConfirmation::AlreadyPaid,
            Some((OrderStatus::Cancelled, _)) => {
                sqlx::query("UPDATE orders SET payment_status = 'paid' WHERE id = $1")
                    .bind(order_id)
                    .execute(&mut *tx)
                    .await?;
                PaymentConfirmation::OrderCancelled
            }
            Some(_) => {
                sqlx::query(
                    r#"
                        UPDATE orders
                        SET
                            payment_status = 'paid',
                            status = 'confirmed',
                            stock_reserved = false,
                            reserve_expires_at = NULL,
                            stock_committed = stock_committed OR $2
                        WHERE id = $1
                    "#,
                )
                .bind(order_id)
                .bind(stock_committed)
                .execute(&mut *tx)
                .await?;
                PaymentConfirmation::Confirmed
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn cancel_failed_checkout(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE orders
                SET
                    status = 'cancelled',
                    payment_status = 'failed',
                    stock_reserved = false,
                    reserve_expires_at = NULL,
                    stock_committed = false
                WHERE id = $1
                AND payment_status <> 'paid'
                AND status = 'pending'
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
                SELECT *
                FROM orders
                WHERE payment_method = 'card_online'
                AND payment_status = 'pending'
                AND status = 'pending'
                AND stock_reserved = true
                AND reserve_expires_at < $1
                ORDER BY reserve_expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn cancel_expired(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE orders
                SET
                    status = 'cancelled',
                    stock_reserved = false,
                    reserve_expires_at = NULL,
                    stock_committed = false
                WHERE id = $1
                AND payment_method = 'card_online'
                AND payment_status = 'pending'
                AND status = 'pending'
                AND stock_reserved = true
                AND reserve_expires_at < $2
            "#,
        )
        .bind(order_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_order(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE orders
                SET
                    status = 'cancelled',
                    stock_reserved = false,
                    reserve_expires_at = NULL,
                    stock_committed = false
                WHERE id = $1 AND payment_status <> 'paid'
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CatalogStore for OrderRepo {
    async fn store_settings(&self) -> Result<StoreSettings, StoreError> {
        sqlx::query_as::<_, StoreSettings>(
            r#"
                SELECT
                    delivery_enabled, store_lat, store_lng, base_km, base_fee,
                    extra_fee_per_km, max_km, accepts_cash, accepts_pos_on_delivery,
                    accepts_card_online
                FROM store_settings
                WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MissingSettings)
    }

    async fn products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>, StoreError> {
        let products = sqlx::query_as::<_, Product>(
            "SELECT id, name, price, unit, stock, stock_unlimited FROM products WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }
}
