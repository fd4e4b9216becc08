use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::db::OrderStore;
use crate::errors::{OrderError, StoreError};
use crate::events::{OrderEvent, ORDER_EXPIRED};
use crate::models::{OrderStatus, PaymentStatus};
use crate::redis_pub::RedisPublisher;
use crate::settlement::restore_stock_if_paid;
use crate::stock::StockGateway;

/// Gives back stock held by online orders whose payment window has passed.
///
/// Safe to run concurrently with itself, with order creation and with the
/// payment webhook: `release` is idempotent and the cancel only matches rows
/// that still satisfy the expiry filter.
#[derive(Clone)]
pub struct ReservationSweeper {
    orders: Arc<dyn OrderStore>,
    stock: Arc<dyn StockGateway>,
    events: RedisPublisher,
}

impl ReservationSweeper {
    pub fn new(orders: Arc<dyn OrderStore>, stock: Arc<dyn StockGateway>, events: RedisPublisher) -> Self {
        Self { orders, stock, events }
    }

    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.orders.expired_reservations(now).await?;
        let mut released = 0;

        for order in expired {
            match self.expire(order.id, now).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(order_id = %order.id, error = %e, "failed to release expired reservation")
                }
            }
        }

        if released > 0 {
            tracing::info!(released, "expired reservations released");
        }
        Ok(released)
    }

    async fn expire(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool, OrderError> {
        self.stock.release(order_id).await?;

        if self.orders.cancel_expired(order_id, now).await? {
            let mut event = OrderEvent::new(ORDER_EXPIRED, order_id);
            event.status = Some(OrderStatus::Cancelled);
            event.payment_status = Some(PaymentStatus::Pending);
            self.events.emit(event);
            return Ok(true);
        }

        // another sweeper got here first, or the payment was confirmed meanwhile
        restore_stock_if_paid(self.orders.as_ref(), self.stock.as_ref(), order_id).await;
        Ok(false)
    }
}

pub fn start_reservation_sweeper(sweeper: ReservationSweeper, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            match sweeper.sweep().await {
                Ok(released) => tracing::debug!(released, "reservation sweep complete"),
                Err(e) => tracing::error!(error = %e, "reservation sweep failed"),
            }
        }
    })
}
