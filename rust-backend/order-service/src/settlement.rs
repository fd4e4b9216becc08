//! What happens to an order after checkout: payment confirmation (webhook or
//! admin), expired/failed checkouts, and customer cancellation.
//!
//! Every path is idempotent. State changes are conditional updates on the
//! order row, so redelivered notifications and a concurrently running sweeper
//! cannot confirm or cancel an order twice.

use std::sync::Arc;

use uuid::Uuid;

use crate::db::{OrderStore, PaymentConfirmation};
use crate::errors::OrderError;
use crate::events::{OrderEvent, ORDER_CANCELLED, ORDER_CONFIRMED, ORDER_PAYMENT_FAILED};
use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::payment::{PaymentEventKind, PaymentNotification};
use crate::redis_pub::RedisPublisher;
use crate::stock::StockGateway;

/// Called when a release raced with a payment confirmation: a paid order
/// must keep its stock, so take it again.
pub(crate) async fn restore_stock_if_paid(
    orders: &dyn OrderStore,
    stock: &dyn StockGateway,
    order_id: Uuid,
) {
    let order = match orders.get_order(order_id).await {
        Ok(Some(order)) => order,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(%order_id, error = %e, "could not reload order after release race");
            return;
        }
    };

    if order.payment_status != PaymentStatus::Paid || order.status == OrderStatus::Cancelled {
        return;
    }

    match stock.reserve(order_id).await {
        Ok(()) => {
            if let Err(e) = orders.mark_stock_committed(order_id, None).await {
                tracing::error!(%order_id, error = %e, "stock re-reserved but flag update failed");
            }
            tracing::warn!(%order_id, "order was paid while its stock was being released; stock re-reserved");
        }
        Err(e) => {
            tracing::error!(%order_id, error = %e, "order paid without stock; manual restock required");
        }
    }
}

#[derive(Clone)]
pub struct OrderSettlement {
    orders: Arc<dyn OrderStore>,
    stock: Arc<dyn StockGateway>,
    events: RedisPublisher,
}

impl OrderSettlement {
    pub fn new(orders: Arc<dyn OrderStore>, stock: Arc<dyn StockGateway>, events: RedisPublisher) -> Self {
        Self { orders, stock, events }
    }

    async fn load(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders.get_order(order_id).await?.ok_or(OrderError::NotFound)
    }

    pub async fn handle_notification(&self, notification: &PaymentNotification) -> Result<(), OrderError> {
        let Some(order_id) = notification.order_id else {
            tracing::warn!(session_id = ?notification.session_id, "payment notification without order reference");
            return Ok(());
        };

        match &notification.kind {
            PaymentEventKind::Completed => {
                self.confirm_payment(order_id).await?;
            }
            PaymentEventKind::Expired | PaymentEventKind::AsyncFailed => {
                self.release_unpaid(order_id).await?;
            }
            PaymentEventKind::Ignored(kind) => {
                tracing::debug!(%order_id, kind = %kind, "ignoring payment notification");
            }
        }
        Ok(())
    }

    /// Marks the order paid and confirmed. A second call for a paid order is a no-op.
    pub async fn confirm_payment(&self, order_id: Uuid) -> Result<PaymentConfirmation, OrderError> {
        let order = self.load(order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            tracing::debug!(%order_id, "payment already recorded");
            return Ok(PaymentConfirmation::AlreadyPaid);
        }

        let mut committed = order.stock_committed;
        let mut reserved_here = false;
        if !committed && order.status != OrderStatus::Cancelled {
            tracing::warn!(%order_id, "paid order holds no stock, attempting fallback reservation");
            match self.stock.reserve(order_id).await {
                Ok(()) => {
                    committed = true;
                    reserved_here = true;
                }
                Err(e) => tracing::error!(%order_id, error = %e, "fallback reservation failed"),
            }
        }

        let outcome = self.orders.confirm_payment(order_id, committed).await?;
        match outcome {
            PaymentConfirmation::Confirmed => {
                tracing::info!(%order_id, "payment confirmed");
                let mut event = OrderEvent::for_order(ORDER_CONFIRMED, &order);
                event.status = Some(OrderStatus::Confirmed);
                event.payment_status = Some(PaymentStatus::Paid);
                self.events.emit(event);
            }
            PaymentConfirmation::AlreadyPaid => {
                if reserved_here {
                    self.orders.mark_stock_committed(order_id, None).await?;
                }
            }
            PaymentConfirmation::OrderCancelled => {
                if reserved_here {
                    self.stock.release(order_id).await?;
                }
                tracing::error!(%order_id, "payment received for a cancelled order; refund required");
            }
            PaymentConfirmation::NotFound => return Err(OrderError::NotFound),
        }
        Ok(outcome)
    }

    /// Ends a checkout that expired or failed: gives the stock back and
    /// cancels the order. Returns whether held stock was released.
    pub async fn release_unpaid(&self, order_id: Uuid) -> Result<bool, OrderError> {
        let order = self.load(order_id).await?;
        if order.payment_status == PaymentStatus::Paid || order.status != OrderStatus::Pending {
            return Ok(false);
        }

        self.stock.release(order_id).await?;
        if self.orders.cancel_failed_checkout(order_id).await? {
            tracing::info!(%order_id, released = order.stock_committed, "checkout ended unpaid, order cancelled");
            let mut event = OrderEvent::for_order(ORDER_PAYMENT_FAILED, &order);
            event.status = Some(OrderStatus::Cancelled);
            event.payment_status = Some(PaymentStatus::Failed);
            self.events.emit(event);
            return Ok(order.stock_committed);
        }

        restore_stock_if_paid(self.orders.as_ref(), self.stock.as_ref(), order_id).await;
        Ok(false)
    }

    /// Customer cancellation. Paid orders are refused; committed stock is
    /// always given back.
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            return Err(OrderError::AlreadyPaid);
        }
        if order.status == OrderStatus::Cancelled {
            return Ok(order);
        }

        self.stock.release(order_id).await?;

        if !self.orders.cancel_order(order_id).await? {
            restore_stock_if_paid(self.orders.as_ref(), self.stock.as_ref(), order_id).await;
            return Err(OrderError::AlreadyPaid);
        }

        let cancelled = self.load(order_id).await?;
        tracing::info!(%order_id, "order cancelled");
        self.events.emit(OrderEvent::for_order(ORDER_CANCELLED, &cancelled));
        Ok(cancelled)
    }
}
