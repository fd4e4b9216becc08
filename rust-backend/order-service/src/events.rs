use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Order, OrderStatus, PaymentStatus};

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_CONFIRMED: &str = "order.confirmed";
pub const ORDER_CANCELLED: &str = "order.cancelled";
pub const ORDER_EXPIRED: &str = "order.expired";
pub const ORDER_PAYMENT_FAILED: &str = "order.payment_failed";

/// Payload published on the `order.*` Redis channels.
#[derive(Debug, Clone, Serialize)]
pub struct OrderEvent {
    pub event_type: String,
    pub order_id: Uuid,
    pub public_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub total: Option<Decimal>,
    pub stock_committed: Option<bool>,
    pub reserve_expires_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    pub fn new(event_type: &str, order_id: Uuid) -> Self {
        Self {
            event_type: event_type.to_string(),
            order_id,
            public_id: None,
            status: None,
            payment_status: None,
            total: None,
            stock_committed: None,
            reserve_expires_at: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_order(event_type: &str, order: &Order) -> Self {
        Self {
            public_id: Some(order.public_id.clone()),
            status: Some(order.status),
            payment_status: Some(order.payment_status),
            total: Some(order.total),
            stock_committed: Some(order.stock_committed),
            reserve_expires_at: order.reserve_expires_at,
            ..Self::new(event_type, order.id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryAddress, PaymentMethod};
    use rust_decimal_macros::dec;
    use sqlx::types::Json;

    #[test]
    fn order_event_carries_the_reservation_window() {
        let expires_at = Utc::now() + chrono::Duration::minutes(15);
        let order = Order {
            id: Uuid::new_v4(),
            public_id: "3F2B8C1D".into(),
            created_at: Utc::now(),
            status: OrderStatus::Pending,
            payment_method: PaymentMethod::CardOnline,
            payment_status: PaymentStatus::Pending,
            subtotal: dec!(20),
            delivery_fee: dec!(2),
            total: dec!(22),
            distance_km: dec!(3),
            address: Json(DeliveryAddress {
                first_name: "Ada".into(),
                last_name: "Rossi".into(),
                line1: "Via Roma 1".into(),
                city: "Torino".into(),
                cap: "10121".into(),
                note: None,
            }),
            stock_reserved: true,
            stock_committed: true,
            reserve_expires_at: Some(expires_at),
            payment_session_id: Some("cs_test_1".into()),
        };

        let event = OrderEvent::for_order(ORDER_CREATED, &order);

        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.stock_committed, Some(true));
        assert_eq!(event.reserve_expires_at, Some(expires_at));
        assert_eq!(event.total, Some(dec!(22)));

        let bare = OrderEvent::new(ORDER_EXPIRED, order.id);
        assert_eq!(bare.stock_committed, None);
    }
}
