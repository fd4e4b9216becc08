//! In-memory doubles for the store traits, the stock gateway, the geocoder and
//! the payment provider. Stock semantics follow the Postgres gateway: one
//! lock around the whole reservation, all-or-nothing, one hold per order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::types::Json;
use uuid::Uuid;

use crate::app::{AppState, Backends};
use crate::config::OrderConfig;
use crate::db::{CatalogStore, OrderStore, PaymentConfirmation};
use crate::errors::StoreError;
use crate::geocoding::{Coordinates, GeocodeError, Geocoder};
use crate::input::QUANTITY_SCALE;
use crate::models::{
    DeliveryAddress, FulfillmentLine, NewOrder, NewOrderItem, Order, OrderItem, OrderStatus,
    PaymentMethod, PaymentStatus, Product, ProductUnit, StoreSettings,
};
use crate::payment::{
    decode_notification, CheckoutRequest, CheckoutSession, PaymentError, PaymentNotification,
    PaymentProvider,
};
use crate::redis_pub::RedisPublisher;
use crate::stock::{aggregate_lines, StockError, StockGateway};

pub const CLEANUP_SECRET: &str = "cleanup-secret";
pub const ADMIN_SECRET: &str = "admin-secret";
pub const VALID_SIGNATURE: &str = "t=1,v1=valid";

/// Kilometres per degree of latitude on the haversine sphere.
const KM_PER_DEGREE: f64 = 111.194_926_644_558_73;

#[derive(Default)]
struct State {
    settings: Option<StoreSettings>,
    products: HashMap<String, Product>,
    orders: HashMap<Uuid, Order>,
    items: HashMap<Uuid, Vec<OrderItem>>,
    holds: HashMap<Uuid, Vec<(String, Decimal)>>,
}

/// Online, unpaid, still holding stock and past its reservation window.
fn reservation_expired(order: &Order, now: DateTime<Utc>) -> bool {
    order.payment_method == PaymentMethod::CardOnline
        && order.payment_status == PaymentStatus::Pending
        && order.status == OrderStatus::Pending
        && order.stock_reserved
        && order.reserve_expires_at.is_some_and(|at| at < now)
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub fail_items: AtomicBool,
    pub fail_release: AtomicBool,
}

pub fn default_settings() -> StoreSettings {
    StoreSettings {
        delivery_enabled: true,
        store_lat: 0.0,
        store_lng: 0.0,
        base_km: dec!(5),
        base_fee: dec!(2),
        extra_fee_per_km: dec!(1),
        max_km: Some(dec!(20)),
        accepts_cash: true,
        accepts_pos_on_delivery: true,
        accepts_card_online: true,
    }
}

pub fn product(id: &str, name: &str, price: Decimal, unit: ProductUnit, stock: Decimal) -> Product {
    Product {
        id: id.to_string(),
        name: name.to_string(),
        price,
        unit,
        stock,
        stock_unlimited: false,
    }
}

pub fn address() -> DeliveryAddress {
    DeliveryAddress {
        first_name: "Ada".into(),
        last_name: "Rossi".into(),
        line1: "Via Roma 1".into(),
        city: "Torino".into(),
        cap: "10121".into(),
        note: None,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut state = store.lock();
            state.settings = Some(default_settings());
            for p in [
                product("p1", "Pane", dec!(10), ProductUnit::PerUnit, dec!(10)),
                product("p2", "Mele", dec!(2.99), ProductUnit::PerKg, dec!(5)),
            ] {
                state.products.insert(p.id.clone(), p);
            }
            let mut water = product("p3", "Acqua", dec!(0.5), ProductUnit::PerUnit, Decimal::ZERO);
            water.stock_unlimited = true;
            state.products.insert(water.id.clone(), water);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut StoreSettings)) {
        if let Some(settings) = self.lock().settings.as_mut() {
            f(settings);
        }
    }

    pub fn set_stock(&self, product_id: &str, stock: Decimal) {
        if let Some(p) = self.lock().products.get_mut(product_id) {
            p.stock = stock;
        }
    }

    pub fn stock_of(&self, product_id: &str) -> Decimal {
        self.lock().products.get(product_id).map(|p| p.stock).unwrap_or_default()
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.lock().orders.get(&order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    pub fn item_count(&self) -> usize {
        self.lock().items.values().map(Vec::len).sum()
    }

    pub fn holds_stock(&self, order_id: Uuid) -> bool {
        self.lock().holds.contains_key(&order_id)
    }

    pub fn update_order(&self, order_id: Uuid, f: impl FnOnce(&mut Order)) {
        if let Some(order) = self.lock().orders.get_mut(&order_id) {
            f(order);
        }
    }

    /// Seeds an online order that already holds `quantity` of `product_id`,
    /// with its reservation window ending at `expires_at`.
    pub fn seed_online_order(&self, product_id: &str, quantity: Decimal, expires_at: DateTime<Utc>) -> Uuid {
        let order_id = Uuid::new_v4();
        let mut state = self.lock();
        let unit_price = state.products.get(product_id).map(|p| p.price).unwrap_or_default();
        if let Some(p) = state.products.get_mut(product_id) {
            p.stock -= quantity;
        }
        state.orders.insert(
            order_id,
            Order {
                id: order_id,
                public_id: "SEEDED00".into(),
                created_at: Utc::now(),
                status: OrderStatus::Pending,
                payment_method: PaymentMethod::CardOnline,
                payment_status: PaymentStatus::Pending,
                subtotal: quantity * unit_price,
                delivery_fee: dec!(2),
                total: quantity * unit_price + dec!(2),
                distance_km: dec!(3),
                address: Json(address()),
                stock_reserved: true,
                stock_committed: true,
                reserve_expires_at: Some(expires_at),
                payment_session_id: Some("cs_seeded".into()),
            },
        );
        state.items.insert(
            order_id,
            vec![OrderItem {
                id: Uuid::new_v4(),
                order_id,
                position: 0,
                product_id: product_id.to_string(),
                quantity,
                unit_price,
            }],
        );
        state.holds.insert(order_id, vec![(product_id.to_string(), quantity)]);
        order_id
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError> {
        let mut state = self.lock();
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "duplicate order {}",
                order.id
            ))));
        }
        let row = Order {
            id: order.id,
            public_id: order.public_id.clone(),
            created_at: Utc::now(),
            status: OrderStatus::Pending,
            payment_method: order.payment_method,
            payment_status: PaymentStatus::Pending,
            subtotal: order.subtotal,
            delivery_fee: order.delivery_fee,
            total: order.total,
            distance_km: order.distance_km,
            address: Json(order.address.clone()),
            stock_reserved: false,
            stock_committed: false,
            reserve_expires_at: None,
            payment_session_id: None,
        };
        state.orders.insert(order.id, row.clone());
        Ok(row)
    }

    async fn insert_items(&self, order_id: Uuid, items: &[NewOrderItem]) -> Result<(), StoreError> {
        if self.fail_items.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut rows = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            // NUMERIC(12, 3) with CHECK (quantity > 0)
            let quantity = item.quantity.round_dp(QUANTITY_SCALE);
            if quantity <= Decimal::ZERO {
                return Err(StoreError::Database(sqlx::Error::Protocol(
                    "order_items_quantity_check".into(),
                )));
            }
            rows.push(OrderItem {
                id: Uuid::new_v4(),
                order_id,
                position: position as i32,
                product_id: item.product_id.clone(),
                quantity,
                unit_price: item.unit_price,
            });
        }
        self.lock().items.insert(order_id, rows);
        Ok(())
    }

    async fn delete_order(&self, order_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.orders.remove(&order_id);
        state.items.remove(&order_id);
        state.holds.remove(&order_id);
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.order(order_id))
    }

    async fn get_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
        Ok(self.lock().items.get(&order_id).cloned().unwrap_or_default())
    }

    async fn mark_stock_committed(
        &self,
        order_id: Uuid,
        reserve_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        order.stock_committed = true;
        order.stock_reserved = reserve_expires_at.is_some();
        order.reserve_expires_at = reserve_expires_at;
        Ok(())
    }

    async fn set_payment_session(&self, order_id: Uuid, session_id: &str) -> Result<(), StoreError> {
        self.update_order(order_id, |o| o.payment_session_id = Some(session_id.to_string()));
        Ok(())
    }

    async fn confirm_payment(
        &self,
        order_id: Uuid,
        stock_committed: bool,
    ) -> Result<PaymentConfirmation, StoreError> {
        let mut state = self.lock();
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(PaymentConfirmation::NotFound);
        };
        if order.payment_status == PaymentStatus::Paid {
            return Ok(PaymentConfirmation::AlreadyPaid);
        }
        order.payment_status = PaymentStatus::Paid;
        if order.status == OrderStatus::Cancelled {
            return Ok(PaymentConfirmation::OrderCancelled);
        }
        order.status = OrderStatus::Confirmed;
        order.stock_reserved = false;
        order.reserve_expires_at = None;
        order.stock_committed |= stock_committed;
        Ok(PaymentConfirmation::Confirmed)
    }

    async fn cancel_failed_checkout(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.orders.get_mut(&order_id) {
            Some(order)
                if order.payment_status != PaymentStatus::Paid
                    && order.status == OrderStatus::Pending =>
            {
                order.status = OrderStatus::Cancelled;
                order.payment_status = PaymentStatus::Failed;
                order.stock_reserved = false;
                order.reserve_expires_at = None;
                order.stock_committed = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let mut expired: Vec<Order> = self
            .lock()
            .orders
            .values()
            .filter(|o| reservation_expired(o, now))
            .cloned()
            .collect();
        expired.sort_by_key(|o| o.reserve_expires_at);
        Ok(expired)
    }

    async fn cancel_expired(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.orders.get_mut(&order_id) {
            Some(order) if reservation_expired(order, now) => {
                order.status = OrderStatus::Cancelled;
                order.stock_reserved = false;
                order.reserve_expires_at = None;
                order.stock_committed = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_order(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.orders.get_mut(&order_id) {
            Some(order) if order.payment_status != PaymentStatus::Paid => {
                order.status = OrderStatus::Cancelled;
                order.stock_reserved = false;
                order.reserve_expires_at = None;
                order.stock_committed = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn store_settings(&self) -> Result<StoreSettings, StoreError> {
        self.lock().settings.clone().ok_or(StoreError::MissingSettings)
    }

    async fn products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>, StoreError> {
        let state = self.lock();
        Ok(ids.iter().filter_map(|id| state.products.get(id).cloned()).collect())
    }
}

#[async_trait]
impl StockGateway for MemoryStore {
    async fn reserve(&self, order_id: Uuid) -> Result<(), StockError> {
        let mut state = self.lock();
        if !state.orders.contains_key(&order_id) {
            return Err(StockError::OrderNotFound(order_id));
        }
        if state.holds.contains_key(&order_id) {
            return Ok(());
        }

        let lines: Vec<(String, Decimal)> = state
            .items
            .get(&order_id)
            .map(|items| items.iter().map(|i| (i.product_id.clone(), i.quantity)).collect())
            .unwrap_or_default();

        let mut taken = Vec::new();
        for (product_id, qty) in aggregate_lines(&lines) {
            let Some(p) = state.products.get(&product_id) else {
                return Err(StockError::InsufficientStock { product: product_id });
            };
            if p.stock_unlimited {
                continue;
            }
            if p.stock < qty {
                return Err(StockError::InsufficientStock { product: p.name.clone() });
            }
            taken.push((product_id, qty));
        }

        for (product_id, qty) in &taken {
            if let Some(p) = state.products.get_mut(product_id) {
                p.stock -= *qty;
            }
        }
        state.holds.insert(order_id, taken);
        Ok(())
    }

    async fn release(&self, order_id: Uuid) -> Result<(), StockError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StockError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.lock();
        let Some(lines) = state.holds.remove(&order_id) else {
            return Ok(());
        };
        for (product_id, qty) in lines {
            if let Some(p) = state.products.get_mut(&product_id) {
                p.stock += qty;
            }
        }
        Ok(())
    }

    async fn preview(&self, order_id: Uuid) -> Result<Vec<FulfillmentLine>, StockError> {
        let state = self.lock();
        let items = state.items.get(&order_id).cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let p = state.products.get(&item.product_id)?;
                Some(FulfillmentLine {
                    product_id: item.product_id,
                    product_name: p.name.clone(),
                    requested: item.quantity,
                    available: (!p.stock_unlimited).then_some(p.stock),
                    sufficient: p.stock_unlimited || p.stock >= item.quantity,
                })
            })
            .collect())
    }
}

/// Resolves every address to a point `km` north of the store at (0, 0).
pub struct FixedGeocoder {
    result: Result<Option<Coordinates>, ()>,
}

impl FixedGeocoder {
    pub fn at_km(km: f64) -> Self {
        Self {
            result: Ok(Some(Coordinates { lat: km / KM_PER_DEGREE, lng: 0.0 })),
        }
    }

    pub fn not_found() -> Self {
        Self { result: Ok(None) }
    }

    pub fn failing() -> Self {
        Self { result: Err(()) }
    }
}

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.result
            .map_err(|_| GeocodeError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE))
    }
}

/// Hands out sequential session ids; accepts notifications signed with
/// [`VALID_SIGNATURE`].
#[derive(Default)]
pub struct FakePayments {
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<CheckoutRequest>>,
}

impl FakePayments {
    pub fn requests(&self) -> Vec<CheckoutRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PaymentProvider for FakePayments {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("503: checkout unavailable".into()));
        }
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        requests.push(request.clone());
        let id = format!("cs_test_{}", requests.len());
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{id}"),
            id,
        })
    }

    fn parse_notification(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<PaymentNotification, PaymentError> {
        if signature != Some(VALID_SIGNATURE) {
            return Err(PaymentError::InvalidSignature("no matching signature"));
        }
        decode_notification(payload)
    }
}

pub fn order_config() -> OrderConfig {
    OrderConfig {
        reservation_ttl: chrono::Duration::minutes(15),
        max_radius_km: None,
        currency: "eur".into(),
        success_url: "https://shop.test/checkout/success?order={order}".into(),
        cancel_url: "https://shop.test/checkout/cancel?order={order}".into(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub payments: Arc<FakePayments>,
    pub state: AppState,
}

impl Harness {
    pub fn new(geocoder: FixedGeocoder) -> Self {
        Self::with_config(geocoder, order_config())
    }

    pub fn with_config(geocoder: FixedGeocoder, config: OrderConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let payments = Arc::new(FakePayments::default());
        let backends = Backends {
            orders: store.clone(),
            catalog: store.clone(),
            stock: store.clone(),
            geocoder: Arc::new(geocoder),
            payments: payments.clone(),
        };
        let state = AppState::new(
            backends,
            RedisPublisher::new_noop(),
            config,
            Some(CLEANUP_SECRET.to_string()),
            Some(ADMIN_SECRET.to_string()),
        );
        Self { store, payments, state }
    }
}
