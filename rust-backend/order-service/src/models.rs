use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    PosOnDelivery,
    CardOnline,
}

impl PaymentMethod {
    /// Canonicalises the values storefront clients send, including the
    /// legacy `card` (terminal at the door) and `online` aliases.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "pos_on_delivery" | "card" => Some(Self::PosOnDelivery),
            "card_online" | "online" => Some(Self::CardOnline),
            _ => None,
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, Self::CardOnline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::PosOnDelivery => "pos_on_delivery",
            Self::CardOnline => "card_online",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "product_unit", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProductUnit {
    PerUnit,
    PerKg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    pub first_name: String,
    pub last_name: String,
    pub line1: String,
    pub city: String,
    pub cap: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DeliveryAddress {
    /// Free-text form handed to the geocoder: street, postal code, city.
    pub fn geocode_query(&self) -> String {
        format!("{}, {} {}", self.line1.trim(), self.cap.trim(), self.city.trim())
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub public_id: String,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub subtotal: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub delivery_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub distance_km: Decimal,
    pub address: Json<DeliveryAddress>,
    pub stock_reserved: bool,
    pub stock_committed: bool,
    pub reserve_expires_at: Option<DateTime<Utc>>,
    pub payment_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub public_id: String,
    pub payment_method: PaymentMethod,
    pub subtotal: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub distance_km: Decimal,
    pub address: DeliveryAddress,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub unit: ProductUnit,
    pub stock: Decimal,
    pub stock_unlimited: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct StoreSettings {
    pub delivery_enabled: bool,
    pub store_lat: f64,
    pub store_lng: f64,
    pub base_km: Decimal,
    pub base_fee: Decimal,
    pub extra_fee_per_km: Decimal,
    pub max_km: Option<Decimal>,
    pub accepts_cash: bool,
    pub accepts_pos_on_delivery: bool,
    pub accepts_card_online: bool,
}

impl StoreSettings {
    pub fn accepts(&self, method: PaymentMethod) -> bool {
        match method {
            PaymentMethod::Cash => self.accepts_cash,
            PaymentMethod::PosOnDelivery => self.accepts_pos_on_delivery,
            PaymentMethod::CardOnline => self.accepts_card_online,
        }
    }
}

/// A validated cart line with the catalog data captured at order time.
#[derive(Debug, Clone)]
pub struct PricedLine {
    pub product_id: String,
    pub name: String,
    pub unit: ProductUnit,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl PricedLine {
    pub fn line_total(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

// -- request / response payloads

#[derive(Debug, Deserialize)]
pub struct CartItemInput {
    pub id: Option<String>,
    pub price: Option<Value>,
    pub quantity: Option<Value>,
    pub qty: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct AddressInput {
    #[serde(default, rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, rename = "lastName")]
    pub last_name: Option<String>,
    pub line1: Option<String>,
    pub city: Option<String>,
    pub cap: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub items: Vec<CartItemInput>,
    pub subtotal: Option<Value>,
    pub address: Option<AddressInput>,
    pub payment_method: Option<String>,
    /// Advisory only, the server always recomputes it.
    pub distance_km: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryQuoteRequest {
    pub address: Option<String>,
    pub city: Option<String>,
    pub cap: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryQuote {
    #[serde(with = "rust_decimal::serde::float")]
    pub distance_km: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub delivery_fee: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCreated {
    pub ok: bool,
    pub order_id: Uuid,
    pub public_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub delivery_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub distance_km: Decimal,
    #[serde(rename = "checkoutUrl", skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentLine {
    pub product_id: String,
    pub product_name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub requested: Decimal,
    /// `None` for products sold with unlimited stock.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub available: Option<Decimal>,
    pub sufficient: bool,
}
