//! Order creation.
//!
//! No single transaction spans the geocoder, the database writes and the
//! payment provider, so creation runs as a saga: every step that leaves
//! something behind registers its undo, and a failure unwinds them newest
//! first. Stock is only ever touched through the [`StockGateway`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::app::Backends;
use crate::config::OrderConfig;
use crate::db::{CatalogStore, OrderStore};
use crate::errors::OrderError;
use crate::events::{OrderEvent, ORDER_CREATED};
use crate::geocoding::{distance_km, Coordinates, Geocoder};
use crate::input::{is_valid_cap, normalize_address, parse_positive_decimal, parse_quantity};
use crate::models::{
    CreateOrderRequest, DeliveryAddress, DeliveryQuote, DeliveryQuoteRequest, NewOrder,
    NewOrderItem, OrderCreated, PaymentMethod, PricedLine, Product, ProductUnit, StoreSettings,
};
use crate::payment::{checkout_lines, CheckoutRequest, PaymentProvider};
use crate::pricing::{round_money, DeliveryTariff};
use crate::redis_pub::RedisPublisher;
use crate::stock::StockGateway;
use crate::worker::ReservationSweeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Pricing,
    Persisting,
    Reserving,
    Committing,
    PaymentSession,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Pricing => "pricing",
            Stage::Persisting => "persisting",
            Stage::Reserving => "reserving",
            Stage::Committing => "committing",
            Stage::PaymentSession => "payment_session",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compensation {
    DeleteOrder,
    ReleaseStock,
}

/// Undo log for one creation request.
struct Saga<'a> {
    order_id: Uuid,
    orders: &'a dyn OrderStore,
    stock: &'a dyn StockGateway,
    stage: Stage,
    undo: Vec<Compensation>,
}

impl<'a> Saga<'a> {
    fn new(order_id: Uuid, orders: &'a dyn OrderStore, stock: &'a dyn StockGateway) -> Self {
        Self {
            order_id,
            orders,
            stock,
            stage: Stage::Persisting,
            undo: Vec::new(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::debug!(order_id = %self.order_id, stage = stage.as_str(), "order creation stage");
    }

    fn push(&mut self, step: Compensation) {
        self.undo.push(step);
    }

    /// Unwinds every registered step and hands back the error that caused it.
    async fn abort(mut self, err: OrderError) -> OrderError {
        let order_id = self.order_id;
        tracing::warn!(%order_id, stage = self.stage.as_str(), error = %err, "order creation failed, rolling back");

        while let Some(step) = self.undo.pop() {
            match step {
                Compensation::ReleaseStock => {
                    if let Err(e) = self.stock.release(order_id).await {
                        // without the release the rows are the only record of the held stock
                        tracing::error!(%order_id, error = %e, "rollback could not release stock; order kept for manual cancellation");
                        return err;
                    }
                }
                Compensation::DeleteOrder => {
                    if let Err(e) = self.orders.delete_order(order_id).await {
                        tracing::error!(%order_id, error = %e, "rollback could not delete order");
                    }
                }
            }
        }
        err
    }
}

/// A cart that passed validation, priced from the catalog.
#[derive(Debug)]
struct ValidatedCart {
    address: DeliveryAddress,
    payment_method: PaymentMethod,
    lines: Vec<PricedLine>,
    subtotal: Decimal,
}

/// Short, human-friendly order reference shown to customers.
pub fn short_public_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_ascii_uppercase()
}

#[derive(Clone)]
pub struct OrderOrchestrator {
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn CatalogStore>,
    stock: Arc<dyn StockGateway>,
    geocoder: Arc<dyn Geocoder>,
    payments: Arc<dyn PaymentProvider>,
    events: RedisPublisher,
    sweeper: ReservationSweeper,
    config: OrderConfig,
}

impl OrderOrchestrator {
    pub fn new(backends: &Backends, events: RedisPublisher, config: OrderConfig) -> Self {
        let sweeper = ReservationSweeper::new(
            backends.orders.clone(),
            backends.stock.clone(),
            events.clone(),
        );
        Self {
            orders: backends.orders.clone(),
            catalog: backends.catalog.clone(),
            stock: backends.stock.clone(),
            geocoder: backends.geocoder.clone(),
            payments: backends.payments.clone(),
            events,
            sweeper,
            config,
        }
    }

    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<OrderCreated, OrderError> {
        // stock from abandoned checkouts goes back on the shelf before we check it
        if let Err(e) = self.sweeper.sweep().await {
            tracing::warn!(error = %e, "opportunistic reservation sweep failed");
        }

        let settings = self.catalog.store_settings().await?;
        if !settings.delivery_enabled {
            return Err(OrderError::DeliveryDisabled);
        }

        tracing::debug!(stage = Stage::Validating.as_str(), "order creation stage");
        let cart = self.validate(&request).await?;

        tracing::debug!(stage = Stage::Pricing.as_str(), "order creation stage");
        let distance_km = self.resolve_distance(&settings, &cart.address).await?;
        let delivery_fee = DeliveryTariff::from(&settings).fee_for(distance_km)?;
        if !settings.accepts(cart.payment_method) {
            return Err(OrderError::PaymentMethodUnavailable(
                cart.payment_method.as_str().to_string(),
            ));
        }
        let total = round_money(cart.subtotal + delivery_fee);

        let order_id = Uuid::new_v4();
        let public_id = short_public_id(order_id);
        let mut saga = Saga::new(order_id, self.orders.as_ref(), self.stock.as_ref());

        saga.enter(Stage::Persisting);
        let mut order = self
            .orders
            .insert_order(&NewOrder {
                id: order_id,
                public_id: public_id.clone(),
                payment_method: cart.payment_method,
                subtotal: cart.subtotal,
                delivery_fee,
                total,
                distance_km,
                address: cart.address.clone(),
            })
            .await?;
        saga.push(Compensation::DeleteOrder);

        let items: Vec<NewOrderItem> = cart
            .lines
            .iter()
            .map(|line| NewOrderItem {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
            })
            .collect();
        if let Err(e) = self.orders.insert_items(order_id, &items).await {
            return Err(saga.abort(e.into()).await);
        }

        saga.enter(Stage::Reserving);
        if let Err(e) = self.stock.reserve(order_id).await {
            return Err(saga.abort(e.into()).await);
        }
        saga.push(Compensation::ReleaseStock);

        saga.enter(Stage::Committing);
        let online = cart.payment_method.is_online();
        let expires_at = online.then(|| Utc::now() + self.config.reservation_ttl);
        if let Err(e) = self.orders.mark_stock_committed(order_id, expires_at).await {
            return Err(saga.abort(e.into()).await);
        }
        order.stock_committed = true;
        order.stock_reserved = expires_at.is_some();
        order.reserve_expires_at = expires_at;

        let mut checkout_url = None;
        if online {
            saga.enter(Stage::PaymentSession);
            let request = CheckoutRequest {
                order_id,
                public_id: public_id.clone(),
                currency: self.config.currency.clone(),
                lines: checkout_lines(&cart.lines, delivery_fee),
                success_url: self.config.success_url_for(&public_id),
                cancel_url: self.config.cancel_url_for(&public_id),
            };
            let session = match self.payments.create_checkout_session(&request).await {
                Ok(session) => session,
                Err(e) => return Err(saga.abort(e.into()).await),
            };

            match self.orders.set_payment_session(order_id, &session.id).await {
                Ok(()) => order.payment_session_id = Some(session.id),
                Err(e) => tracing::warn!(%order_id, error = %e, "could not store payment session id"),
            }
            checkout_url = Some(session.url);
        }

        saga.enter(Stage::Done);
        tracing::info!(
            %order_id,
            %public_id,
            payment_method = cart.payment_method.as_str(),
            %total,
            "order created"
        );
        self.events.emit(OrderEvent::for_order(ORDER_CREATED, &order));

        Ok(OrderCreated {
            ok: true,
            order_id,
            public_id,
            delivery_fee,
            total,
            distance_km,
            checkout_url,
        })
    }

    /// Geocoding and pricing only; nothing is persisted.
    pub async fn quote_delivery(&self, request: &DeliveryQuoteRequest) -> Result<DeliveryQuote, OrderError> {
        let field = |value: &Option<String>, name: &str| match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(OrderError::Validation(format!("{name} is required"))),
        };
        let line1 = field(&request.address, "address")?;
        let city = field(&request.city, "city")?;
        let cap = field(&request.cap, "cap")?;
        if !is_valid_cap(&cap) {
            return Err(OrderError::Validation(format!("invalid postal code '{cap}'")));
        }

        let settings = self.catalog.store_settings().await?;
        if !settings.delivery_enabled {
            return Err(OrderError::DeliveryDisabled);
        }

        let address = DeliveryAddress {
            first_name: String::new(),
            last_name: String::new(),
            line1,
            city,
            cap,
            note: None,
        };
        let distance_km = self.resolve_distance(&settings, &address).await?;
        let delivery_fee = DeliveryTariff::from(&settings).fee_for(distance_km)?;
        Ok(DeliveryQuote { distance_km, delivery_fee })
    }

    async fn resolve_distance(
        &self,
        settings: &StoreSettings,
        address: &DeliveryAddress,
    ) -> Result<Decimal, OrderError> {
        let query = address.geocode_query();
        let coords = match self.geocoder.geocode(&query).await {
            Ok(Some(coords)) => coords,
            Ok(None) => {
                tracing::info!(address = %query, "address not found by geocoder");
                return Err(OrderError::AddressUnresolvable);
            }
            Err(e) => {
                tracing::warn!(address = %query, error = %e, "geocoding failed");
                return Err(OrderError::AddressUnresolvable);
            }
        };

        let store = Coordinates {
            lat: settings.store_lat,
            lng: settings.store_lng,
        };
        let km = distance_km(store, coords);

        if let Some(max_km) = self.config.max_radius_km {
            if km > max_km {
                return Err(OrderError::OutOfDeliveryRadius { distance_km: km, max_km });
            }
        }
        Ok(km)
    }

    async fn validate(&self, request: &CreateOrderRequest) -> Result<ValidatedCart, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::Validation("cart is empty".into()));
        }

        let address = normalize_address(request.address.as_ref()).map_err(OrderError::Validation)?;

        let raw_method = request.payment_method.as_deref().unwrap_or_default();
        let payment_method = PaymentMethod::from_alias(raw_method)
            .ok_or_else(|| OrderError::PaymentMethodUnavailable(raw_method.to_string()))?;

        let mut wanted = Vec::with_capacity(request.items.len());
        for (n, item) in request.items.iter().enumerate() {
            let product_id = item
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| OrderError::Validation(format!("item {} has no product id", n + 1)))?;
            let quantity = parse_quantity(item.quantity.as_ref().or(item.qty.as_ref()))
                .map_err(|e| OrderError::Validation(format!("invalid quantity for {product_id}: {e}")))?;
            wanted.push((product_id.to_string(), quantity, item.price.as_ref()));
        }

        let mut seen = HashSet::new();
        let ids: Vec<String> = wanted
            .iter()
            .filter(|(id, _, _)| seen.insert(id.clone()))
            .map(|(id, _, _)| id.clone())
            .collect();
        let catalog: HashMap<String, Product> = self
            .catalog
            .products_by_ids(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut lines = Vec::with_capacity(wanted.len());
        for (product_id, quantity, client_price) in wanted {
            let product = catalog
                .get(&product_id)
                .ok_or_else(|| OrderError::Validation(format!("unknown product {product_id}")))?;

            if product.unit == ProductUnit::PerUnit && !quantity.fract().is_zero() {
                return Err(OrderError::Validation(format!(
                    "{} is sold by the piece, quantity must be a whole number",
                    product.name
                )));
            }

            if let Some(raw) = client_price {
                let price = parse_positive_decimal(Some(raw))
                    .map_err(|e| OrderError::Validation(format!("invalid price for {product_id}: {e}")))?;
                if price != product.price {
                    tracing::warn!(%product_id, client = %price, catalog = %product.price, "cart price differs from catalog");
                }
            }

            lines.push(PricedLine {
                product_id,
                name: product.name.clone(),
                unit: product.unit,
                quantity,
                unit_price: product.price,
            });
        }

        let subtotal = round_money(lines.iter().map(PricedLine::line_total).sum());
        if let Some(raw) = request.subtotal.as_ref() {
            let client = parse_positive_decimal(Some(raw))
                .map_err(|e| OrderError::Validation(format!("invalid subtotal: {e}")))?;
            if round_money(client) != subtotal {
                tracing::warn!(client = %client, computed = %subtotal, "cart subtotal differs from catalog");
            }
        }

        Ok(ValidatedCart {
            address,
            payment_method,
            lines,
            subtotal,
        })
    }
}
