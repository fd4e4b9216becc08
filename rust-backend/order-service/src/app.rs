use std::sync::Arc;

use actix_web::web;

use crate::config::OrderConfig;
use crate::db::{CatalogStore, OrderStore};
use crate::errors::OrderError;
use crate::geocoding::Geocoder;
use crate::orchestrator::OrderOrchestrator;
use crate::payment::PaymentProvider;
use crate::redis_pub::RedisPublisher;
use crate::routes;
use crate::settlement::OrderSettlement;
use crate::stock::StockGateway;
use crate::worker::ReservationSweeper;

/// The collaborators every order flow is built from. Postgres, Nominatim and
/// Stripe in production; in-memory doubles in tests.
#[derive(Clone)]
pub struct Backends {
    pub orders: Arc<dyn OrderStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub stock: Arc<dyn StockGateway>,
    pub geocoder: Arc<dyn Geocoder>,
    pub payments: Arc<dyn PaymentProvider>,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrderOrchestrator,
    pub settlement: OrderSettlement,
    pub sweeper: ReservationSweeper,
    pub payments: Arc<dyn PaymentProvider>,
    pub orders: Arc<dyn OrderStore>,
    pub stock: Arc<dyn StockGateway>,
    pub cleanup_secret: Option<String>,
    pub admin_secret: Option<String>,
}

impl AppState {
    pub fn new(
        backends: Backends,
        events: RedisPublisher,
        config: OrderConfig,
        cleanup_secret: Option<String>,
        admin_secret: Option<String>,
    ) -> Self {
        let orchestrator = OrderOrchestrator::new(&backends, events.clone(), config);
        let settlement = OrderSettlement::new(backends.orders.clone(), backends.stock.clone(), events.clone());
        let sweeper = ReservationSweeper::new(backends.orders.clone(), backends.stock.clone(), events);

        Self {
            orchestrator,
            settlement,
            sweeper,
            payments: backends.payments,
            orders: backends.orders,
            stock: backends.stock,
            cleanup_secret,
            admin_secret,
        }
    }
}

/// Malformed JSON bodies get the same `{error}` shape as validation failures.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| OrderError::Validation(format!("invalid request body: {err}")).into())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(routes::create_order)
        .service(routes::quote_delivery)
        .service(routes::get_order)
        .service(routes::cancel_order)
        .service(routes::mark_paid)
        .service(routes::fulfillment_preview)
        .service(routes::cleanup)
        .service(routes::payment_webhook);
}
