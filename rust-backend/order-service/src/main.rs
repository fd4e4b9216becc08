use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use dotenvy::dotenv;
use tokio::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use order_service::app::{self, AppState, Backends};
use order_service::config::Config;
use order_service::db::{self, OrderRepo};
use order_service::geocoding::{CachedGeocoder, GeocodeCache, MemoryGeocodeCache, NominatimGeocoder, RedisGeocodeCache};
use order_service::payment::StripeCheckout;
use order_service::redis_pub::RedisPublisher;
use order_service::stock::PgStockGateway;
use order_service::worker::{start_reservation_sweeper, ReservationSweeper};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    let config = Config::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);

    let pool = db::get_db_pool(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;

    let events = match config.redis_url.as_deref().map(RedisPublisher::new) {
        Some(Ok(publisher)) => publisher,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "invalid REDIS_URL, continuing without event publishing");
            RedisPublisher::new_noop()
        }
        None => {
            tracing::info!("no REDIS_URL configured, using no-op publisher");
            RedisPublisher::new_noop()
        }
    };

    let cache: Box<dyn GeocodeCache> = match config.redis_url.as_deref() {
        Some(url) => match RedisGeocodeCache::new(url, config.geocode_cache_ttl) {
            Ok(cache) => Box::new(cache),
            Err(e) => {
                tracing::warn!(error = %e, "redis geocode cache unavailable, caching in memory");
                Box::new(MemoryGeocodeCache::new(config.geocode_cache_ttl))
            }
        },
        None => Box::new(MemoryGeocodeCache::new(config.geocode_cache_ttl)),
    };
    let nominatim = NominatimGeocoder::new(
        &config.geocoder_url,
        &config.geocoder_user_agent,
        &config.geocoder_country,
    )?;

    let payments = StripeCheckout::new(
        &config.payment_api_url,
        config.payment_secret_key.clone(),
        config.payment_webhook_secret.clone(),
    )?;
    if config.payment_secret_key.is_none() {
        tracing::warn!("PAYMENT_SECRET_KEY not set, online payment orders will fail");
    }

    let repo = Arc::new(OrderRepo::new(&pool));
    let backends = Backends {
        orders: repo.clone(),
        catalog: repo,
        stock: Arc::new(PgStockGateway::new(&pool)),
        geocoder: Arc::new(CachedGeocoder::new(nominatim, cache)),
        payments: Arc::new(payments),
    };

    let sweeper = ReservationSweeper::new(backends.orders.clone(), backends.stock.clone(), events.clone());
    start_reservation_sweeper(sweeper, Duration::from_secs(config.sweep_interval_secs.max(1)));

    let state = web::Data::new(AppState::new(
        backends,
        events,
        config.order.clone(),
        config.cleanup_secret.clone(),
        config.admin_secret.clone(),
    ));

    tracing::info!(%addr, "order service listening");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(app::configure)
    })
    .bind(&addr)?
    .run()
    .await?;

    Ok(())
}
