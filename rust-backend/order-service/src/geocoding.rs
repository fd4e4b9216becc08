//! Address → coordinates, with a freshness-bounded cache in front of the
//! provider. A `None` result means the address could not be validated; callers
//! must never read it as "zero distance".

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoding provider returned {0}")]
    Status(reqwest::StatusCode),
    #[error("geocoding cache error: {0}")]
    Cache(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// Great-circle distance in km.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Distance rounded to 2 decimals, as stored on the order.
pub fn distance_km(from: Coordinates, to: Coordinates) -> Decimal {
    Decimal::from_f64(haversine_km(from, to))
        .unwrap_or_default()
        .round_dp(2)
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// OpenStreetMap Nominatim search.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    country: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str, country: &str) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            country: country.to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let resp = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("q", address),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", self.country.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(GeocodeError::Status(resp.status()));
        }

        let places: Vec<NominatimPlace> = resp.json().await?;
        Ok(places.into_iter().next().and_then(|place| {
            match (place.lat.parse::<f64>(), place.lon.parse::<f64>()) {
                (Ok(lat), Ok(lng)) => Some(Coordinates { lat, lng }),
                _ => None,
            }
        }))
    }
}

#[async_trait]
pub trait GeocodeCache: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
    async fn put(&self, address: &str, coords: Coordinates) -> Result<(), GeocodeError>;
}

pub struct MemoryGeocodeCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, (Coordinates, DateTime<Utc>)>>,
}

impl MemoryGeocodeCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, address: &str, now: DateTime<Utc>) -> Option<Coordinates> {
        let entries = self.entries.read().ok()?;
        entries
            .get(address)
            .filter(|(_, stored_at)| now - *stored_at < self.ttl)
            .map(|(coords, _)| *coords)
    }

    fn store(&self, address: &str, coords: Coordinates, now: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(address.to_string(), (coords, now));
        }
    }
}

#[async_trait]
impl GeocodeCache for MemoryGeocodeCache {
    async fn get(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        Ok(self.lookup(address, Utc::now()))
    }

    async fn put(&self, address: &str, coords: Coordinates) -> Result<(), GeocodeError> {
        self.store(address, coords, Utc::now());
        Ok(())
    }
}

/// Shares lookups between instances; expiry is left to Redis (`SET EX`).
pub struct RedisGeocodeCache {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisGeocodeCache {
    pub fn new(redis_url: &str, ttl: chrono::Duration) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            ttl_secs: ttl.num_seconds().max(1) as u64,
        })
    }

    fn key(address: &str) -> String {
        format!("geocode:{}", address)
    }
}

#[async_trait]
impl GeocodeCache for RedisGeocodeCache {
    async fn get(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GeocodeError::Cache(e.to_string()))?;
        let raw: Option<String> = conn
            .get(Self::key(address))
            .await
            .map_err(|e| GeocodeError::Cache(e.to_string()))?;

        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn put(&self, address: &str, coords: Coordinates) -> Result<(), GeocodeError> {
        let payload = serde_json::to_string(&coords).map_err(|e| GeocodeError::Cache(e.to_string()))?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GeocodeError::Cache(e.to_string()))?;
        conn.set_ex::<_, _, ()>(Self::key(address), payload, self.ttl_secs)
            .await
            .map_err(|e| GeocodeError::Cache(e.to_string()))
    }
}

/// Cache hits skip the provider entirely; only successful lookups are stored.
/// Cache failures degrade to a provider call instead of failing the request.
pub struct CachedGeocoder<G> {
    inner: G,
    cache: Box<dyn GeocodeCache>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G, cache: Box<dyn GeocodeCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        match self.cache.get(address).await {
            Ok(Some(coords)) => return Ok(Some(coords)),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "geocode cache read failed"),
        }

        let found = self.inner.geocode(address).await?;
        if let Some(coords) = found {
            if let Err(e) = self.cache.put(address, coords).await {
                tracing::warn!(error = %e, "geocode cache write failed");
            }
        }
        Ok(found)
    }
}
