pub mod app;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod geocoding;
pub mod input;
pub mod models;
pub mod orchestrator;
pub mod payment;
pub mod pricing;
pub mod redis_pub;
pub mod routes;
pub mod settlement;
pub mod stock;
pub mod worker;

#[cfg(test)]
mod tests;
