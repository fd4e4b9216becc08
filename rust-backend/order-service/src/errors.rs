use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::payment::PaymentError;
use crate::pricing::PricingError;
use crate::stock::StockError;

pub const STOCK_INSUFFICIENT: &str = "STOCK_INSUFFICIENT";
pub const ORDER_ALREADY_PAID: &str = "ORDER_ALREADY_PAID";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store settings are not configured")]
    MissingSettings,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("{0}")]
    Validation(String),
    #[error("delivery is currently unavailable")]
    DeliveryDisabled,
    #[error("address could not be validated")]
    AddressUnresolvable,
    #[error("address is {distance_km} km away, beyond the {max_km} km delivery radius")]
    OutOfDeliveryRadius { distance_km: Decimal, max_km: Decimal },
    #[error(transparent)]
    OutOfServiceArea(#[from] PricingError),
    #[error("payment method '{0}' is not available")]
    PaymentMethodUnavailable(String),
    #[error("Some items are no longer available, please refresh your cart ({product})")]
    StockInsufficient { product: String },
    #[error("order is already paid and cannot be cancelled")]
    AlreadyPaid,
    #[error("order not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("payment session could not be created: {0}")]
    PaymentSession(#[from] PaymentError),
    #[error("stock reservation failed: {0}")]
    Stock(StockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<StockError> for OrderError {
    fn from(err: StockError) -> Self {
        match err {
            StockError::InsufficientStock { product } => OrderError::StockInsufficient { product },
            other => OrderError::Stock(other),
        }
    }
}

impl OrderError {
    /// Machine-readable code for conflicts the client is expected to act on.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            OrderError::StockInsufficient { .. } => Some(STOCK_INSUFFICIENT),
            OrderError::AlreadyPaid => Some(ORDER_ALREADY_PAID),
            _ => None,
        }
    }
}

impl ResponseError for OrderError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrderError::Validation(_)
            | OrderError::DeliveryDisabled
            | OrderError::AddressUnresolvable
            | OrderError::OutOfDeliveryRadius { .. }
            | OrderError::OutOfServiceArea(_)
            | OrderError::PaymentMethodUnavailable(_) => StatusCode::BAD_REQUEST,
            OrderError::StockInsufficient { .. } | OrderError::AlreadyPaid => StatusCode::CONFLICT,
            OrderError::NotFound => StatusCode::NOT_FOUND,
            OrderError::Unauthorized => StatusCode::UNAUTHORIZED,
            OrderError::PaymentSession(_) | OrderError::Stock(_) | OrderError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self.code() {
            Some(code) => json!({ "ok": false, "code": code, "message": self.to_string() }),
            None => json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
