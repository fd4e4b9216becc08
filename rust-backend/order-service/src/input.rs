//! Boundary normalisation for storefront payloads.
//!
//! Quantities and prices arrive as JSON numbers or as locale-formatted
//! strings (`"8,5"`). Everything numeric goes through [`parse_positive_decimal`]
//! before it reaches the order flow.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::models::{AddressInput, DeliveryAddress};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("value is missing")]
    Missing,
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("value must be greater than zero")]
    NonPositive,
    #[error("at most {0} decimal places are allowed")]
    TooPrecise(u32),
}

/// Decimal places a stored quantity keeps (`NUMERIC(12, 3)`).
pub const QUANTITY_SCALE: u32 = 3;

pub fn parse_positive_decimal(value: Option<&Value>) -> Result<Decimal, AmountError> {
    let raw = match value {
        None | Some(Value::Null) => return Err(AmountError::Missing),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().replace(',', "."),
        Some(other) => return Err(AmountError::NotANumber(other.to_string())),
    };

    if raw.is_empty() {
        return Err(AmountError::Missing);
    }

    let parsed = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| AmountError::NotANumber(raw.clone()))?;

    if parsed <= Decimal::ZERO {
        return Err(AmountError::NonPositive);
    }

    Ok(parsed.normalize())
}

/// A line quantity: positive, with no more precision than the order items
/// and stock ledger store. `"1.2345"` is refused rather than rounded so the
/// charged quantity is the one reserved.
pub fn parse_quantity(value: Option<&Value>) -> Result<Decimal, AmountError> {
    let qty = parse_positive_decimal(value)?;
    if qty.scale() > QUANTITY_SCALE {
        return Err(AmountError::TooPrecise(QUANTITY_SCALE));
    }
    Ok(qty)
}

/// Five ASCII digits, not all zero.
pub fn is_valid_cap(cap: &str) -> bool {
    cap.len() == 5 && cap.bytes().all(|b| b.is_ascii_digit()) && cap != "00000"
}

fn required(field: Option<&String>, name: &str) -> Result<String, String> {
    match field.map(|s| s.trim()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(format!("address {name} is required")),
    }
}

pub fn normalize_address(input: Option<&AddressInput>) -> Result<DeliveryAddress, String> {
    let input = input.ok_or_else(|| "address is required".to_string())?;

    let line1 = required(input.line1.as_ref(), "line1")?;
    let city = required(input.city.as_ref(), "city")?;
    let cap = required(input.cap.as_ref(), "cap")?;
    if !is_valid_cap(&cap) {
        return Err(format!("invalid postal code '{cap}'"));
    }

    let note = input
        .note
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    Ok(DeliveryAddress {
        first_name: input.first_name.as_deref().unwrap_or_default().trim().to_string(),
        last_name: input.last_name.as_deref().unwrap_or_default().trim().to_string(),
        line1,
        city,
        cap,
        note,
    })
}
