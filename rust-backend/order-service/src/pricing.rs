//! Tiered delivery fee: a flat fee covers the first `base_km`, every started
//! kilometre beyond that costs `extra_fee_per_km`.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::models::StoreSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("address is {distance_km} km away, beyond the {max_km} km delivery area")]
    OutOfServiceArea { distance_km: Decimal, max_km: Decimal },
}

/// Half-away-from-zero to cents.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn calculate_fee(
    distance_km: Decimal,
    base_km: Decimal,
    base_fee: Decimal,
    extra_fee_per_km: Decimal,
    max_km: Option<Decimal>,
) -> Result<Decimal, PricingError> {
    if let Some(max_km) = max_km {
        if distance_km > max_km {
            return Err(PricingError::OutOfServiceArea { distance_km, max_km });
        }
    }

    if distance_km <= base_km {
        return Ok(round_money(base_fee));
    }

    let extra_km = (distance_km - base_km).ceil();
    Ok(round_money(base_fee + extra_km * extra_fee_per_km))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTariff {
    pub base_km: Decimal,
    pub base_fee: Decimal,
    pub extra_fee_per_km: Decimal,
    pub max_km: Option<Decimal>,
}

impl DeliveryTariff {
    pub fn fee_for(&self, distance_km: Decimal) -> Result<Decimal, PricingError> {
        calculate_fee(
            distance_km,
            self.base_km,
            self.base_fee,
            self.extra_fee_per_km,
            self.max_km,
        )
    }
}

impl From<&StoreSettings> for DeliveryTariff {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            base_km: settings.base_km,
            base_fee: settings.base_fee,
            extra_fee_per_km: settings.extra_fee_per_km,
            max_km: settings.max_km,
        }
    }
}
