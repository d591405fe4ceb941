//! Money and Price Types
//!
//! Unified fixed-precision representation for everything monetary.
//! All balances and notionals are integer **cents** (`u64`, `i64` for
//! signed deltas). Prices are integer probability-cents in `1..=99`:
//! a price of 60 means $0.60 per share, and a winning share pays
//! [`PAYOUT_PER_SHARE`] cents at settlement.
//!
//! ## Design Principles
//! 1. Conservation math must be bit-exact: cents in == cents out
//! 2. Explicit error handling: no silent truncation
//! 3. Conversions to client-facing decimals happen only at the edge,
//!    through this module

use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{CoreError, CoreResult};

/// Cents a winning share pays at settlement ($1.00).
pub const PAYOUT_PER_SHARE: u64 = 100;

/// Minimum valid limit price (one tick above zero, $0.01).
pub const MIN_PRICE_CENTS: u64 = 1;

/// Maximum valid limit price (one tick below $1, $0.99).
pub const MAX_PRICE_CENTS: u64 = 99;

/// A contract price in probability-cents.
///
/// Private field forces construction through [`Price::from_cents`] or
/// [`Price::from_decimal`], both of which validate the `1..=99` range.
/// The tick size is one cent; decimal inputs are snapped to the tick.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Price(u64);

impl Price {
    /// Validate and wrap a raw cent value.
    pub fn from_cents(cents: u64) -> CoreResult<Self> {
        if (MIN_PRICE_CENTS..=MAX_PRICE_CENTS).contains(&cents) {
            Ok(Self(cents))
        } else {
            Err(CoreError::InvalidPrice(format!("{cents} cents")))
        }
    }

    /// Parse a decimal probability (e.g. `0.60`), snapping to the tick.
    ///
    /// Values that round outside `[0.01, 0.99]` are rejected.
    pub fn from_decimal(value: Decimal) -> CoreResult<Self> {
        let cents = (value * Decimal::from(PAYOUT_PER_SHARE))
            .round()
            .to_u64()
            .ok_or_else(|| CoreError::InvalidPrice(value.to_string()))?;
        Self::from_cents(cents)
    }

    #[inline]
    pub fn cents(&self) -> u64 {
        self.0
    }

    /// The complementary price: what the opposite outcome costs.
    ///
    /// `complement(0.60) == 0.40`; always a valid `Price` because the
    /// range `1..=99` is symmetric around 50.
    #[inline]
    pub fn complement(&self) -> Price {
        Price(PAYOUT_PER_SHARE - self.0)
    }

    /// Probability as a decimal in (0, 1), for display and forecasting.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PAYOUT_PER_SHARE)
    }

    /// Probability as f64 (rating-engine statistics only; never fed back
    /// into ledger arithmetic).
    #[inline]
    pub fn as_probability(&self) -> f64 {
        self.0 as f64 / PAYOUT_PER_SHARE as f64
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0.{:02}", self.0)
    }
}

/// Notional cost in cents of `qty` shares at `price`.
///
/// Exact: price is cents per share, so the product is already in cents.
#[inline]
pub fn cost(price: Price, qty: u64) -> u64 {
    // qty is bounded by max_position (well under 2^32) in practice,
    // but guard the multiply anyway.
    (price.cents() as u128 * qty as u128) as u64
}

/// Settlement payout in cents for `qty` winning shares.
#[inline]
pub fn payout(qty: u64) -> u64 {
    PAYOUT_PER_SHARE * qty
}

/// Format a cent amount as a dollar string (e.g. `1234` -> `"12.34"`).
pub fn cents_to_display(cents: u64) -> String {
    let d = Decimal::from(cents) / Decimal::from(PAYOUT_PER_SHARE);
    format!("{d:.2}")
}

/// Format a signed cent amount as a dollar string.
pub fn cents_to_display_signed(cents: i64) -> String {
    let d = Decimal::from(cents) / Decimal::from(PAYOUT_PER_SHARE);
    format!("{d:.2}")
}

/// Parse a dollar decimal into cents, rejecting sub-cent precision.
pub fn decimal_to_cents(value: Decimal) -> CoreResult<u64> {
    let scaled = value * Decimal::from(PAYOUT_PER_SHARE);
    if scaled.fract() != Decimal::ZERO {
        return Err(CoreError::InvalidQuantity(0));
    }
    scaled
        .to_u64()
        .ok_or_else(|| CoreError::InvalidQuantity(0))
}
