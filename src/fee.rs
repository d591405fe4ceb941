//! Trading fee schedule
//!
//! A fill charges each party on the cent notional it put at risk: the
//! buyer on `exec_price x qty`, the seller on the complement, so the
//! two fees together tax exactly the $1-per-share pool the fill funds.
//! Fees never come out of that pool. A fee budget is locked on top of
//! trade collateral at placement, bounded at the order's own price, and
//! the actual charge flows straight from the payer's lock to the fee
//! wallet - which is what keeps the market escrow pool at exactly one
//! payout per traded share.

use crate::money::{self, Price};

/// Rate denominator: rates are parts-per-million of notional
/// (10_000 ppm = 1.00%)
pub const FEE_PRECISION: u64 = 1_000_000;

/// Default market fee rate (10_000 ppm = 1.00%)
pub const DEFAULT_FEE_RATE: u64 = 10_000;

/// Fee in cents on a cent notional.
///
/// Sub-cent results round up to one cent, so a non-zero rate never
/// yields a free fill; the engine clamps each charge to the order's
/// locked fee budget. Widened to u128 internally so a pathological
/// notional cannot overflow the multiply.
///
/// # Example
/// ```
/// use veridex::fee::calculate_fee;
/// // $6.00 notional at 1.00% = 6 cents
/// assert_eq!(calculate_fee(600, 10_000), 6);
/// ```
#[inline]
pub fn calculate_fee(amount_cents: u64, rate_ppm: u64) -> u64 {
    if amount_cents == 0 || rate_ppm == 0 {
        return 0;
    }
    let fee = amount_cents as u128 * rate_ppm as u128 / FEE_PRECISION as u128;
    (fee as u64).max(1)
}

/// Buyer-side fee for a fill: rate applied to `exec_price x qty`.
#[inline]
pub fn buyer_fee(exec_price: Price, qty: u64, rate_ppm: u64) -> u64 {
    calculate_fee(money::cost(exec_price, qty), rate_ppm)
}

/// Seller-side fee for a fill: rate applied to `(1 - exec_price) x qty`.
#[inline]
pub fn seller_fee(exec_price: Price, qty: u64, rate_ppm: u64) -> u64 {
    calculate_fee(money::cost(exec_price.complement(), qty), rate_ppm)
}

/// Upper bound on the total fee an order can incur, locked at placement.
///
/// For a limit buy the exec price never exceeds the limit, and for a
/// limit sell the complement never exceeds the limit's complement, so
/// the fee at the order's own price bounds every fill. Market orders
/// are bounded at full payout notional.
#[inline]
pub fn fee_lock_bound(notional_price: Option<Price>, qty: u64, rate_ppm: u64) -> u64 {
    match notional_price {
        Some(p) => calculate_fee(money::cost(p, qty), rate_ppm),
        None => calculate_fee(money::payout(qty), rate_ppm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(cents: u64) -> Price {
        Price::from_cents(cents).unwrap()
    }

    #[test]
    fn test_calculate_fee_basic() {
        // $100.00 at 1.00% = $1.00
        assert_eq!(calculate_fee(10_000, 10_000), 100);
        // $100.00 at 0.10% = $0.10
        assert_eq!(calculate_fee(10_000, 1_000), 10);
    }

    #[test]
    fn test_calculate_fee_minimum() {
        // Sub-cent fees round up to the 1-cent minimum
        assert_eq!(calculate_fee(5, 1_000), 1);
        assert_eq!(calculate_fee(1, 1_000), 1);
    }

    #[test]
    fn test_calculate_fee_zero() {
        assert_eq!(calculate_fee(0, 10_000), 0);
        assert_eq!(calculate_fee(10_000, 0), 0);
    }

    #[test]
    fn test_symmetric_notional_split() {
        // 10 shares at 0.60: buyer notional $6.00, seller notional $4.00
        assert_eq!(buyer_fee(p(60), 10, 10_000), 6);
        assert_eq!(seller_fee(p(60), 10, 10_000), 4);
    }

    #[test]
    fn test_fee_bound_dominates_fill_fee() {
        // Buy limit at 0.70 filled at 0.60: bound computed at 0.70
        let bound = fee_lock_bound(Some(p(70)), 10, 10_000);
        assert!(bound >= buyer_fee(p(60), 10, 10_000));

        // Sell limit at 0.70 filled at 0.80: seller notional shrinks
        let bound = fee_lock_bound(Some(p(70).complement()), 10, 10_000);
        assert!(bound >= seller_fee(p(80), 10, 10_000));

        // Market order: bound at full payout notional
        let bound = fee_lock_bound(None, 10, 10_000);
        assert!(bound >= buyer_fee(p(99), 10, 10_000));
    }

    #[test]
    fn test_no_overflow() {
        let large_amount: u64 = 10_000_000_000_000_000_000;
        assert_eq!(calculate_fee(large_amount, 2_000), 20_000_000_000_000_000);
    }
}
