//! ENFORCED BALANCE TYPE - used by the escrow ledger
//!
//! This is the single source of truth for wallet arithmetic.
//! All balance mutations MUST go through these methods.
//!
//! # Enforcement Strategy:
//! 1. Fields are PRIVATE - no direct access
//! 2. All mutations return Result - errors are explicit
//! 3. checked_add/sub - overflow protection
//! 4. Type system prevents bypassing validation

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};

/// Funds of one wallet, split into spendable and escrowed halves.
///
/// # Invariants (ENFORCED by private fields):
/// - `available` and `locked` are individually non-negative (unsigned)
/// - `available + locked` changes only through deposit/withdraw/
///   spend_locked/credit; lock/release conserve the sum
/// - No overflow/underflow (checked arithmetic)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    available: u64,
    locked: u64,
}

impl Balance {
    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    #[inline(always)]
    pub const fn available(&self) -> u64 {
        self.available
    }

    #[inline(always)]
    pub const fn locked(&self) -> u64 {
        self.locked
    }

    /// Total balance (available + locked).
    /// Returns None on overflow (indicates data corruption).
    #[inline(always)]
    pub const fn total(&self) -> Option<u64> {
        self.available.checked_add(self.locked)
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    /// Add funds to `available`.
    pub fn deposit(&mut self, amount: u64) -> CoreResult<()> {
        self.available = self
            .available
            .checked_add(amount)
            .ok_or(CoreError::LedgerInvariantViolated {
                account: 0,
                detail: "deposit overflow".into(),
            })?;
        Ok(())
    }

    /// Remove funds from `available`.
    ///
    /// # Errors
    /// `InsufficientFunds` if `available < amount`.
    pub fn withdraw(&mut self, amount: u64) -> CoreResult<()> {
        if self.available < amount {
            return Err(CoreError::InsufficientFunds {
                needed: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        Ok(())
    }

    /// Move funds from `available` to `locked`.
    ///
    /// # Errors
    /// `InsufficientFunds` if `available < amount`.
    pub fn lock(&mut self, amount: u64) -> CoreResult<()> {
        if self.available < amount {
            return Err(CoreError::InsufficientFunds {
                needed: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        self.locked = self
            .locked
            .checked_add(amount)
            .ok_or(CoreError::LedgerInvariantViolated {
                account: 0,
                detail: "lock overflow".into(),
            })?;
        Ok(())
    }

    /// Move funds from `locked` back to `available`.
    ///
    /// # Errors
    /// `InvalidRelease` if `locked < amount`.
    pub fn release(&mut self, amount: u64) -> CoreResult<()> {
        if self.locked < amount {
            return Err(CoreError::InvalidRelease {
                requested: amount,
                locked: self.locked,
            });
        }
        self.locked -= amount;
        self.available = self
            .available
            .checked_add(amount)
            .ok_or(CoreError::LedgerInvariantViolated {
                account: 0,
                detail: "release overflow".into(),
            })?;
        Ok(())
    }

    /// Remove funds from `locked` without crediting `available`.
    /// The outbound half of an escrow transfer.
    ///
    /// # Errors
    /// `InvalidRelease` if `locked < amount`.
    pub fn spend_locked(&mut self, amount: u64) -> CoreResult<()> {
        if self.locked < amount {
            return Err(CoreError::InvalidRelease {
                requested: amount,
                locked: self.locked,
            });
        }
        self.locked -= amount;
        Ok(())
    }
}
