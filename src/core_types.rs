//! Identifier and clock primitives the whole crate agrees on
//!
//! Integer ids for agents, markets, orders and trades; the reserved
//! ledger-account ranges that keep system wallets (fees, per-market
//! escrow) out of the agent namespace; and the injectable [`Clock`] and
//! [`IdSource`] that make a matching session fully replayable in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Agent ID - globally unique identifier for a trading agent.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Sequential**: Assigned contiguously by the registry (1, 2, 3, ...)
pub type AgentId = u64;

/// Ledger account ID.
///
/// Agents map 1:1 onto accounts in the low range; system accounts
/// (fee wallet, per-market escrow) live in reserved ranges so they can
/// never collide with agent registrations.
pub type AccountId = u64;

/// Market ID - unique within the system
pub type MarketId = u64;

/// Order ID - unique within the system
pub type OrderId = u64;

/// Trade ID - unique within the system
pub type TradeId = u64;

/// Event bus subscription handle
pub type SubscriptionId = u64;

/// Milliseconds since the Unix epoch (UTC)
pub type TimestampMs = i64;

/// The fee wallet. Collected trading fees accumulate here.
pub const FEE_ACCOUNT: AccountId = 0;

/// Base of the reserved escrow-account namespace.
///
/// Each market owns one escrow account at `ESCROW_ACCOUNT_BASE + market_id`.
/// Agent accounts are assigned sequentially from 1 and can never reach
/// this range.
pub const ESCROW_ACCOUNT_BASE: AccountId = 1 << 62;

/// Escrow account for a market's pending payout pool.
#[inline]
pub fn escrow_account(market_id: MarketId) -> AccountId {
    ESCROW_ACCOUNT_BASE + market_id
}

/// Wall-clock source.
///
/// Production code uses [`Clock::system`]. Tests substitute
/// [`Clock::manual`] so event timestamps, order arrival order, and expiry
/// sweeps are fully deterministic.
#[derive(Debug, Clone)]
pub enum Clock {
    /// `chrono::Utc::now()` in milliseconds
    System,
    /// Shared counter advanced explicitly by the test
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    /// A manual clock starting at `start_ms`.
    pub fn manual(start_ms: TimestampMs) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start_ms)))
    }

    /// Current time in epoch milliseconds.
    #[inline]
    pub fn now_ms(&self) -> TimestampMs {
        match self {
            Clock::System => chrono::Utc::now().timestamp_millis(),
            Clock::Manual(t) => t.load(Ordering::Relaxed),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance_ms(&self, delta: TimestampMs) {
        if let Clock::Manual(t) = self {
            t.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

/// Sequential id generator shared by every market's engine.
///
/// Ids are system-unique and monotonic, which makes the price-time
/// tie-break (`created_at`, then lower id) total. Seed with
/// [`IdSource::starting_at`] for deterministic tests.
#[derive(Debug)]
pub struct IdSource {
    next_order: AtomicU64,
    next_trade: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next_order: AtomicU64::new(first),
            next_trade: AtomicU64::new(first),
        }
    }

    #[inline]
    pub fn next_order_id(&self) -> OrderId {
        self.next_order.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_trade_id(&self) -> TradeId {
        self.next_trade.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}
