//! Domain models: agents, markets, orders, trades, positions
//!
//! Each market owns its order book and position table; the ledger owns
//! wallets and the journal. These types hold no references to services.

use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, AgentId, MarketId, OrderId, TimestampMs, TradeId, escrow_account};
use crate::errors::{CoreError, CoreResult};
use crate::money::Price;
use crate::oracle::ResolutionSchema;

// ============================================================
// AGENT
// ============================================================

/// Agent account status. Transitions are monotonic toward `Banned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Suspended,
    Banned,
}

impl AgentStatus {
    fn rank(&self) -> u8 {
        match self {
            AgentStatus::Active => 0,
            AgentStatus::Suspended => 1,
            AgentStatus::Banned => 2,
        }
    }
}

/// A registered trading agent. Created by registration, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub total_trades: u64,
    pub winning_trades: u64,
    /// Lifetime realized profit and loss, cents
    pub total_pnl_cents: i64,
    pub created_at: TimestampMs,
}

impl Agent {
    pub fn new(id: AgentId, name: impl Into<String>, created_at: TimestampMs) -> Self {
        Self {
            id,
            name: name.into(),
            status: AgentStatus::Active,
            total_trades: 0,
            winning_trades: 0,
            total_pnl_cents: 0,
            created_at,
        }
    }

    /// Move toward a more restricted status. Reinstatement from
    /// `Suspended` back to `Active` is allowed; leaving `Banned` is not.
    pub fn set_status(&mut self, next: AgentStatus) -> CoreResult<()> {
        if self.status == AgentStatus::Banned && next.rank() < AgentStatus::Banned.rank() {
            return Err(CoreError::InvalidTransition(format!(
                "agent {} is banned",
                self.id
            )));
        }
        self.status = next;
        Ok(())
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

// ============================================================
// ORDER PRIMITIVES
// ============================================================

/// The two sides of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    #[inline]
    pub fn opposite(&self) -> Outcome {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order lifecycle status. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

/// An order for outcome shares on one market.
///
/// # Invariants
/// - `filled_qty + remaining_qty() == qty`
/// - `locked_cents` equals the ledger lock attributable to this order
///   and only ever decreases after placement
/// - terminal statuses are absorbing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub agent_id: AgentId,
    pub market_id: MarketId,
    pub side: Side,
    pub outcome: Outcome,
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<Price>,
    pub qty: u64,
    pub filled_qty: u64,
    /// Trade collateral currently locked for this order, cents
    pub locked_cents: u64,
    /// Fee budget currently locked for this order, cents
    pub fee_locked_cents: u64,
    pub status: OrderStatus,
    pub created_at: TimestampMs,
    pub expires_at: Option<TimestampMs>,
}

impl Order {
    #[inline]
    pub fn remaining_qty(&self) -> u64 {
        self.qty - self.filled_qty
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Limit price of a resting order. Only limit orders rest.
    #[inline]
    pub fn limit_price(&self) -> Price {
        self.price.expect("resting order always carries a limit price")
    }
}

// ============================================================
// TRADE
// ============================================================

/// An executed trade. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub outcome: Outcome,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    /// Execution price (the maker's price)
    pub price: Price,
    pub qty: u64,
    pub buyer_fee_cents: u64,
    pub seller_fee_cents: u64,
    pub is_settled: bool,
    pub executed_at: TimestampMs,
}

// ============================================================
// POSITION
// ============================================================

/// Aggregate holding of one agent on one (market, outcome).
///
/// A SELL fill books the complementary long: selling YES at 0.60 yields
/// a NO position costed at 0.40 per share. Quantities are therefore
/// always non-negative, and at settlement exactly one of the two
/// outcome books of a market collects the payout pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub agent_id: AgentId,
    pub market_id: MarketId,
    pub outcome: Outcome,
    pub qty: u64,
    /// Total collateral paid into escrow for this position, cents
    pub total_cost_cents: u64,
    /// Set at settlement: payout minus total cost, cents
    pub realized_pnl_cents: i64,
}

impl Position {
    pub fn new(agent_id: AgentId, market_id: MarketId, outcome: Outcome) -> Self {
        Self {
            agent_id,
            market_id,
            outcome,
            qty: 0,
            total_cost_cents: 0,
            realized_pnl_cents: 0,
        }
    }

    /// Record a fill contributing `qty` shares at `cost_cents` total.
    pub fn apply_fill(&mut self, qty: u64, cost_cents: u64) {
        self.qty += qty;
        self.total_cost_cents += cost_cents;
    }

    /// Volume-weighted average entry price, cents per share.
    pub fn avg_entry_price_cents(&self) -> u64 {
        if self.qty == 0 {
            0
        } else {
            self.total_cost_cents / self.qty
        }
    }
}

// ============================================================
// MARKET
// ============================================================

/// Market lifecycle. Monotonic except `Active` <-> `Halted`; a failed
/// settlement parks the market back in `Halted` for manual inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Pending,
    Active,
    Halted,
    Resolving,
    Settled,
    Cancelled,
}

impl MarketStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Settled | MarketStatus::Cancelled)
    }
}

/// A binary-outcome market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub ticker: String,
    pub question: String,
    pub resolution_schema: ResolutionSchema,
    pub opens_at: TimestampMs,
    pub closes_at: TimestampMs,
    pub resolves_at: TimestampMs,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    /// Fee rate in 10^6 precision (see [`crate::fee`])
    pub fee_rate_ppm: u64,
    pub min_order_size: u64,
    /// Maximum net shares one agent may hold per outcome
    pub max_position: u64,
    /// Lifetime traded shares
    pub total_volume: u64,
    /// Open shares awaiting settlement (both outcome books combined)
    pub open_interest: u64,
}

impl Market {
    /// The ledger account holding this market's pending payout pool.
    #[inline]
    pub fn escrow_account(&self) -> AccountId {
        escrow_account(self.id)
    }

    /// Whether orders may be placed right now.
    pub fn is_tradable(&self, now: TimestampMs) -> bool {
        self.status == MarketStatus::Active && now >= self.opens_at && now < self.closes_at
    }

    /// Validate and apply a status transition.
    ///
    /// Allowed edges:
    /// - `Pending -> Active | Cancelled`
    /// - `Active <-> Halted`
    /// - `Active | Halted -> Resolving`
    /// - `Resolving -> Settled | Cancelled | Halted`
    pub fn transition(&mut self, next: MarketStatus) -> CoreResult<()> {
        use MarketStatus::*;
        let ok = matches!(
            (self.status, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Halted)
                | (Halted, Active)
                | (Active, Resolving)
                | (Halted, Resolving)
                | (Resolving, Settled)
                | (Resolving, Cancelled)
                | (Resolving, Halted)
        );
        if !ok {
            if self.status.is_terminal() {
                return Err(CoreError::AlreadyTerminal);
            }
            return Err(CoreError::InvalidTransition(format!(
                "market {}: {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::test_support::manual_schema;

    fn test_market(status: MarketStatus) -> Market {
        Market {
            id: 1,
            ticker: "BTC-100K-2026".into(),
            question: "Will BTC close above $100k?".into(),
            resolution_schema: manual_schema(),
            opens_at: 0,
            closes_at: 1_000_000,
            resolves_at: 2_000_000,
            status,
            outcome: None,
            fee_rate_ppm: 0,
            min_order_size: 1,
            max_position: 1_000,
            total_volume: 0,
            open_interest: 0,
        }
    }

    #[test]
    fn test_agent_status_monotonic() {
        let mut agent = Agent::new(1, "alice", 0);
        agent.set_status(AgentStatus::Suspended).unwrap();
        agent.set_status(AgentStatus::Active).unwrap();
        agent.set_status(AgentStatus::Banned).unwrap();
        assert!(agent.set_status(AgentStatus::Active).is_err());
        assert_eq!(agent.status, AgentStatus::Banned);
    }

    #[test]
    fn test_order_invariant_helpers() {
        let order = Order {
            id: 1,
            agent_id: 1,
            market_id: 1,
            side: Side::Buy,
            outcome: Outcome::Yes,
            order_type: OrderType::Limit,
            price: Some(Price::from_cents(60).unwrap()),
            qty: 10,
            filled_qty: 4,
            locked_cents: 360,
            fee_locked_cents: 0,
            status: OrderStatus::Partial,
            created_at: 0,
            expires_at: None,
        };
        assert_eq!(order.remaining_qty(), 6);
        assert!(!order.is_filled());
        assert!(!order.is_terminal());
    }

    #[test]
    fn test_terminal_statuses_absorbing() {
        for status in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
        ] {
            assert!(status.is_terminal());
        }
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn test_position_avg_entry() {
        let mut pos = Position::new(1, 1, Outcome::Yes);
        pos.apply_fill(10, 600);
        pos.apply_fill(10, 700);
        assert_eq!(pos.qty, 20);
        assert_eq!(pos.avg_entry_price_cents(), 65);
    }

    #[test]
    fn test_market_lifecycle() {
        let mut market = test_market(MarketStatus::Pending);
        market.transition(MarketStatus::Active).unwrap();
        market.transition(MarketStatus::Halted).unwrap();
        market.transition(MarketStatus::Active).unwrap();
        market.transition(MarketStatus::Resolving).unwrap();
        market.transition(MarketStatus::Settled).unwrap();

        // Settled is absorbing
        assert_eq!(
            market.transition(MarketStatus::Active),
            Err(CoreError::AlreadyTerminal)
        );
    }

    #[test]
    fn test_market_cannot_skip_resolving() {
        let mut market = test_market(MarketStatus::Active);
        assert!(market.transition(MarketStatus::Settled).is_err());
        assert_eq!(market.status, MarketStatus::Active);
    }

    #[test]
    fn test_failed_settlement_returns_to_halted() {
        let mut market = test_market(MarketStatus::Resolving);
        market.transition(MarketStatus::Halted).unwrap();
        // Operator can push it back to resolving for a retry
        market.transition(MarketStatus::Resolving).unwrap();
    }

    #[test]
    fn test_tradable_window() {
        let market = test_market(MarketStatus::Active);
        assert!(market.is_tradable(500));
        assert!(!market.is_tradable(1_000_000)); // closes_at is exclusive

        let halted = test_market(MarketStatus::Halted);
        assert!(!halted.is_tradable(500));
    }

    #[test]
    fn test_outcome_opposite() {
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert_eq!(Outcome::No.opposite(), Outcome::Yes);
    }
}
