//! Settlement Engine - deterministic resolution of a market
//!
//! Applies a resolved outcome to a market in `resolving` status:
//! cancels the remaining open orders (their locks are simply released;
//! only positions pay out), verifies the conservation identity against
//! the escrow pool, pays the winning outcome book one payout per share,
//! and closes every position.
//!
//! The market transitions to `settled` only after every step succeeds.
//! A conservation violation is fatal: nothing is paid, the market is
//! parked in `halted` for manual inspection.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core_types::{AgentId, MarketId};
use crate::engine::MatchingEngine;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{EntryRef, EscrowLedger};
use crate::models::{MarketStatus, Order, Outcome};
use crate::money;

/// One agent's settlement result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PayoutRecord {
    pub agent_id: AgentId,
    /// Cents credited from the escrow pool (0 for the losing book)
    pub amount_cents: u64,
    /// Payout minus total position cost, cents
    pub profit_loss_cents: i64,
    /// Abstract reputation hint for downstream consumers
    pub truth_score_delta: f64,
}

/// Per-agent settled-trade tally, for reputation counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSettleStats {
    pub agent_id: AgentId,
    pub trades: u64,
    pub wins: u64,
    pub pnl_cents: i64,
}

/// Everything a settlement pass produced.
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub market_id: MarketId,
    pub outcome: Outcome,
    pub payouts: Vec<PayoutRecord>,
    pub cancelled_orders: Vec<Order>,
    pub agent_stats: Vec<AgentSettleStats>,
}

/// Redistributes escrowed funds once an outcome is known.
pub struct SettlementEngine {
    ledger: Arc<EscrowLedger>,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<EscrowLedger>) -> Self {
        Self { ledger }
    }

    /// Settle a resolved market.
    ///
    /// # Errors
    /// - `AlreadyTerminal` if the market is already settled (no-op)
    /// - `InvalidTransition` unless the market is `resolving`
    /// - `SettlementInvariantViolated` (fatal) if the escrow pool does
    ///   not hold exactly one payout per winning share; the market is
    ///   halted and nothing is paid
    pub fn settle(
        &self,
        engine: &mut MatchingEngine,
        outcome: Outcome,
    ) -> CoreResult<SettlementReport> {
        let market_id = engine.market().id;
        match engine.market().status {
            MarketStatus::Settled => return Err(CoreError::AlreadyTerminal),
            MarketStatus::Resolving => {}
            status => {
                return Err(CoreError::InvalidTransition(format!(
                    "market {market_id}: settle from {status:?}"
                )));
            }
        }

        // Step 1: flush the books; open orders just get their locks back
        let cancelled_orders = engine.cancel_all_open()?;

        // Step 2: conservation identity, asserted before paying anyone.
        // Every traded share moved exactly one payout into escrow, and
        // the winning book's quantity equals the traded total.
        let escrow = engine.market().escrow_account();
        let winning_qty: u64 = engine
            .positions()
            .filter(|p| p.outcome == outcome)
            .map(|p| p.qty)
            .sum();
        let pool = self.ledger.available(escrow);
        if pool != money::payout(winning_qty) {
            warn!(
                market_id,
                pool, winning_qty, "conservation violated, halting market"
            );
            engine.market_mut().transition(MarketStatus::Halted)?;
            return Err(CoreError::SettlementInvariantViolated {
                market: market_id,
                detail: format!(
                    "escrow pool {pool} cents != {} cents owed to {winning_qty} winning shares",
                    money::payout(winning_qty)
                ),
            });
        }

        // Step 3: pay winners, book losses, close every position
        let mut payouts: Vec<PayoutRecord> = Vec::new();
        let reference = EntryRef::market(market_id);
        let mut keys: Vec<(AgentId, Outcome)> =
            engine.positions_mut().keys().copied().collect();
        keys.sort_unstable(); // deterministic payout order

        for key in keys {
            let (qty, cost) = {
                let position = &engine.positions_mut()[&key];
                (position.qty, position.total_cost_cents)
            };
            if qty == 0 {
                continue;
            }
            let (agent_id, position_outcome) = key;

            let amount_cents = if position_outcome == outcome {
                let amount = money::payout(qty);
                self.ledger
                    .settlement_payout(escrow, agent_id, amount, reference)?;
                amount
            } else {
                0
            };
            let profit_loss_cents = amount_cents as i64 - cost as i64;

            let position = engine.positions_mut().get_mut(&key).expect("key exists");
            position.realized_pnl_cents = profit_loss_cents;
            position.qty = 0;
            position.total_cost_cents = 0;

            payouts.push(PayoutRecord {
                agent_id,
                amount_cents,
                profit_loss_cents,
                truth_score_delta: 0.0,
            });
        }

        // Step 4: per-agent settled-trade tallies from the trade log
        let agent_stats = Self::tally_trades(engine, outcome);

        // Step 5: commit
        engine.mark_trades_settled();
        let market = engine.market_mut();
        market.outcome = Some(outcome);
        market.open_interest = 0;
        market.transition(MarketStatus::Settled)?;

        info!(
            market_id,
            outcome = outcome.as_str(),
            payouts = payouts.len(),
            "market settled"
        );
        Ok(SettlementReport {
            market_id,
            outcome,
            payouts,
            cancelled_orders,
            agent_stats,
        })
    }

    /// Each trade settles for both parties: the buyer's forecast is the
    /// trade outcome at the trade price, the seller's the complement.
    fn tally_trades(engine: &MatchingEngine, winner: Outcome) -> Vec<AgentSettleStats> {
        use std::collections::BTreeMap;

        fn entry(
            stats: &mut BTreeMap<AgentId, AgentSettleStats>,
            agent_id: AgentId,
        ) -> &mut AgentSettleStats {
            stats.entry(agent_id).or_insert(AgentSettleStats {
                agent_id,
                trades: 0,
                wins: 0,
                pnl_cents: 0,
            })
        }

        let mut stats: BTreeMap<AgentId, AgentSettleStats> = BTreeMap::new();
        for trade in engine.trades() {
            let buyer_won = trade.outcome == winner;
            let buyer_cost = money::cost(trade.price, trade.qty) as i64;
            let seller_cost = money::cost(trade.price.complement(), trade.qty) as i64;
            let pool = money::payout(trade.qty) as i64;

            let buyer = entry(&mut stats, trade.buyer_id);
            buyer.trades += 1;
            if buyer_won {
                buyer.wins += 1;
                buyer.pnl_cents += pool - buyer_cost;
            } else {
                buyer.pnl_cents -= buyer_cost;
            }

            let seller = entry(&mut stats, trade.seller_id);
            seller.trades += 1;
            if !buyer_won {
                seller.wins += 1;
                seller.pnl_cents += pool - seller_cost;
            } else {
                seller.pnl_cents -= seller_cost;
            }
        }
        stats.into_values().collect()
    }
}
