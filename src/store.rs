//! Pluggable persistence interface
//!
//! Optional for correctness, required for durability. The core stays
//! correct against the in-memory implementation; a durable backend
//! must provide at-least-once semantics with idempotent writes keyed
//! by record id. Store writes are driven from event-bus subscribers so
//! the matching path never blocks on persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, AgentId, MarketId, TradeId};
use crate::errors::CoreResult;
use crate::ledger::JournalEntry;
use crate::models::{Outcome, Position, Trade};

/// Which half of a wallet a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    Available,
    Locked,
}

/// Point-in-time wallet snapshot as persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub available_cents: u64,
    pub locked_cents: u64,
}

/// The small store API the core calls.
#[async_trait]
pub trait CoreStore: Send + Sync {
    async fn get_balance(&self, account: AccountId) -> CoreResult<Option<BalanceSnapshot>>;
    async fn set_balance(&self, account: AccountId, balance: BalanceSnapshot) -> CoreResult<()>;
    async fn update_balance_delta(
        &self,
        account: AccountId,
        delta_cents: i64,
        kind: BalanceKind,
    ) -> CoreResult<()>;

    async fn get_position(
        &self,
        agent: AgentId,
        market: MarketId,
        outcome: Outcome,
    ) -> CoreResult<Option<Position>>;
    async fn upsert_position(&self, position: Position) -> CoreResult<()>;
    async fn get_market_positions(&self, market: MarketId) -> CoreResult<Vec<Position>>;

    async fn record_trade(&self, trade: Trade) -> CoreResult<()>;
    async fn record_journal(&self, entry: JournalEntry) -> CoreResult<()>;
}

/// Default in-process store: hashed containers, no durability.
#[derive(Default)]
pub struct MemoryStore {
    balances: DashMap<AccountId, BalanceSnapshot>,
    positions: DashMap<(AgentId, MarketId, Outcome), Position>,
    trades: DashMap<TradeId, Trade>,
    journal: DashMap<u64, JournalEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    pub fn journal_count(&self) -> usize {
        self.journal.len()
    }
}

#[async_trait]
impl CoreStore for MemoryStore {
    async fn get_balance(&self, account: AccountId) -> CoreResult<Option<BalanceSnapshot>> {
        Ok(self.balances.get(&account).map(|b| *b))
    }

    async fn set_balance(&self, account: AccountId, balance: BalanceSnapshot) -> CoreResult<()> {
        self.balances.insert(account, balance);
        Ok(())
    }

    async fn update_balance_delta(
        &self,
        account: AccountId,
        delta_cents: i64,
        kind: BalanceKind,
    ) -> CoreResult<()> {
        let mut entry = self.balances.entry(account).or_default();
        let field = match kind {
            BalanceKind::Available => &mut entry.available_cents,
            BalanceKind::Locked => &mut entry.locked_cents,
        };
        *field = field.saturating_add_signed(delta_cents);
        Ok(())
    }

    async fn get_position(
        &self,
        agent: AgentId,
        market: MarketId,
        outcome: Outcome,
    ) -> CoreResult<Option<Position>> {
        Ok(self
            .positions
            .get(&(agent, market, outcome))
            .map(|p| p.clone()))
    }

    async fn upsert_position(&self, position: Position) -> CoreResult<()> {
        self.positions.insert(
            (position.agent_id, position.market_id, position.outcome),
            position,
        );
        Ok(())
    }

    async fn get_market_positions(&self, market: MarketId) -> CoreResult<Vec<Position>> {
        Ok(self
            .positions
            .iter()
            .filter(|entry| entry.key().1 == market)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn record_trade(&self, trade: Trade) -> CoreResult<()> {
        // Keyed by id: replaying the same trade is a no-op
        self.trades.insert(trade.id, trade);
        Ok(())
    }

    async fn record_journal(&self, entry: JournalEntry) -> CoreResult<()> {
        self.journal.insert(entry.id, entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Price;

    fn position(agent: AgentId, market: MarketId, qty: u64) -> Position {
        let mut p = Position::new(agent, market, Outcome::Yes);
        p.apply_fill(qty, qty * 60);
        p
    }

    #[tokio::test]
    async fn test_balance_roundtrip_and_delta() {
        let store = MemoryStore::new();
        assert_eq!(store.get_balance(1).await.unwrap(), None);

        store
            .set_balance(
                1,
                BalanceSnapshot {
                    available_cents: 1_000,
                    locked_cents: 0,
                },
            )
            .await
            .unwrap();

        store
            .update_balance_delta(1, -400, BalanceKind::Available)
            .await
            .unwrap();
        store
            .update_balance_delta(1, 400, BalanceKind::Locked)
            .await
            .unwrap();

        let snapshot = store.get_balance(1).await.unwrap().unwrap();
        assert_eq!(snapshot.available_cents, 600);
        assert_eq!(snapshot.locked_cents, 400);
    }

    #[tokio::test]
    async fn test_position_upsert_and_query() {
        let store = MemoryStore::new();
        store.upsert_position(position(1, 7, 10)).await.unwrap();
        store.upsert_position(position(2, 7, 5)).await.unwrap();
        store.upsert_position(position(1, 8, 3)).await.unwrap();

        let found = store.get_position(1, 7, Outcome::Yes).await.unwrap().unwrap();
        assert_eq!(found.qty, 10);
        assert_eq!(store.get_position(1, 7, Outcome::No).await.unwrap(), None);

        let market_positions = store.get_market_positions(7).await.unwrap();
        assert_eq!(market_positions.len(), 2);
    }

    #[tokio::test]
    async fn test_record_trade_idempotent() {
        let store = MemoryStore::new();
        let trade = Trade {
            id: 9,
            market_id: 1,
            outcome: Outcome::Yes,
            buy_order_id: 1,
            sell_order_id: 2,
            buyer_id: 1,
            seller_id: 2,
            price: Price::from_cents(60).unwrap(),
            qty: 10,
            buyer_fee_cents: 0,
            seller_fee_cents: 0,
            is_settled: false,
            executed_at: 0,
        };

        store.record_trade(trade.clone()).await.unwrap();
        store.record_trade(trade).await.unwrap(); // at-least-once replay
        assert_eq!(store.trade_count(), 1);
    }
}
