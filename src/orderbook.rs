//! OrderBook - BTreeMap-based price-time priority order book
//!
//! One book per (market, outcome). This module contains only the book
//! data structure; the matching logic lives in the engine module.
//!
//! # Key Design:
//! - Asks are stored with normal keys (ascending order, lowest price = best ask)
//! - Bids use negated keys `u64::MAX - price` (so highest price comes first = best bid)
//! - Within a price level, orders queue FIFO. Orders are inserted in
//!   arrival order and ids are assigned monotonically, so FIFO position
//!   encodes the (created_at, order_id) tie-break.
//!
//! # Complexity:
//! | Operation | Time |
//! |-----------|------|
//! | Insert | O(log n) |
//! | Best price | O(1) amortized |
//! | Cancel by ID | O(1) lookup + O(log n + k) removal |

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};

use crate::core_types::OrderId;
use crate::models::{Order, Side};
use crate::money::Price;

/// Aggregated view of one price level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub price: Price,
    pub qty: u64,
    pub order_count: usize,
}

/// The order book for one outcome of one market.
#[derive(Debug, Default)]
pub struct OrderBook {
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<u64, VecDeque<Order>>,
    /// Buy orders: (MAX - price) -> orders (so highest price first)
    bids: BTreeMap<u64, VecDeque<Order>>,
    /// Order index: OrderId -> (price cents, side) for O(1) cancel lookup
    order_index: FxHashMap<OrderId, (u64, Side)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the best bid price (highest buy price)
    #[inline]
    pub fn best_bid(&self) -> Option<Price> {
        self.bids
            .first_key_value()
            .map(|(k, _)| Price::from_cents(u64::MAX - k).expect("book holds valid prices"))
    }

    /// Get the best ask price (lowest sell price)
    #[inline]
    pub fn best_ask(&self) -> Option<Price> {
        self.asks
            .first_key_value()
            .map(|(k, _)| Price::from_cents(*k).expect("book holds valid prices"))
    }

    pub fn best_price(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    /// Spread in cents. `None` unless both sides are populated.
    pub fn spread(&self) -> Option<u64> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) if ask.cents() > bid.cents() => {
                Some(ask.cents() - bid.cents())
            }
            _ => None,
        }
    }

    /// Midpoint of the best bid and ask, as a decimal probability.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => {
                Some((ask.to_decimal() + bid.to_decimal()) / Decimal::from(2))
            }
            _ => None,
        }
    }

    /// Get number of price levels on each side (bid_depth, ask_depth)
    #[inline]
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Get mutable reference to asks (for the matching engine)
    #[inline]
    pub fn asks_mut(&mut self) -> &mut BTreeMap<u64, VecDeque<Order>> {
        &mut self.asks
    }

    /// Get mutable reference to bids (for the matching engine)
    #[inline]
    pub fn bids_mut(&mut self) -> &mut BTreeMap<u64, VecDeque<Order>> {
        &mut self.bids
    }

    /// Remove an order from the index (call when an order is consumed
    /// via pop_front during matching). Keeps the index in sync.
    #[inline]
    pub fn remove_from_index(&mut self, order_id: OrderId) {
        self.order_index.remove(&order_id);
    }

    /// Rest an unfilled/partially filled limit order in the book.
    ///
    /// NOTE: The order status should already be set by the caller.
    /// This method does NOT modify the order - it just stores it.
    pub fn insert(&mut self, order: Order) {
        let price = order.limit_price().cents();
        self.order_index.insert(order.id, (price, order.side));

        match order.side {
            Side::Buy => {
                let key = u64::MAX - price;
                self.bids.entry(key).or_default().push_back(order);
            }
            Side::Sell => {
                self.asks.entry(price).or_default().push_back(order);
            }
        }
    }

    /// Remove an order by ID only (uses the order index).
    ///
    /// Returns the removed order if found.
    ///
    /// Complexity: O(1) index lookup + O(log n) tree access + O(k) queue
    /// scan where k = orders at that price level (typically small).
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let (price, side) = self.order_index.remove(&order_id)?;

        let (book, key) = match side {
            Side::Buy => (&mut self.bids, u64::MAX - price),
            Side::Sell => (&mut self.asks, price),
        };

        let orders = book.get_mut(&key)?;
        let pos = orders.iter().position(|o| o.id == order_id)?;
        let order = orders.remove(pos)?;

        // Clean up empty price level
        if orders.is_empty() {
            book.remove(&key);
        }

        Some(order)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.order_index.contains_key(&order_id)
    }

    /// Get total resting quantity at a price level for a side
    pub fn qty_at_price(&self, price: Price, side: Side) -> u64 {
        let level = match side {
            Side::Buy => self.bids.get(&(u64::MAX - price.cents())),
            Side::Sell => self.asks.get(&price.cents()),
        };
        level
            .map(|orders| orders.iter().map(|o| o.remaining_qty()).sum())
            .unwrap_or(0)
    }

    /// Top N price levels for a side, sorted from best.
    pub fn top_n(&self, side: Side, n: usize) -> Vec<LevelSummary> {
        let summarize = |price: u64, orders: &VecDeque<Order>| LevelSummary {
            price: Price::from_cents(price).expect("book holds valid prices"),
            qty: orders.iter().map(|o| o.remaining_qty()).sum(),
            order_count: orders.len(),
        };
        match side {
            Side::Buy => self
                .bids
                .iter()
                .take(n)
                .map(|(&key, orders)| summarize(u64::MAX - key, orders))
                .collect(),
            Side::Sell => self
                .asks
                .iter()
                .take(n)
                .map(|(&price, orders)| summarize(price, orders))
                .collect(),
        }
    }

    /// All resting orders, bids first (best price first, FIFO within
    /// price), then asks. The natural market depth view.
    pub fn all_orders(&self) -> Vec<&Order> {
        self.bids
            .values()
            .flat_map(|level| level.iter())
            .chain(self.asks.values().flat_map(|level| level.iter()))
            .collect()
    }

    /// Ids of every resting order (settlement cancels via this).
    pub fn all_order_ids(&self) -> Vec<OrderId> {
        self.all_orders().iter().map(|o| o.id).collect()
    }
}
