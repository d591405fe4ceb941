//! Matching Engine - order intake, price-time matching, fills, cancels
//!
//! One engine per market, single-writer: the owning task is the only
//! mutator, which makes an incoming order's whole match sequence atomic
//! to observers. The engine is synchronous end to end; event publishing
//! and persistence happen downstream from the returned [`OrderResult`].
//!
//! # Collateral rule (binary contracts)
//! A YES share pays $1 at settlement if YES wins. Buying outcome X at
//! price p locks `p x qty`; selling X at p locks `(1-p) x qty` (the
//! maximum loss of the covered short). Market orders lock the full
//! payout `qty x $1` and the surplus is released as fills execute.
//!
//! A sell fill is booked as a long position in the complementary
//! outcome at the complement price, so every traded share moves exactly
//! one payout ($1) into the market's escrow pool.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core_types::{AgentId, Clock, IdSource, OrderId, TimestampMs};
use crate::depth_buffer::{DepthBuffer, MAX_LEVELS};
use crate::errors::{CoreError, CoreResult};
use crate::fee;
use crate::ledger::{EntryRef, EscrowLedger};
use crate::models::{
    Market, MarketStatus, Order, OrderStatus, OrderType, Outcome, Position, Side, Trade,
};
use crate::money::{self, Price};
use crate::orderbook::OrderBook;

/// A new order submission.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub agent_id: AgentId,
    pub side: Side,
    pub outcome: Outcome,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub qty: u64,
    pub expires_at: Option<TimestampMs>,
}

/// Atomic bundle of an accepted order and everything it caused.
#[derive(Debug, Clone)]
pub struct OrderResult {
    /// The taker order after matching
    pub order: Order,
    /// Trades in execution order
    pub trades: Vec<Trade>,
    /// Maker orders touched during matching (post-fill snapshots)
    pub maker_updates: Vec<Order>,
    /// True when a market order's residual was cancelled for lack of
    /// liquidity
    pub residual_cancelled: bool,
}

/// The matching engine for one market.
pub struct MatchingEngine {
    market: Market,
    book_yes: OrderBook,
    book_no: OrderBook,
    /// Every order this market has seen, by id (authoritative record)
    orders: FxHashMap<OrderId, Order>,
    positions: FxHashMap<(AgentId, Outcome), Position>,
    trades: Vec<Trade>,
    ledger: Arc<EscrowLedger>,
    ids: Arc<IdSource>,
    depth: Arc<DepthBuffer>,
    /// Monotonic version stamped into the depth buffer
    depth_seq: u64,
    clock: Clock,
}

impl MatchingEngine {
    pub fn new(
        market: Market,
        ledger: Arc<EscrowLedger>,
        ids: Arc<IdSource>,
        clock: Clock,
    ) -> Self {
        Self {
            market,
            book_yes: OrderBook::new(),
            book_no: OrderBook::new(),
            orders: FxHashMap::default(),
            positions: FxHashMap::default(),
            trades: Vec::new(),
            ledger,
            ids,
            depth: Arc::new(DepthBuffer::new()),
            depth_seq: 0,
            clock,
        }
    }

    // ============================================================
    // QUERY OPERATIONS
    // ============================================================

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn book(&self, outcome: Outcome) -> &OrderBook {
        match outcome {
            Outcome::Yes => &self.book_yes,
            Outcome::No => &self.book_no,
        }
    }

    pub fn position(&self, agent: AgentId, outcome: Outcome) -> Option<&Position> {
        self.positions.get(&(agent, outcome))
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Lock-free read handle for external depth consumers.
    pub fn depth_handle(&self) -> Arc<DepthBuffer> {
        self.depth.clone()
    }

    // ============================================================
    // ORDER PLACEMENT
    // ============================================================

    /// Validate, lock collateral, match, and rest the residual.
    ///
    /// Checks run in order: market tradability, quantity, position
    /// limit, price, collateral. The first failure rejects the order;
    /// a rejected order is still recorded for the audit trail.
    #[instrument(skip(self, req), fields(market = self.market.id, agent = req.agent_id))]
    pub fn place_order(&mut self, req: PlaceOrder) -> CoreResult<OrderResult> {
        let now = self.clock.now_ms();

        // 1. Market must be open for trading
        if !self.market.is_tradable(now) {
            return Err(CoreError::MarketNotTradable(self.market.id));
        }

        // 2. Quantity and position limit
        if req.qty == 0 || req.qty < self.market.min_order_size {
            return Err(CoreError::InvalidQuantity(req.qty));
        }
        let acquired_outcome = match req.side {
            Side::Buy => req.outcome,
            Side::Sell => req.outcome.opposite(),
        };
        let held = self
            .positions
            .get(&(req.agent_id, acquired_outcome))
            .map(|p| p.qty)
            .unwrap_or(0);
        if held + req.qty > self.market.max_position {
            return Err(CoreError::PositionLimitExceeded {
                agent: req.agent_id,
                market: self.market.id,
            });
        }

        // 3. Price shape: limits carry one, market orders must not
        let price = match (req.order_type, req.price) {
            (OrderType::Limit, Some(p)) => Some(p),
            (OrderType::Limit, None) => {
                return Err(CoreError::InvalidPrice("limit order without price".into()));
            }
            (OrderType::Market, None) => None,
            (OrderType::Market, Some(_)) => {
                return Err(CoreError::InvalidOrderType(
                    "market order must not carry a price".into(),
                ));
            }
        };

        // 4. Collateral requirement plus fee budget, one atomic lock
        let (collateral, fee_bound) = match (req.order_type, req.side, price) {
            (OrderType::Limit, Side::Buy, Some(p)) => (
                money::cost(p, req.qty),
                fee::fee_lock_bound(Some(p), req.qty, self.market.fee_rate_ppm),
            ),
            (OrderType::Limit, Side::Sell, Some(p)) => (
                money::cost(p.complement(), req.qty),
                fee::fee_lock_bound(Some(p.complement()), req.qty, self.market.fee_rate_ppm),
            ),
            _ => (
                money::payout(req.qty),
                fee::fee_lock_bound(None, req.qty, self.market.fee_rate_ppm),
            ),
        };

        let order_id = self.ids.next_order_id();
        let mut order = Order {
            id: order_id,
            agent_id: req.agent_id,
            market_id: self.market.id,
            side: req.side,
            outcome: req.outcome,
            order_type: req.order_type,
            price,
            qty: req.qty,
            filled_qty: 0,
            locked_cents: collateral,
            fee_locked_cents: fee_bound,
            status: OrderStatus::Pending,
            created_at: now,
            expires_at: req.expires_at,
        };

        if let Err(err) = self.ledger.lock(
            req.agent_id,
            collateral + fee_bound,
            EntryRef::order(order_id),
        ) {
            order.status = OrderStatus::Rejected;
            order.locked_cents = 0;
            order.fee_locked_cents = 0;
            self.orders.insert(order_id, order);
            return Err(err);
        }

        // 5. Match against the opposing side, then rest the residual
        let mut trades = Vec::new();
        let mut maker_updates = Vec::new();
        self.match_order(&mut order, &mut trades, &mut maker_updates)?;

        let mut residual_cancelled = false;
        if order.is_filled() {
            order.status = OrderStatus::Filled;
            self.release_remaining_locks(&mut order)?;
        } else if order.order_type == OrderType::Limit {
            order.status = if order.filled_qty > 0 {
                OrderStatus::Partial
            } else {
                OrderStatus::Open
            };
            self.book_mut(order.outcome).insert(order.clone());
        } else {
            // Market order residual: cancel and release
            residual_cancelled = true;
            order.status = if order.filled_qty > 0 {
                OrderStatus::Cancelled
            } else {
                OrderStatus::Rejected
            };
            self.release_remaining_locks(&mut order)?;
        }

        self.orders.insert(order_id, order.clone());
        self.refresh_depth(order.outcome);

        debug!(
            order_id,
            status = ?order.status,
            fills = trades.len(),
            "order processed"
        );
        Ok(OrderResult {
            order,
            trades,
            maker_updates,
            residual_cancelled,
        })
    }

    // ============================================================
    // MATCHING (price-time priority, maker price sets the trade)
    // ============================================================

    fn match_order(
        &mut self,
        taker: &mut Order,
        trades: &mut Vec<Trade>,
        maker_updates: &mut Vec<Order>,
    ) -> CoreResult<()> {
        loop {
            if taker.is_filled() {
                break;
            }

            // Best opposing maker that crosses the taker's price
            let book = self.book_mut(taker.outcome);
            let maker_price = match book.best_price(taker.side.opposite()) {
                Some(p) => p,
                None => break,
            };
            let crosses = match (taker.side, taker.price) {
                (Side::Buy, Some(limit)) => maker_price.cents() <= limit.cents(),
                (Side::Sell, Some(limit)) => maker_price.cents() >= limit.cents(),
                // Market orders cross unconditionally
                (_, None) => true,
            };
            if !crosses {
                break;
            }

            // Pop the head of the best level
            let level_key = match taker.side {
                // Taker buy consumes asks (normal keys)
                Side::Buy => maker_price.cents(),
                // Taker sell consumes bids (negated keys)
                Side::Sell => u64::MAX - maker_price.cents(),
            };
            let level = match taker.side {
                Side::Buy => self.book_mut(taker.outcome).asks_mut().get_mut(&level_key),
                Side::Sell => self.book_mut(taker.outcome).bids_mut().get_mut(&level_key),
            };
            let mut maker = match level.and_then(|l| l.pop_front()) {
                Some(m) => m,
                None => break,
            };

            let fill_qty = u64::min(taker.remaining_qty(), maker.remaining_qty());
            let trade = self.execute_fill(taker, &mut maker, maker_price, fill_qty)?;
            trades.push(trade);

            // Maker back to the head of its level, or out of the book
            let book = self.book_mut(taker.outcome);
            if maker.is_filled() {
                maker.status = OrderStatus::Filled;
                book.remove_from_index(maker.id);
            } else {
                maker.status = OrderStatus::Partial;
                let level = match taker.side {
                    Side::Buy => book.asks_mut().get_mut(&level_key),
                    Side::Sell => book.bids_mut().get_mut(&level_key),
                };
                if let Some(level) = level {
                    level.push_front(maker.clone());
                } else {
                    // Level vanished when the maker was popped; recreate
                    book.insert(maker.clone());
                }
            }
            if maker.is_filled() {
                let mut settled_maker = maker.clone();
                self.release_remaining_locks(&mut settled_maker)?;
                self.orders.insert(settled_maker.id, settled_maker.clone());
                maker_updates.push(settled_maker);
            } else {
                self.orders.insert(maker.id, maker.clone());
                maker_updates.push(maker);
            }

            // Drop the level if the pop emptied it
            let book = self.book_mut(taker.outcome);
            let emptied = match taker.side {
                Side::Buy => book
                    .asks_mut()
                    .get(&level_key)
                    .is_some_and(|l| l.is_empty()),
                Side::Sell => book
                    .bids_mut()
                    .get(&level_key)
                    .is_some_and(|l| l.is_empty()),
            };
            if emptied {
                match taker.side {
                    Side::Buy => book.asks_mut().remove(&level_key),
                    Side::Sell => book.bids_mut().remove(&level_key),
                };
            }
        }
        Ok(())
    }

    /// Settle one fill's collateral, fees, positions and trade record.
    ///
    /// Per filled share the buyer's `exec` and the seller's `1 - exec`
    /// move into the market escrow pool, so the pool receives exactly
    /// one payout per traded share. Ledger failures here mean locked
    /// collateral went missing and are escalated as fatal.
    fn execute_fill(
        &mut self,
        taker: &mut Order,
        maker: &mut Order,
        exec: Price,
        fill_qty: u64,
    ) -> CoreResult<Trade> {
        let escrow = self.market.escrow_account();
        let rate = self.market.fee_rate_ppm;

        let (buyer, seller) = match taker.side {
            Side::Buy => (&mut *taker, &mut *maker),
            Side::Sell => (&mut *maker, &mut *taker),
        };

        let trade_id = self.ids.next_trade_id();
        let reference = EntryRef::trade(trade_id);

        // Buyer side: consume exec x qty, release any limit surplus
        let buyer_consumed = money::cost(exec, fill_qty);
        let buyer_locked_for_fill = match (buyer.order_type, buyer.price) {
            (OrderType::Limit, Some(limit)) => money::cost(limit, fill_qty),
            _ => money::payout(fill_qty),
        };
        self.ledger
            .transfer_locked(buyer.agent_id, escrow, buyer_consumed, reference)
            .map_err(|e| fatal_ledger(buyer.agent_id, e))?;
        self.ledger
            .release(
                buyer.agent_id,
                buyer_locked_for_fill - buyer_consumed,
                EntryRef::order(buyer.id),
            )
            .map_err(|e| fatal_ledger(buyer.agent_id, e))?;
        buyer.locked_cents -= buyer_locked_for_fill;

        // Seller side: consume (1 - exec) x qty symmetrically
        let seller_consumed = money::cost(exec.complement(), fill_qty);
        let seller_locked_for_fill = match (seller.order_type, seller.price) {
            (OrderType::Limit, Some(limit)) => money::cost(limit.complement(), fill_qty),
            _ => money::payout(fill_qty),
        };
        self.ledger
            .transfer_locked(seller.agent_id, escrow, seller_consumed, reference)
            .map_err(|e| fatal_ledger(seller.agent_id, e))?;
        self.ledger
            .release(
                seller.agent_id,
                seller_locked_for_fill - seller_consumed,
                EntryRef::order(seller.id),
            )
            .map_err(|e| fatal_ledger(seller.agent_id, e))?;
        seller.locked_cents -= seller_locked_for_fill;

        // Fees, clamped to the budget locked at placement
        let buyer_fee = fee::buyer_fee(exec, fill_qty, rate).min(buyer.fee_locked_cents);
        let seller_fee = fee::seller_fee(exec, fill_qty, rate).min(seller.fee_locked_cents);
        self.ledger
            .collect_fee(buyer.agent_id, crate::core_types::FEE_ACCOUNT, buyer_fee, reference)
            .map_err(|e| fatal_ledger(buyer.agent_id, e))?;
        self.ledger
            .collect_fee(seller.agent_id, crate::core_types::FEE_ACCOUNT, seller_fee, reference)
            .map_err(|e| fatal_ledger(seller.agent_id, e))?;
        buyer.fee_locked_cents -= buyer_fee;
        seller.fee_locked_cents -= seller_fee;

        // Positions: buyer long the outcome, seller long the complement
        let outcome = buyer.outcome;
        let (buyer_id, seller_id) = (buyer.agent_id, seller.agent_id);
        let (buy_order_id, sell_order_id) = (buyer.id, seller.id);

        buyer.filled_qty += fill_qty;
        seller.filled_qty += fill_qty;

        self.positions
            .entry((buyer_id, outcome))
            .or_insert_with(|| Position::new(buyer_id, self.market.id, outcome))
            .apply_fill(fill_qty, buyer_consumed);
        self.positions
            .entry((seller_id, outcome.opposite()))
            .or_insert_with(|| Position::new(seller_id, self.market.id, outcome.opposite()))
            .apply_fill(fill_qty, seller_consumed);

        self.market.total_volume += fill_qty;
        self.market.open_interest += fill_qty;

        let trade = Trade {
            id: trade_id,
            market_id: self.market.id,
            outcome,
            buy_order_id,
            sell_order_id,
            buyer_id,
            seller_id,
            price: exec,
            qty: fill_qty,
            buyer_fee_cents: buyer_fee,
            seller_fee_cents: seller_fee,
            is_settled: false,
            executed_at: self.clock.now_ms(),
        };
        self.trades.push(trade.clone());
        Ok(trade)
    }

    // ============================================================
    // CANCEL / EXPIRY / HALT
    // ============================================================

    /// Cancel a resting order, releasing its remaining locks.
    ///
    /// Idempotent in effect: cancelling an already-terminal order
    /// returns `AlreadyTerminal` and changes nothing. Cancels are
    /// allowed while the market is halted.
    pub fn cancel_order(&mut self, order_id: OrderId) -> CoreResult<Order> {
        self.close_resting(order_id, OrderStatus::Cancelled)
    }

    /// Cancel every order whose deadline has passed. Returns the
    /// expired orders.
    pub fn sweep_expired(&mut self, now: TimestampMs) -> Vec<Order> {
        let due: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| {
                !o.is_terminal()
                    && o.expires_at.is_some_and(|deadline| deadline <= now)
            })
            .map(|o| o.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            match self.close_resting(id, OrderStatus::Expired) {
                Ok(order) => expired.push(order),
                // Already terminal between scan and close; nothing to do
                Err(CoreError::AlreadyTerminal) => {}
                Err(err) => {
                    tracing::error!(order_id = id, error = %err, "expiry sweep failed");
                }
            }
        }
        expired
    }

    fn close_resting(&mut self, order_id: OrderId, status: OrderStatus) -> CoreResult<Order> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.is_terminal() {
            return Err(CoreError::AlreadyTerminal);
        }
        let outcome = order.outcome;

        let mut order = self
            .book_mut(outcome)
            .remove(order_id)
            .unwrap_or_else(|| self.orders.get(&order_id).cloned().expect("checked above"));
        order.status = status;
        self.release_remaining_locks(&mut order)?;
        self.orders.insert(order_id, order.clone());
        self.refresh_depth(outcome);
        Ok(order)
    }

    /// Freeze order placement. Cancels remain allowed.
    pub fn halt(&mut self) -> CoreResult<()> {
        self.market.transition(MarketStatus::Halted)
    }

    /// Restore trading after a halt.
    pub fn resume(&mut self) -> CoreResult<()> {
        self.market.transition(MarketStatus::Active)
    }

    // ============================================================
    // SETTLEMENT SUPPORT (called by the settlement engine)
    // ============================================================

    pub(crate) fn market_mut(&mut self) -> &mut Market {
        &mut self.market
    }

    /// Cancel all non-terminal orders, releasing their locks.
    pub(crate) fn cancel_all_open(&mut self) -> CoreResult<Vec<Order>> {
        let open: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| !o.is_terminal())
            .map(|o| o.id)
            .collect();
        let mut cancelled = Vec::with_capacity(open.len());
        for id in open {
            cancelled.push(self.close_resting(id, OrderStatus::Cancelled)?);
        }
        Ok(cancelled)
    }

    pub(crate) fn positions_mut(&mut self) -> &mut FxHashMap<(AgentId, Outcome), Position> {
        &mut self.positions
    }

    pub(crate) fn mark_trades_settled(&mut self) {
        for trade in &mut self.trades {
            trade.is_settled = true;
        }
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    fn book_mut(&mut self, outcome: Outcome) -> &mut OrderBook {
        match outcome {
            Outcome::Yes => &mut self.book_yes,
            Outcome::No => &mut self.book_no,
        }
    }

    /// Release whatever collateral and fee budget the order still holds.
    fn release_remaining_locks(&mut self, order: &mut Order) -> CoreResult<()> {
        let remaining = order.locked_cents + order.fee_locked_cents;
        if remaining > 0 {
            self.ledger
                .release(order.agent_id, remaining, EntryRef::order(order.id))
                .map_err(|e| fatal_ledger(order.agent_id, e))?;
        }
        order.locked_cents = 0;
        order.fee_locked_cents = 0;
        Ok(())
    }

    /// Rebuild both depth blocks of an outcome after a book mutation.
    fn refresh_depth(&mut self, outcome: Outcome) {
        self.depth_seq += 1;
        let ts = self.depth_seq;
        let bids = self.book(outcome).top_n(Side::Buy, MAX_LEVELS);
        let asks = self.book(outcome).top_n(Side::Sell, MAX_LEVELS);
        self.depth.write_side(outcome, Side::Buy, &bids, ts);
        self.depth.write_side(outcome, Side::Sell, &asks, ts);
    }
}

/// A ledger failure while moving already-locked collateral means the
/// books and the ledger disagree. Escalate; the market gets halted.
fn fatal_ledger(account: AgentId, err: CoreError) -> CoreError {
    if err.is_fatal() {
        err
    } else {
        CoreError::LedgerInvariantViolated {
            account,
            detail: err.to_string(),
        }
    }
}
