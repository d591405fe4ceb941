//! Clearinghouse - composition root
//!
//! Wires the event bus, escrow ledger, per-market matching engines,
//! settlement, oracle resolver and rating engine together. Each market
//! runs single-writer behind its own async mutex; cross-market calls
//! run in parallel. The rating engine holds no direct references to
//! anything here - it is driven purely by bus subscriptions, and the
//! optional store attaches the same way.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::ClearingConfig;
use crate::core_types::{
    AgentId, Clock, FEE_ACCOUNT, IdSource, MarketId, OrderId, TimestampMs, escrow_account,
};
use crate::depth_buffer::DepthBuffer;
use crate::engine::{MatchingEngine, OrderResult, PlaceOrder};
use crate::errors::{CoreError, CoreResult};
use crate::event_bus::EventBus;
use crate::ledger::EscrowLedger;
use crate::models::{Agent, AgentStatus, Market, MarketStatus, Outcome};
use crate::oracle::{OracleResolver, Resolution, ResolutionSchema};
use crate::rating::{Certificate, RatingEngine};
use crate::settlement::{SettlementEngine, SettlementReport};
use crate::store::{BalanceSnapshot, CoreStore};

/// Parameters for a new market.
#[derive(Debug, Clone)]
pub struct CreateMarket {
    pub ticker: String,
    pub question: String,
    pub resolution_schema: ResolutionSchema,
    pub opens_at: TimestampMs,
    pub closes_at: TimestampMs,
    pub resolves_at: TimestampMs,
    /// Per-market overrides of the configured defaults
    pub fee_rate_ppm: Option<u64>,
    pub min_order_size: Option<u64>,
    pub max_position: Option<u64>,
}

/// The clearinghouse core. Construct with [`Clearinghouse::new`] and
/// share behind the returned `Arc`.
pub struct Clearinghouse {
    config: ClearingConfig,
    clock: Clock,
    bus: Arc<EventBus>,
    ledger: Arc<EscrowLedger>,
    rating: Arc<RatingEngine>,
    settlement: SettlementEngine,
    resolver: OracleResolver,
    agents: DashMap<AgentId, Agent>,
    engines: DashMap<MarketId, Arc<Mutex<MatchingEngine>>>,
    ids: Arc<IdSource>,
    next_agent_id: AtomicU64,
    next_market_id: AtomicU64,
}

impl Clearinghouse {
    pub fn new(config: ClearingConfig, clock: Clock) -> Arc<Self> {
        let bus = Arc::new(EventBus::with_capacity(
            config.event_log_capacity,
            clock.clone(),
        ));
        let ledger = Arc::new(EscrowLedger::new(clock.clone()));
        ledger
            .create_wallet(FEE_ACCOUNT, 0)
            .expect("fee wallet creation cannot fail on a fresh ledger");

        let house = Arc::new(Self {
            resolver: OracleResolver::new(config.oracle_retry.clone()),
            settlement: SettlementEngine::new(ledger.clone()),
            rating: Arc::new(RatingEngine::new(clock.clone())),
            agents: DashMap::new(),
            engines: DashMap::new(),
            ids: Arc::new(IdSource::new()),
            next_agent_id: AtomicU64::new(1),
            next_market_id: AtomicU64::new(1),
            config,
            clock,
            bus,
            ledger,
        });
        house.wire_rating();
        house.wire_oracle_feed();
        house
    }

    // ============================================================
    // ACCESSORS
    // ============================================================

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn ledger(&self) -> Arc<EscrowLedger> {
        self.ledger.clone()
    }

    pub fn rating_engine(&self) -> Arc<RatingEngine> {
        self.rating.clone()
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    pub async fn market(&self, market_id: MarketId) -> CoreResult<Market> {
        let engine = self.engine(market_id)?;
        let guard = engine.lock().await;
        Ok(guard.market().clone())
    }

    /// Lock-free depth read handle for one market.
    pub async fn depth_handle(&self, market_id: MarketId) -> CoreResult<Arc<DepthBuffer>> {
        let engine = self.engine(market_id)?;
        let guard = engine.lock().await;
        Ok(guard.depth_handle())
    }

    fn engine(&self, market_id: MarketId) -> CoreResult<Arc<Mutex<MatchingEngine>>> {
        self.engines
            .get(&market_id)
            .map(|e| e.clone())
            .ok_or(CoreError::UnknownMarket(market_id))
    }

    // ============================================================
    // AGENTS
    // ============================================================

    /// Register an agent and open its wallet. Agents are never
    /// destroyed.
    pub fn register_agent(&self, name: &str, opening_cents: u64) -> CoreResult<Agent> {
        let agent_id = self.next_agent_id.fetch_add(1, Ordering::Relaxed);
        let agent = Agent::new(agent_id, name, self.clock.now_ms());
        self.ledger.create_wallet(agent_id, opening_cents)?;
        self.agents.insert(agent_id, agent.clone());
        info!(agent_id, name, "agent registered");
        Ok(agent)
    }

    /// Suspend an agent: wallet frozen for new commitments, open
    /// obligations keep unwinding.
    pub fn suspend_agent(&self, agent_id: AgentId) -> CoreResult<()> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(CoreError::UnknownAgent(agent_id))?;
        agent.set_status(AgentStatus::Suspended)?;
        self.ledger.freeze(agent_id);
        Ok(())
    }

    pub fn reinstate_agent(&self, agent_id: AgentId) -> CoreResult<()> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(CoreError::UnknownAgent(agent_id))?;
        agent.set_status(AgentStatus::Active)?;
        self.ledger.unfreeze(agent_id);
        Ok(())
    }

    /// Ban is terminal; the wallet stays frozen.
    pub fn ban_agent(&self, agent_id: AgentId) -> CoreResult<()> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(CoreError::UnknownAgent(agent_id))?;
        agent.set_status(AgentStatus::Banned)?;
        self.ledger.freeze(agent_id);
        Ok(())
    }

    // ============================================================
    // MARKETS
    // ============================================================

    pub async fn create_market(&self, spec: CreateMarket) -> CoreResult<Market> {
        spec.resolution_schema.validate()?;
        if spec.closes_at <= spec.opens_at || spec.resolves_at < spec.closes_at {
            return Err(CoreError::InvalidTransition(format!(
                "market window out of order: opens {} closes {} resolves {}",
                spec.opens_at, spec.closes_at, spec.resolves_at
            )));
        }

        let market_id = self.next_market_id.fetch_add(1, Ordering::Relaxed);
        self.ledger.create_wallet(escrow_account(market_id), 0)?;

        let market = Market {
            id: market_id,
            ticker: spec.ticker,
            question: spec.question,
            resolution_schema: spec.resolution_schema,
            opens_at: spec.opens_at,
            closes_at: spec.closes_at,
            resolves_at: spec.resolves_at,
            status: MarketStatus::Pending,
            outcome: None,
            fee_rate_ppm: spec.fee_rate_ppm.unwrap_or(self.config.fee_rate_ppm),
            min_order_size: spec.min_order_size.unwrap_or(self.config.min_order_size),
            max_position: spec.max_position.unwrap_or(self.config.max_position),
            total_volume: 0,
            open_interest: 0,
        };

        let engine = MatchingEngine::new(
            market.clone(),
            self.ledger.clone(),
            self.ids.clone(),
            self.clock.clone(),
        );
        self.engines.insert(market_id, Arc::new(Mutex::new(engine)));

        self.bus
            .publish(
                "markets.created",
                json!({
                    "market": market_id,
                    "ticker": market.ticker,
                    "closes_at": market.closes_at,
                }),
            )
            .await;
        info!(market_id, ticker = %market.ticker, "market created");
        Ok(market)
    }

    /// Pending -> Active.
    pub async fn open_market(&self, market_id: MarketId) -> CoreResult<()> {
        let engine = self.engine(market_id)?;
        let mut guard = engine.lock().await;
        guard.market_mut().transition(MarketStatus::Active)
    }

    pub async fn halt_market(&self, market_id: MarketId) -> CoreResult<()> {
        let engine = self.engine(market_id)?;
        {
            let mut guard = engine.lock().await;
            guard.halt()?;
        }
        self.bus
            .publish("markets.halted", json!({ "market": market_id }))
            .await;
        Ok(())
    }

    pub async fn resume_market(&self, market_id: MarketId) -> CoreResult<()> {
        let engine = self.engine(market_id)?;
        {
            let mut guard = engine.lock().await;
            guard.resume()?;
        }
        self.bus
            .publish("markets.resumed", json!({ "market": market_id }))
            .await;
        Ok(())
    }

    /// Move a market into `resolving` once trading is over.
    pub async fn begin_resolution(&self, market_id: MarketId) -> CoreResult<()> {
        let engine = self.engine(market_id)?;
        {
            let mut guard = engine.lock().await;
            guard.market_mut().transition(MarketStatus::Resolving)?;
        }
        self.bus
            .publish("markets.resolving", json!({ "market": market_id }))
            .await;
        Ok(())
    }

    // ============================================================
    // ORDERS
    // ============================================================

    /// Submit an order to a market. Every outcome, accepted or
    /// rejected, is published.
    pub async fn place_order(
        &self,
        market_id: MarketId,
        req: PlaceOrder,
    ) -> CoreResult<OrderResult> {
        let agent = self
            .agents
            .get(&req.agent_id)
            .ok_or(CoreError::UnknownAgent(req.agent_id))?;
        if !agent.is_active() {
            return Err(CoreError::WalletFrozen(req.agent_id));
        }
        drop(agent);

        let engine = self.engine(market_id)?;
        let result = {
            let mut guard = engine.lock().await;
            guard.place_order(req.clone())
        };

        match result {
            Ok(result) => {
                self.publish_order_result(market_id, &result).await;
                Ok(result)
            }
            Err(err) => {
                self.bus
                    .publish(
                        "orders.rejected",
                        json!({
                            "market": market_id,
                            "agent": req.agent_id,
                            "reason": err.code(),
                            "detail": err.to_string(),
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn publish_order_result(&self, market_id: MarketId, result: &OrderResult) {
        self.bus
            .publish(
                "orders.created",
                serde_json::to_value(&result.order).unwrap_or(Value::Null),
            )
            .await;

        // Fills in execution order, one event per trade
        for trade in &result.trades {
            // Both parties traded once more
            for party in [trade.buyer_id, trade.seller_id] {
                if let Some(mut agent) = self.agents.get_mut(&party) {
                    agent.total_trades += 1;
                }
            }
            self.bus
                .publish(
                    "trades.executed",
                    serde_json::to_value(trade).unwrap_or(Value::Null),
                )
                .await;
        }

        for maker in &result.maker_updates {
            if maker.is_filled() {
                self.bus
                    .publish(
                        "orders.filled",
                        json!({ "market": market_id, "order": maker.id, "agent": maker.agent_id }),
                    )
                    .await;
            }
        }
        if result.order.is_filled() {
            self.bus
                .publish(
                    "orders.filled",
                    json!({
                        "market": market_id,
                        "order": result.order.id,
                        "agent": result.order.agent_id,
                    }),
                )
                .await;
        }
        if result.residual_cancelled {
            self.bus
                .publish(
                    "orders.rejected_partial",
                    json!({
                        "market": market_id,
                        "order": result.order.id,
                        "filled_qty": result.order.filled_qty,
                        "unfilled_qty": result.order.remaining_qty(),
                    }),
                )
                .await;
        }
    }

    pub async fn cancel_order(&self, market_id: MarketId, order_id: OrderId) -> CoreResult<()> {
        let engine = self.engine(market_id)?;
        let order = {
            let mut guard = engine.lock().await;
            guard.cancel_order(order_id)?
        };
        self.bus
            .publish(
                "orders.cancelled",
                json!({
                    "market": market_id,
                    "order": order.id,
                    "agent": order.agent_id,
                    "unfilled_qty": order.remaining_qty(),
                    "reason": "cancelled",
                }),
            )
            .await;
        Ok(())
    }

    /// One pass of the order-expiry sweep across every market.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let engines: Vec<(MarketId, Arc<Mutex<MatchingEngine>>)> = self
            .engines
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut total = 0;
        for (market_id, engine) in engines {
            let expired = {
                let mut guard = engine.lock().await;
                guard.sweep_expired(now)
            };
            for order in expired {
                total += 1;
                self.bus
                    .publish(
                        "orders.cancelled",
                        json!({
                            "market": market_id,
                            "order": order.id,
                            "agent": order.agent_id,
                            "unfilled_qty": order.remaining_qty(),
                            "reason": "expired",
                        }),
                    )
                    .await;
            }
        }
        total
    }

    /// Periodic expiry sweep (default 1 s cadence). The task holds a
    /// weak reference and dies with the clearinghouse.
    pub fn spawn_expiry_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = std::time::Duration::from_millis(self.config.expiry_sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(house) => {
                        house.sweep_expired().await;
                    }
                    None => break,
                }
            }
        })
    }

    // ============================================================
    // RESOLUTION & SETTLEMENT
    // ============================================================

    /// Run the oracle for a resolving market and settle on its answer.
    ///
    /// Oracle failures leave the market in `resolving` for retry or
    /// manual intervention.
    pub async fn resolve_and_settle(&self, market_id: MarketId) -> CoreResult<SettlementReport> {
        let schema = {
            let engine = self.engine(market_id)?;
            let guard = engine.lock().await;
            if guard.market().status != MarketStatus::Resolving {
                return Err(CoreError::InvalidTransition(format!(
                    "market {market_id} is not resolving"
                )));
            }
            guard.market().resolution_schema.clone()
        };

        let resolution: Resolution = match self.resolver.resolve(&schema).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(market_id, error = %err, "oracle resolution failed; market stays resolving");
                return Err(err);
            }
        };

        self.bus
            .publish(
                "markets.resolved",
                json!({
                    "market": market_id,
                    "outcome": resolution.outcome.as_str(),
                    "raw_data": resolution.raw_data,
                }),
            )
            .await;
        self.settle_with_outcome(market_id, resolution.outcome).await
    }

    /// Settle a resolving market against a known outcome (used both by
    /// the resolver path and the `oracle.resolved` event feed).
    pub async fn settle_with_outcome(
        &self,
        market_id: MarketId,
        outcome: Outcome,
    ) -> CoreResult<SettlementReport> {
        let engine = self.engine(market_id)?;
        let report = {
            let mut guard = engine.lock().await;
            match self.settlement.settle(&mut guard, outcome) {
                Ok(report) => report,
                Err(err) => {
                    drop(guard);
                    if err.is_fatal() {
                        self.bus
                            .publish(
                                "markets.halted",
                                json!({ "market": market_id, "reason": err.code() }),
                            )
                            .await;
                    }
                    return Err(err);
                }
            }
        };

        // Reputation counters; the rating engine recomputes from the
        // settlement event separately
        for stats in &report.agent_stats {
            if let Some(mut agent) = self.agents.get_mut(&stats.agent_id) {
                agent.winning_trades += stats.wins;
                agent.total_pnl_cents += stats.pnl_cents;
                let snapshot = json!({
                    "agent": agent.id,
                    "total_trades": agent.total_trades,
                    "winning_trades": agent.winning_trades,
                    "total_pnl_cents": agent.total_pnl_cents,
                });
                drop(agent);
                self.bus.publish("agents.reputation_updated", snapshot).await;
            }
        }

        self.bus
            .publish(
                "settlements.completed",
                json!({
                    "market": market_id,
                    "outcome": outcome.as_str(),
                    "payouts": serde_json::to_value(&report.payouts).unwrap_or(Value::Null),
                }),
            )
            .await;
        Ok(report)
    }

    /// Certify an agent's rating and publish the certificate.
    pub async fn certify(&self, agent_id: AgentId) -> CoreResult<Certificate> {
        let certificate = self.rating.certify(agent_id)?;
        self.bus
            .publish(
                "ratings.certified",
                serde_json::to_value(&certificate).unwrap_or(Value::Null),
            )
            .await;
        Ok(certificate)
    }

    // ============================================================
    // WIRING (bus subscriptions)
    // ============================================================

    /// The rating engine is connected only through events: it records
    /// trades as they execute and rescores agents on settlement.
    fn wire_rating(self: &Arc<Self>) {
        let rating = self.rating.clone();
        self.bus.subscribe("trades.executed", move |event| {
            let rating = rating.clone();
            async move {
                let trade = serde_json::from_value(event.payload)?;
                rating.record_trade(&trade);
                Ok(())
            }
        });

        let rating = self.rating.clone();
        let bus = self.bus.clone();
        self.bus.subscribe("settlements.completed", move |event| {
            let rating = rating.clone();
            let bus = bus.clone();
            async move {
                let market_id = event.payload["market"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("settlement event without market id"))?;
                let outcome = match event.payload["outcome"].as_str() {
                    Some("YES") => Outcome::Yes,
                    Some("NO") => Outcome::No,
                    other => anyhow::bail!("settlement event with bad outcome {other:?}"),
                };

                let changes = rating.record_settlement(market_id, outcome);
                let mut touched: Vec<AgentId> = Vec::new();
                if let Some(payouts) = event.payload["payouts"].as_array() {
                    for payout in payouts {
                        if let Some(agent) = payout["agent_id"].as_u64() {
                            if !touched.contains(&agent) {
                                touched.push(agent);
                            }
                        }
                    }
                }

                for agent_id in touched {
                    if let Some(snapshot) = rating.rating(agent_id) {
                        bus.publish(
                            "ratings.updated",
                            json!({
                                "agent": agent_id,
                                "truth_score": snapshot.truth_score,
                                "grade": snapshot.grade.as_str(),
                                "settled_trades": snapshot.settled_trades,
                            }),
                        )
                        .await;
                    }
                }
                for change in changes {
                    bus.publish(
                        "ratings.grade_changed",
                        serde_json::to_value(&change).unwrap_or(Value::Null),
                    )
                    .await;
                }
                Ok(())
            }
        });
    }

    /// External resolutions arrive as `oracle.resolved` events instead
    /// of going through the resolver.
    fn wire_oracle_feed(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.subscribe("oracle.resolved", move |event| {
            let weak = weak.clone();
            async move {
                let Some(house) = weak.upgrade() else {
                    return Ok(());
                };
                let market_id = event.payload["market"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("oracle.resolved without market id"))?;
                let outcome = match event.payload["outcome"].as_str() {
                    Some("YES") => Outcome::Yes,
                    Some("NO") => Outcome::No,
                    other => anyhow::bail!("oracle.resolved with bad outcome {other:?}"),
                };
                if let Err(err) = house.settle_with_outcome(market_id, outcome).await {
                    error!(market_id, error = %err, "externally-fed settlement failed");
                }
                Ok(())
            }
        });
    }

    /// Attach a persistence backend. Trades, journal entries, balances
    /// and final positions flow to it from bus subscribers, keeping the
    /// matching path synchronous.
    pub fn attach_store(self: &Arc<Self>, store: Arc<dyn CoreStore>) {
        let journal_cursor = Arc::new(AtomicUsize::new(0));

        let ledger = self.ledger.clone();
        let trade_store = store.clone();
        let cursor = journal_cursor.clone();
        self.bus.subscribe("trades.executed", move |event| {
            let store = trade_store.clone();
            let ledger = ledger.clone();
            let cursor = cursor.clone();
            async move {
                let trade = serde_json::from_value(event.payload)?;
                store.record_trade(trade).await?;

                let from = cursor.load(Ordering::Acquire);
                let entries = ledger.entries_since(from);
                cursor.store(from + entries.len(), Ordering::Release);
                for entry in entries {
                    store.record_journal(entry).await?;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        self.bus.subscribe("settlements.completed", move |event| {
            let weak = weak.clone();
            let store = store.clone();
            async move {
                let Some(house) = weak.upgrade() else {
                    return Ok(());
                };
                let market_id = event.payload["market"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("settlement event without market id"))?;

                // Final (closed) positions and the settled balances
                let engine = house.engine(market_id)?;
                let positions: Vec<_> = {
                    let guard = engine.lock().await;
                    guard.positions().cloned().collect()
                };
                for position in positions {
                    let agent = position.agent_id;
                    store.upsert_position(position).await?;
                    if let Some((available, locked)) = house.ledger.balance_of(agent) {
                        store
                            .set_balance(
                                agent,
                                BalanceSnapshot {
                                    available_cents: available,
                                    locked_cents: locked,
                                },
                            )
                            .await?;
                    }
                }
                Ok(())
            }
        });
    }
}
