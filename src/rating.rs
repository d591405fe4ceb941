//! Rating Engine - composite reputation scoring
//!
//! Consumes trade and settlement events and maintains a per-agent
//! truth score, letter grade, and certification state. Holds no
//! references to the matching engine or ledger; everything it knows
//! arrives through recorded events.
//!
//! Components (each in [0, 1]):
//! - Brier: 1 - mean((forecast - outcome)^2), trade price as forecast
//! - Sharpe: clamp(sharpe / 3, 0, 1), 3 when stddev = 0 and mean > 0
//! - Win rate: winning / settled trades
//! - Consistency: clamp(1 - stddev(score history) / 20, 0, 1)
//! - Risk: 1 - max drawdown fraction of peak cumulative PnL
//!
//! `truth_score = 100 x (0.35 B + 0.25 S + 0.20 W + 0.10 C + 0.10 R)`

use chrono::{Duration, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

use crate::core_types::{AgentId, Clock, MarketId, TimestampMs};
use crate::errors::{CoreError, CoreResult};
use crate::models::{Outcome, Trade};
use crate::money;

/// Settled trades required before an agent is rated at all.
pub const MIN_RATED: u64 = 20;

/// Settled trades required for certification.
pub const CERT_MIN_TRADES: u64 = 50;

/// Score history ring size.
pub const SCORE_HISTORY_CAP: usize = 90;

/// Certificate validity window.
pub const CERT_VALID_DAYS: i64 = 90;

// ============================================================
// GRADES
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    AAA,
    AA,
    A,
    BBB,
    BB,
    B,
    CCC,
    /// Not rated: fewer than [`MIN_RATED`] settled trades
    NR,
}

impl Grade {
    pub fn from_score(truth_score: f64) -> Grade {
        match truth_score {
            s if s >= 90.0 => Grade::AAA,
            s if s >= 80.0 => Grade::AA,
            s if s >= 70.0 => Grade::A,
            s if s >= 60.0 => Grade::BBB,
            s if s >= 50.0 => Grade::BB,
            s if s >= 40.0 => Grade::B,
            _ => Grade::CCC,
        }
    }

    /// Higher is better; NR ranks below everything.
    fn rank(&self) -> u8 {
        match self {
            Grade::NR => 0,
            Grade::CCC => 1,
            Grade::B => 2,
            Grade::BB => 3,
            Grade::BBB => 4,
            Grade::A => 5,
            Grade::AA => 6,
            Grade::AAA => 7,
        }
    }

    /// Certification requires an investment-grade rating.
    pub fn is_certifiable(&self) -> bool {
        self.rank() >= Grade::BB.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::AAA => "AAA",
            Grade::AA => "AA",
            Grade::A => "A",
            Grade::BBB => "BBB",
            Grade::BB => "BB",
            Grade::B => "B",
            Grade::CCC => "CCC",
            Grade::NR => "NR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeChangeDirection {
    Upgrade,
    Downgrade,
}

/// Emitted whenever a recompute moves an agent across a grade boundary.
#[derive(Debug, Clone, Serialize)]
pub struct GradeChange {
    pub agent_id: AgentId,
    pub previous_grade: Grade,
    pub grade: Grade,
    pub change: GradeChangeDirection,
    pub truth_score: f64,
    /// Snapshot of the score history at transition time
    pub history: Vec<f64>,
}

// ============================================================
// RATING STATE
// ============================================================

/// Raw component scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub brier: f64,
    pub sharpe: f64,
    pub win_rate: f64,
    pub consistency: f64,
    pub risk: f64,
}

/// One agent's full rating state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRating {
    pub agent_id: AgentId,
    pub truth_score: f64,
    pub grade: Grade,
    pub components: ComponentScores,
    pub settled_trades: u64,
    pub winning_trades: u64,
    pub score_history: VecDeque<f64>,
    pub certified: bool,
    /// (forecast probability, outcome realised) per settled trade
    forecasts: Vec<(f64, bool)>,
    /// Per-trade realized PnL in dollars, settlement order
    pnl_series: Vec<f64>,
}

impl AgentRating {
    fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            truth_score: 0.0,
            grade: Grade::NR,
            components: ComponentScores::default(),
            settled_trades: 0,
            winning_trades: 0,
            score_history: VecDeque::new(),
            certified: false,
            forecasts: Vec::new(),
            pnl_series: Vec::new(),
        }
    }

    fn is_rated(&self) -> bool {
        self.settled_trades >= MIN_RATED
    }

    fn recompute(&mut self) {
        if !self.is_rated() {
            self.grade = Grade::NR;
            return;
        }

        let brier_score = mean(
            &self
                .forecasts
                .iter()
                .map(|(forecast, won)| {
                    let outcome = if *won { 1.0 } else { 0.0 };
                    (forecast - outcome).powi(2)
                })
                .collect::<Vec<_>>(),
        );
        let brier = (1.0 - brier_score).clamp(0.0, 1.0);

        let pnl_mean = mean(&self.pnl_series);
        let pnl_std = stddev(&self.pnl_series);
        let sharpe_ratio = if pnl_std == 0.0 {
            if pnl_mean > 0.0 { 3.0 } else { 0.0 }
        } else {
            pnl_mean / pnl_std
        };
        let sharpe = (sharpe_ratio / 3.0).clamp(0.0, 1.0);

        let win_rate = self.winning_trades as f64 / self.settled_trades as f64;

        let history: Vec<f64> = self.score_history.iter().copied().collect();
        let consistency = if history.len() < 5 {
            0.5
        } else {
            (1.0 - stddev(&history) / 20.0).clamp(0.0, 1.0)
        };

        let risk = (1.0 - max_drawdown(&self.pnl_series)).clamp(0.0, 1.0);

        self.components = ComponentScores {
            brier,
            sharpe,
            win_rate,
            consistency,
            risk,
        };
        self.truth_score = (100.0
            * (0.35 * brier + 0.25 * sharpe + 0.20 * win_rate + 0.10 * consistency + 0.10 * risk))
            .clamp(0.0, 100.0);
        self.grade = Grade::from_score(self.truth_score);

        if self.score_history.len() >= SCORE_HISTORY_CAP {
            self.score_history.pop_front();
        }
        self.score_history.push_back(self.truth_score);
    }
}

/// A 90-day certification of an agent's rating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub grade: Grade,
    pub truth_score: f64,
    pub issued_at: TimestampMs,
    pub expires_at: TimestampMs,
}

// ============================================================
// ENGINE
// ============================================================

/// A trade awaiting its market's resolution.
#[derive(Debug, Clone)]
struct PendingSample {
    agent_id: AgentId,
    outcome: Outcome,
    forecast: f64,
    pnl_if_won: f64,
    pnl_if_lost: f64,
}

/// Event-driven scorer. Shared behind `Arc`; all state is interior.
pub struct RatingEngine {
    ratings: DashMap<AgentId, AgentRating>,
    pending: DashMap<MarketId, Vec<PendingSample>>,
    clock: Clock,
}

impl RatingEngine {
    pub fn new(clock: Clock) -> Self {
        Self {
            ratings: DashMap::new(),
            pending: DashMap::new(),
            clock,
        }
    }

    /// Record an executed trade: two pending forecasts, one per party.
    ///
    /// The buyer forecast the trade outcome at the trade price; the
    /// seller forecast the complement at the complement price.
    pub fn record_trade(&self, trade: &Trade) {
        let qty = trade.qty as f64;
        let buyer_cost = money::cost(trade.price, trade.qty) as f64 / 100.0;
        let seller_cost = money::cost(trade.price.complement(), trade.qty) as f64 / 100.0;

        let mut pending = self.pending.entry(trade.market_id).or_default();
        pending.push(PendingSample {
            agent_id: trade.buyer_id,
            outcome: trade.outcome,
            forecast: trade.price.as_probability(),
            pnl_if_won: qty - buyer_cost,
            pnl_if_lost: -buyer_cost,
        });
        pending.push(PendingSample {
            agent_id: trade.seller_id,
            outcome: trade.outcome.opposite(),
            forecast: trade.price.complement().as_probability(),
            pnl_if_won: qty - seller_cost,
            pnl_if_lost: -seller_cost,
        });
    }

    /// Consume a market resolution: score every pending sample for that
    /// market and recompute affected agents. Returns the grade
    /// transitions the recompute caused.
    pub fn record_settlement(&self, market_id: MarketId, winner: Outcome) -> Vec<GradeChange> {
        let samples = match self.pending.remove(&market_id) {
            Some((_, samples)) => samples,
            None => return Vec::new(),
        };

        let mut touched: Vec<AgentId> = Vec::new();
        let mut previous: Vec<(AgentId, Grade)> = Vec::new();

        for sample in samples {
            let mut rating = self
                .ratings
                .entry(sample.agent_id)
                .or_insert_with(|| AgentRating::new(sample.agent_id));
            if !touched.contains(&sample.agent_id) {
                touched.push(sample.agent_id);
                previous.push((sample.agent_id, rating.grade));
            }

            let won = sample.outcome == winner;
            rating.settled_trades += 1;
            if won {
                rating.winning_trades += 1;
            }
            rating.forecasts.push((sample.forecast, won));
            rating
                .pnl_series
                .push(if won { sample.pnl_if_won } else { sample.pnl_if_lost });
        }

        let mut changes = Vec::new();
        for (agent_id, previous_grade) in previous {
            let mut rating = self.ratings.get_mut(&agent_id).expect("touched above");
            rating.recompute();
            if rating.grade != previous_grade {
                let change = if rating.grade.rank() > previous_grade.rank() {
                    GradeChangeDirection::Upgrade
                } else {
                    GradeChangeDirection::Downgrade
                };
                debug!(
                    agent_id,
                    from = previous_grade.as_str(),
                    to = rating.grade.as_str(),
                    score = rating.truth_score,
                    "grade transition"
                );
                changes.push(GradeChange {
                    agent_id,
                    previous_grade,
                    grade: rating.grade,
                    change,
                    truth_score: rating.truth_score,
                    history: rating.score_history.iter().copied().collect(),
                });
            }
        }
        changes
    }

    pub fn rating(&self, agent_id: AgentId) -> Option<AgentRating> {
        self.ratings.get(&agent_id).map(|r| r.clone())
    }

    /// Certify an agent's current rating for 90 days.
    ///
    /// Requires at least [`CERT_MIN_TRADES`] settled trades and an
    /// investment-grade rating (BB or better).
    pub fn certify(&self, agent_id: AgentId) -> CoreResult<Certificate> {
        let mut rating = self
            .ratings
            .get_mut(&agent_id)
            .ok_or(CoreError::UnknownAgent(agent_id))?;

        if rating.settled_trades < CERT_MIN_TRADES {
            return Err(CoreError::InvalidTransition(format!(
                "agent {agent_id}: {} settled trades, {CERT_MIN_TRADES} required for certification",
                rating.settled_trades
            )));
        }
        if !rating.grade.is_certifiable() {
            return Err(CoreError::InvalidTransition(format!(
                "agent {agent_id}: grade {} is not certifiable",
                rating.grade.as_str()
            )));
        }

        rating.certified = true;
        let issued_at = self.clock.now_ms();
        let expires_at = Utc
            .timestamp_millis_opt(issued_at)
            .single()
            .map(|t| (t + Duration::days(CERT_VALID_DAYS)).timestamp_millis())
            .unwrap_or(issued_at + CERT_VALID_DAYS * 24 * 3600 * 1000);

        Ok(Certificate {
            id: Uuid::new_v4(),
            agent_id,
            grade: rating.grade,
            truth_score: rating.truth_score,
            issued_at,
            expires_at,
        })
    }
}

// ============================================================
// STATISTICS
// ============================================================

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Maximum peak-to-trough decline of cumulative PnL, as a fraction of
/// the peak. 0 when cumulative PnL never declines from a positive peak.
fn max_drawdown(pnl_series: &[f64]) -> f64 {
    let mut cumulative = 0.0f64;
    let mut peak = 0.0f64;
    let mut worst = 0.0f64;
    for pnl in pnl_series {
        cumulative += pnl;
        if cumulative > peak {
            peak = cumulative;
        } else if peak > 0.0 {
            worst = worst.max((peak - cumulative) / peak);
        }
    }
    worst.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Price;

    fn trade(
        id: u64,
        market_id: MarketId,
        buyer: AgentId,
        seller: AgentId,
        price_cents: u64,
        qty: u64,
    ) -> Trade {
        Trade {
            id,
            market_id,
            outcome: Outcome::Yes,
            buy_order_id: id * 2,
            sell_order_id: id * 2 + 1,
            buyer_id: buyer,
            seller_id: seller,
            price: Price::from_cents(price_cents).unwrap(),
            qty,
            buyer_fee_cents: 0,
            seller_fee_cents: 0,
            is_settled: false,
            executed_at: id as i64,
        }
    }

    /// One settled trade per market: buyer at `price`, market resolves
    /// `winner`.
    fn settle_one(
        engine: &RatingEngine,
        market_id: MarketId,
        buyer: AgentId,
        price_cents: u64,
        winner: Outcome,
    ) -> Vec<GradeChange> {
        engine.record_trade(&trade(market_id, market_id, buyer, 999, price_cents, 1));
        engine.record_settlement(market_id, winner)
    }

    #[test]
    fn test_grade_ladder() {
        assert_eq!(Grade::from_score(95.0), Grade::AAA);
        assert_eq!(Grade::from_score(90.0), Grade::AAA);
        assert_eq!(Grade::from_score(85.0), Grade::AA);
        assert_eq!(Grade::from_score(70.0), Grade::A);
        assert_eq!(Grade::from_score(65.0), Grade::BBB);
        assert_eq!(Grade::from_score(50.0), Grade::BB);
        assert_eq!(Grade::from_score(45.0), Grade::B);
        assert_eq!(Grade::from_score(10.0), Grade::CCC);
    }

    #[test]
    fn test_statistics() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(stddev(&[2.0, 2.0, 2.0]), 0.0);
        assert!((stddev(&[1.0, 3.0]) - 1.0).abs() < 1e-9);

        // Rise to 2, fall to 1: drawdown 50% of peak
        assert!((max_drawdown(&[1.0, 1.0, -1.0]) - 0.5).abs() < 1e-9);
        // Monotonic rise: no drawdown
        assert_eq!(max_drawdown(&[1.0, 1.0, 1.0]), 0.0);
        // All losses from zero: no positive peak to draw down from
        assert_eq!(max_drawdown(&[-1.0, -1.0]), 0.0);
    }

    #[test]
    fn test_unrated_below_minimum() {
        let engine = RatingEngine::new(Clock::manual(0));
        for market in 1..=10u64 {
            settle_one(&engine, market, 1, 70, Outcome::Yes);
        }
        let rating = engine.rating(1).unwrap();
        assert_eq!(rating.settled_trades, 10);
        assert_eq!(rating.grade, Grade::NR);
        assert!(rating.score_history.is_empty());
    }

    #[test]
    fn test_grade_change_on_twentieth_trade() {
        let engine = RatingEngine::new(Clock::manual(0));

        // 3 early losses (bought YES at 0.20, NO won), then 16 wins at 0.80
        for market in 1..=3u64 {
            let changes = settle_one(&engine, market, 1, 20, Outcome::No);
            assert!(changes.is_empty());
        }
        for market in 4..=19u64 {
            let changes = settle_one(&engine, market, 1, 80, Outcome::Yes);
            assert!(changes.is_empty(), "still NR at {} trades", market);
        }
        assert_eq!(engine.rating(1).unwrap().grade, Grade::NR);

        // The 20th settled trade crosses the rating threshold
        let changes = settle_one(&engine, 20, 1, 80, Outcome::Yes);
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.previous_grade, Grade::NR);
        assert_eq!(change.grade, Grade::A);
        assert_eq!(change.change, GradeChangeDirection::Upgrade);
        assert_eq!(change.history.len(), 1);

        let rating = engine.rating(1).unwrap();
        assert!((70.0..80.0).contains(&rating.truth_score), "score {}", rating.truth_score);
        assert_eq!(rating.winning_trades, 17);
        // Components populated
        assert!(rating.components.brier > 0.9);
        assert_eq!(rating.components.consistency, 0.5);
        assert_eq!(rating.components.risk, 1.0);
    }

    #[test]
    fn test_both_parties_scored() {
        let engine = RatingEngine::new(Clock::manual(0));
        engine.record_trade(&trade(1, 1, 1, 2, 60, 10));
        engine.record_settlement(1, Outcome::Yes);

        let buyer = engine.rating(1).unwrap();
        assert_eq!((buyer.settled_trades, buyer.winning_trades), (1, 1));
        // Buyer won 10 shares bought for $6.00
        assert!((buyer.pnl_series[0] - 4.0).abs() < 1e-9);

        let seller = engine.rating(2).unwrap();
        assert_eq!((seller.settled_trades, seller.winning_trades), (1, 0));
        assert!((seller.pnl_series[0] + 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_settlement_without_trades_is_noop() {
        let engine = RatingEngine::new(Clock::manual(0));
        assert!(engine.record_settlement(42, Outcome::Yes).is_empty());
    }

    #[test]
    fn test_score_history_capped() {
        let engine = RatingEngine::new(Clock::manual(0));
        for market in 1..=(SCORE_HISTORY_CAP as u64 + MIN_RATED + 10) {
            settle_one(&engine, market, 1, 80, Outcome::Yes);
        }
        let rating = engine.rating(1).unwrap();
        assert_eq!(rating.score_history.len(), SCORE_HISTORY_CAP);
    }

    #[test]
    fn test_certify_requires_volume_and_grade() {
        let engine = RatingEngine::new(Clock::manual(1_000));

        // 30 winning trades: rated but below the certification volume
        for market in 1..=30u64 {
            settle_one(&engine, market, 1, 80, Outcome::Yes);
        }
        assert!(engine.certify(1).is_err());

        for market in 31..=50u64 {
            settle_one(&engine, market, 1, 80, Outcome::Yes);
        }
        let cert = engine.certify(1).unwrap();
        assert_eq!(cert.agent_id, 1);
        assert!(cert.grade.is_certifiable());
        assert_eq!(
            cert.expires_at - cert.issued_at,
            CERT_VALID_DAYS * 24 * 3600 * 1000
        );
        assert!(engine.rating(1).unwrap().certified);

        // Unknown agent
        assert!(matches!(
            engine.certify(404).unwrap_err(),
            CoreError::UnknownAgent(404)
        ));
    }

    #[test]
    fn test_consistently_losing_agent_grades_low() {
        let engine = RatingEngine::new(Clock::manual(0));
        for market in 1..=25u64 {
            // Always buys YES at 0.80, NO always wins
            settle_one(&engine, market, 1, 80, Outcome::No);
        }
        let rating = engine.rating(1).unwrap();
        assert_eq!(rating.winning_trades, 0);
        assert!(rating.truth_score < 40.0);
        assert_eq!(rating.grade, Grade::CCC);
    }
}
