//! End-to-end scenarios through the public clearinghouse API.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use veridex::clearinghouse::{Clearinghouse, CreateMarket};
use veridex::config::ClearingConfig;
use veridex::core_types::{AgentId, Clock, MarketId};
use veridex::engine::PlaceOrder;
use veridex::models::{MarketStatus, OrderStatus, OrderType, Outcome, Side};
use veridex::money::Price;
use veridex::oracle::ResolutionSchema;
use veridex::rating::Grade;

fn fee_free_config() -> ClearingConfig {
    ClearingConfig {
        fee_rate_ppm: 0,
        ..ClearingConfig::default()
    }
}

fn schema_for(url: &str) -> ResolutionSchema {
    serde_json::from_value(json!({
        "type": "http_json",
        "source_url": url,
        "method": "GET",
        "json_path": "$.data.status",
        "condition": { "operator": "eq", "value": "closed" },
        "retry_count": 3,
        "timeout_ms": 5000
    }))
    .unwrap()
}

fn market_spec(ticker: &str, url: &str) -> CreateMarket {
    CreateMarket {
        ticker: ticker.into(),
        question: format!("{ticker}?"),
        resolution_schema: schema_for(url),
        opens_at: 0,
        closes_at: 1_000_000,
        resolves_at: 2_000_000,
        fee_rate_ppm: None,
        min_order_size: None,
        max_position: None,
    }
}

fn limit(agent: AgentId, side: Side, price_cents: u64, qty: u64) -> PlaceOrder {
    PlaceOrder {
        agent_id: agent,
        side,
        outcome: Outcome::Yes,
        order_type: OrderType::Limit,
        price: Some(Price::from_cents(price_cents).unwrap()),
        qty,
        expires_at: None,
    }
}

async fn new_house() -> (Arc<Clearinghouse>, MarketId) {
    let house = Clearinghouse::new(fee_free_config(), Clock::manual(100));
    let market = house
        .create_market(market_spec("E2E", "https://oracle.invalid/status"))
        .await
        .unwrap();
    house.open_market(market.id).await.unwrap();
    (house, market.id)
}

/// Scenario 1: A buys 10 YES @ 0.60, B sells 10 YES @ 0.60.
#[tokio::test]
async fn simple_cross() {
    let (house, market_id) = new_house().await;
    let a = house.register_agent("a", 10_000).unwrap().id;
    let b = house.register_agent("b", 10_000).unwrap().id;

    house.place_order(market_id, limit(a, Side::Buy, 60, 10)).await.unwrap();
    let result = house
        .place_order(market_id, limit(b, Side::Sell, 60, 10))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].qty, 10);
    assert_eq!(result.trades[0].price.cents(), 60);

    // A's $6.00 and B's $4.00 moved from locked into the trade
    let ledger = house.ledger();
    assert_eq!(ledger.balance_of(a), Some((9_400, 0)));
    assert_eq!(ledger.balance_of(b), Some((9_600, 0)));

    // A long 10 YES at cost $6.00; B holds the NO-equivalent short
    let depth = house.depth_handle(market_id).await.unwrap();
    assert!(depth.read_side(Outcome::Yes, Side::Buy).levels.is_empty());
    ledger.verify_all().unwrap();
}

/// Scenario 2: partial fill, remainder rests at its price.
#[tokio::test]
async fn partial_fill_then_rest() {
    let (house, market_id) = new_house().await;
    let a = house.register_agent("a", 10_000).unwrap().id;
    let b = house.register_agent("b", 10_000).unwrap().id;

    let placed = house
        .place_order(market_id, limit(a, Side::Buy, 60, 10))
        .await
        .unwrap();
    let result = house
        .place_order(market_id, limit(b, Side::Sell, 60, 4))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].qty, 4);

    // A remains open for 6 with $3.60 still locked
    let maker = &result.maker_updates[0];
    assert_eq!(maker.id, placed.order.id);
    assert_eq!(maker.status, OrderStatus::Partial);
    assert_eq!(maker.remaining_qty(), 6);
    assert_eq!(maker.locked_cents, 360);
    assert_eq!(house.ledger().balance_of(a), Some((9_400, 360)));

    let depth = house.depth_handle(market_id).await.unwrap();
    let bids = depth.read_side(Outcome::Yes, Side::Buy);
    assert_eq!(bids.levels, vec![(0.60, 6.0)]);
}

/// Scenario 3: C then D rest at 0.70; E's buy fills C fully, D partially.
#[tokio::test]
async fn price_time_priority() {
    let clock = Clock::manual(100);
    let house = Clearinghouse::new(fee_free_config(), clock.clone());
    let market_id = house
        .create_market(market_spec("PTP", "https://oracle.invalid/status"))
        .await
        .unwrap()
        .id;
    house.open_market(market_id).await.unwrap();

    let c = house.register_agent("c", 10_000).unwrap().id;
    let d = house.register_agent("d", 10_000).unwrap().id;
    let e = house.register_agent("e", 10_000).unwrap().id;

    house.place_order(market_id, limit(c, Side::Sell, 70, 5)).await.unwrap();
    clock.advance_ms(1);
    house.place_order(market_id, limit(d, Side::Sell, 70, 5)).await.unwrap();
    clock.advance_ms(1);

    let result = house
        .place_order(market_id, limit(e, Side::Buy, 70, 7))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 2);
    assert_eq!(result.trades[0].seller_id, c);
    assert_eq!(result.trades[0].qty, 5);
    assert_eq!(result.trades[1].seller_id, d);
    assert_eq!(result.trades[1].qty, 2);
    assert!(result.trades.iter().all(|t| t.price.cents() == 70));
}

/// Scenario 4: market resolves YES; the long collects $10.00 (+$4.00),
/// the seller forfeits the $4.00 it had escrowed.
#[tokio::test]
async fn settle_yes() {
    let (house, market_id) = new_house().await;
    let a = house.register_agent("a", 10_000).unwrap().id;
    let b = house.register_agent("b", 10_000).unwrap().id;

    house.place_order(market_id, limit(a, Side::Buy, 60, 10)).await.unwrap();
    house.place_order(market_id, limit(b, Side::Sell, 60, 10)).await.unwrap();

    house.begin_resolution(market_id).await.unwrap();
    let report = house
        .settle_with_outcome(market_id, Outcome::Yes)
        .await
        .unwrap();

    let winner = report.payouts.iter().find(|p| p.agent_id == a).unwrap();
    assert_eq!(winner.amount_cents, 1_000);
    assert_eq!(winner.profit_loss_cents, 400);

    let ledger = house.ledger();
    assert_eq!(ledger.balance_of(a), Some((10_400, 0)));
    assert_eq!(ledger.balance_of(b), Some((9_600, 0)));

    // Conservation: every cent that entered escrow left as payouts
    assert_eq!(
        ledger.balance_of(veridex::core_types::escrow_account(market_id)),
        Some((0, 0))
    );
    ledger.verify_all().unwrap();

    // Settling a settled market is a no-op error
    assert!(matches!(
        house.settle_with_outcome(market_id, Outcome::Yes).await,
        Err(veridex::CoreError::AlreadyTerminal)
    ));
}

/// Serves scripted HTTP responses, one connection per response.
async fn scripted_oracle(listener: TcpListener, responses: Vec<(u16, &'static str)>) {
    for (status, body) in responses {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = sock.read(&mut buf).await;
        let reason = if status == 200 { "OK" } else { "Service Unavailable" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len(),
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        let _ = sock.shutdown().await;
    }
}

/// Scenario 5: 503, 503, then 200 with a matching body. The resolver
/// succeeds on the third attempt after backing off twice.
#[tokio::test]
async fn oracle_retry_then_succeed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/status", listener.local_addr().unwrap());
    tokio::spawn(scripted_oracle(
        listener,
        vec![
            (503, "{}"),
            (503, "{}"),
            (200, r#"{"data":{"status":"closed"}}"#),
        ],
    ));

    let house = Clearinghouse::new(fee_free_config(), Clock::manual(100));
    let market_id = house.create_market(market_spec("ORC", &url)).await.unwrap().id;
    house.open_market(market_id).await.unwrap();

    let a = house.register_agent("a", 10_000).unwrap().id;
    let b = house.register_agent("b", 10_000).unwrap().id;
    house.place_order(market_id, limit(a, Side::Buy, 60, 10)).await.unwrap();
    house.place_order(market_id, limit(b, Side::Sell, 60, 10)).await.unwrap();
    house.begin_resolution(market_id).await.unwrap();

    let started = Instant::now();
    let report = house.resolve_and_settle(market_id).await.unwrap();
    let elapsed = started.elapsed();

    // Condition eq "closed" held, so YES
    assert_eq!(report.outcome, Outcome::Yes);
    assert_eq!(house.ledger().balance_of(a), Some((10_400, 0)));

    // Two backoffs: ~100ms + ~200ms, each jittered +/-10%
    assert!(
        elapsed.as_millis() >= 250,
        "resolved too fast: {elapsed:?}"
    );

    let market = house.market(market_id).await.unwrap();
    assert_eq!(market.status, MarketStatus::Settled);
    assert_eq!(
        house.bus().recent("markets.resolved", 5).len(),
        1
    );
}

/// Terminal oracle failure (404) leaves the market resolving.
#[tokio::test]
async fn oracle_terminal_failure_leaves_market_resolving() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/status", listener.local_addr().unwrap());
    tokio::spawn(scripted_oracle(listener, vec![(404, "{}")]));

    let house = Clearinghouse::new(fee_free_config(), Clock::manual(100));
    let market_id = house.create_market(market_spec("ORF", &url)).await.unwrap().id;
    house.open_market(market_id).await.unwrap();
    house.begin_resolution(market_id).await.unwrap();

    let err = house.resolve_and_settle(market_id).await.unwrap_err();
    assert!(matches!(
        err,
        veridex::CoreError::OracleHttpError { status: 404 }
    ));
    assert_eq!(
        house.market(market_id).await.unwrap().status,
        MarketStatus::Resolving
    );
}

/// Scenario 6: the 20th settled trade rates the agent for the first
/// time and publishes the NR -> A upgrade.
#[tokio::test]
async fn rating_grade_change_on_twentieth_trade() {
    let house = Clearinghouse::new(fee_free_config(), Clock::manual(100));
    let a = house.register_agent("forecaster", 100_000).unwrap().id;
    let b = house.register_agent("counterparty", 100_000).unwrap().id;

    // 3 early losses (long YES at 0.20, NO resolves), then 17 wins
    // (long YES at 0.80, YES resolves), one market per trade.
    for i in 0..20u64 {
        let market_id = house
            .create_market(market_spec(
                &format!("R{i}"),
                "https://oracle.invalid/status",
            ))
            .await
            .unwrap()
            .id;
        house.open_market(market_id).await.unwrap();

        let (price, winner) = if i < 3 {
            (20, Outcome::No)
        } else {
            (80, Outcome::Yes)
        };
        house
            .place_order(market_id, limit(a, Side::Buy, price, 1))
            .await
            .unwrap();
        house
            .place_order(market_id, limit(b, Side::Sell, price, 1))
            .await
            .unwrap();
        house.begin_resolution(market_id).await.unwrap();
        house.settle_with_outcome(market_id, winner).await.unwrap();

        let rating = house.rating_engine().rating(a).unwrap();
        if i < 19 {
            assert_eq!(rating.grade, Grade::NR, "still NR after {} trades", i + 1);
        }
    }

    let rating = house.rating_engine().rating(a).unwrap();
    assert_eq!(rating.settled_trades, 20);
    assert_eq!(rating.grade, Grade::A);
    assert!((70.0..80.0).contains(&rating.truth_score));

    let changes = house.bus().recent("ratings.grade_changed", 10);
    let upgrade = changes
        .iter()
        .find(|e| e.payload["agent_id"] == a)
        .expect("grade change event for the forecaster");
    assert_eq!(upgrade.payload["previous_grade"], "NR");
    assert_eq!(upgrade.payload["grade"], "A");
    assert_eq!(upgrade.payload["change"], "upgrade");
}

/// Cross-cutting: balances plus escrow are conserved through an entire
/// multi-agent session, and the journal replays exactly.
#[tokio::test]
async fn conservation_across_session() {
    let (house, market_id) = new_house().await;
    let agents: Vec<AgentId> = (0..4)
        .map(|i| {
            house
                .register_agent(&format!("agent{i}"), 50_000)
                .unwrap()
                .id
        })
        .collect();

    house.place_order(market_id, limit(agents[0], Side::Buy, 55, 20)).await.unwrap();
    house.place_order(market_id, limit(agents[1], Side::Sell, 55, 12)).await.unwrap();
    house.place_order(market_id, limit(agents[2], Side::Sell, 55, 8)).await.unwrap();
    house.place_order(market_id, limit(agents[3], Side::Buy, 40, 5)).await.unwrap();

    house.begin_resolution(market_id).await.unwrap();
    house.settle_with_outcome(market_id, Outcome::No).await.unwrap();

    let ledger = house.ledger();
    ledger.verify_all().unwrap();

    // Total money in the system is unchanged (fee-free market)
    let total: u64 = agents
        .iter()
        .map(|&agent| {
            let (available, locked) = ledger.balance_of(agent).unwrap();
            assert_eq!(locked, 0, "no locks survive settlement");
            available
        })
        .sum();
    assert_eq!(total, 200_000);
}
