//! Veridex - Prediction-Market Clearinghouse Core
//!
//! Matching, escrow, settlement and rating for binary (YES/NO) outcome
//! contracts, built for autonomous trading agents.
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (AgentId, MarketId, Clock, ...)
//! - [`config`] - Runtime configuration (logging + clearing defaults)
//! - [`models`] - Agents, markets, orders, trades, positions
//! - [`errors`] - The full error taxonomy
//! - [`money`] - Fixed-precision cents and probability prices
//! - [`fee`] - Fee schedule (symmetric on notional exposure)
//! - [`event_bus`] - In-process topic pub/sub with wildcard patterns
//! - [`balance`] - Enforced wallet balance type
//! - [`ledger`] - Journal-backed escrow ledger
//! - [`orderbook`] - BTreeMap-based price-time priority book
//! - [`depth_buffer`] - Zero-copy depth projection for lock-free reads
//! - [`engine`] - Matching engine (one per market, single-writer)
//! - [`oracle`] - Declarative resolution schemas and the HTTP resolver
//! - [`settlement`] - Deterministic market settlement
//! - [`rating`] - Composite truth-score reputation engine
//! - [`store`] - Pluggable persistence interface
//! - [`clearinghouse`] - Composition root wiring it all together

// Core types - must be first!
pub mod core_types;

// Configuration & observability
pub mod config;
pub mod logging;

// Trading components
pub mod balance;
pub mod clearinghouse;
pub mod depth_buffer;
pub mod engine;
pub mod errors;
pub mod event_bus;
pub mod fee;
pub mod ledger;
pub mod models;
pub mod money;
pub mod oracle;
pub mod orderbook;
pub mod rating;
pub mod settlement;
pub mod store;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use clearinghouse::{Clearinghouse, CreateMarket};
pub use config::{AppConfig, ClearingConfig};
pub use core_types::{AgentId, Clock, IdSource, MarketId, OrderId, TradeId};
pub use depth_buffer::DepthBuffer;
pub use engine::{MatchingEngine, OrderResult, PlaceOrder};
pub use errors::{CoreError, CoreResult};
pub use event_bus::EventBus;
pub use ledger::{EntryRef, EscrowLedger, JournalEntry, JournalKind};
pub use models::{
    Agent, AgentStatus, Market, MarketStatus, Order, OrderStatus, OrderType, Outcome, Position,
    Side, Trade,
};
pub use money::Price;
pub use oracle::{OracleResolver, Resolution, ResolutionSchema, RetryPolicy};
pub use orderbook::OrderBook;
pub use rating::{Certificate, Grade, RatingEngine};
pub use settlement::{SettlementEngine, SettlementReport};
pub use store::{CoreStore, MemoryStore};
