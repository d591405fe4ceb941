//! Clearinghouse Error Types
//!
//! The full error taxonomy surfaced by the core. Every error is returned
//! to the caller; none is converted into a global panic. The two fatal
//! variants halt the affected market only and require operator action.

use thiserror::Error;

use crate::core_types::{AgentId, MarketId, OrderId};

/// Core error taxonomy
///
/// Error codes match the external interface contract for consistent
/// `*.rejected` / `*.failed` event payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    // === Validation Errors ===
    #[error("Invalid price: {0} (limit prices must be in [0.01, 0.99])")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),

    #[error("Invalid order type: {0}")]
    InvalidOrderType(String),

    #[error("Unknown market: {0}")]
    UnknownMarket(MarketId),

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Malformed resolution schema: {0}")]
    MalformedResolutionSchema(String),

    // === State Errors ===
    #[error("Market {0} is not tradable")]
    MarketNotTradable(MarketId),

    #[error("Already in a terminal state")]
    AlreadyTerminal,

    #[error("Position limit exceeded for agent {agent} on market {market}")]
    PositionLimitExceeded { agent: AgentId, market: MarketId },

    #[error("Wallet is frozen for account {0}")]
    WalletFrozen(u64),

    #[error("Invalid market state transition: {0}")]
    InvalidTransition(String),

    // === Resource Errors ===
    #[error("Insufficient funds: need {needed} cents, have {available} cents")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Invalid release: {requested} cents requested, {locked} cents locked")]
    InvalidRelease { requested: u64, locked: u64 },

    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    #[error("Wait deadline elapsed")]
    Timeout,

    // === Oracle Errors ===
    #[error("Oracle request timed out")]
    OracleTimeout,

    #[error("Oracle HTTP error: status {status}")]
    OracleHttpError { status: u16 },

    #[error("Oracle result indeterminate: {0}")]
    OracleIndeterminate(String),

    #[error("Oracle schema evaluation error: {0}")]
    OracleSchemaError(String),

    // === Fatal Errors (halt the affected market, never auto-recover) ===
    #[error("Settlement invariant violated on market {market}: {detail}")]
    SettlementInvariantViolated { market: MarketId, detail: String },

    #[error("Ledger invariant violated on account {account}: {detail}")]
    LedgerInvariantViolated { account: u64, detail: String },
}

impl CoreError {
    /// Stable error code for event payloads and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidPrice(_) => "INVALID_PRICE",
            CoreError::InvalidQuantity(_) => "INVALID_QUANTITY",
            CoreError::InvalidOrderType(_) => "INVALID_ORDER_TYPE",
            CoreError::UnknownMarket(_) => "UNKNOWN_MARKET",
            CoreError::UnknownAgent(_) => "UNKNOWN_AGENT",
            CoreError::MalformedResolutionSchema(_) => "MALFORMED_RESOLUTION_SCHEMA",
            CoreError::MarketNotTradable(_) => "MARKET_NOT_TRADABLE",
            CoreError::AlreadyTerminal => "ALREADY_TERMINAL",
            CoreError::PositionLimitExceeded { .. } => "POSITION_LIMIT_EXCEEDED",
            CoreError::WalletFrozen(_) => "WALLET_FROZEN",
            CoreError::InvalidTransition(_) => "INVALID_TRANSITION",
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CoreError::InvalidRelease { .. } => "INVALID_RELEASE",
            CoreError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            CoreError::Timeout => "TIMEOUT",
            CoreError::OracleTimeout => "ORACLE_TIMEOUT",
            CoreError::OracleHttpError { .. } => "ORACLE_HTTP_ERROR",
            CoreError::OracleIndeterminate(_) => "ORACLE_INDETERMINATE",
            CoreError::OracleSchemaError(_) => "ORACLE_SCHEMA_ERROR",
            CoreError::SettlementInvariantViolated { .. } => "SETTLEMENT_INVARIANT_VIOLATED",
            CoreError::LedgerInvariantViolated { .. } => "LEDGER_INVARIANT_VIOLATED",
        }
    }

    /// Fatal errors halt the affected market for manual inspection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::SettlementInvariantViolated { .. }
                | CoreError::LedgerInvariantViolated { .. }
        )
    }

    /// Retryable oracle failures (network-level and server-side).
    /// Status 0 marks a connection failure before any HTTP response.
    pub fn is_retryable_oracle(&self) -> bool {
        match self {
            CoreError::OracleTimeout => true,
            CoreError::OracleHttpError { status } => {
                *status == 0 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
