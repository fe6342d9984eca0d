// Exchange collaborators: market data in, orders out
pub mod gateio;
pub mod memory;
pub mod paper;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{Candle, Resolution, Side, SymbolInfo};

pub use gateio::GateIoClient;
pub use memory::MemoryMarket;
pub use paper::PaperAccount;

/// Receiving end of a live candle feed
pub type CandleStream = mpsc::Receiver<(String, Candle)>;

/// Failure reported by an exchange collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("stale symbol constraints: {0}")]
    StaleConstraints(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl BrokerError {
    /// Map an exchange error label and message to a category
    ///
    /// Gate.io returns `{"label": "...", "message": "..."}` bodies; labels such
    /// as `ORDER_SIZE_TOO_SMALL` or `BALANCE_NOT_ENOUGH` carry the meaning.
    pub fn classify(label: &str, message: &str) -> Self {
        let text = format!("{} {}", label, message).to_uppercase();
        let detail = if message.is_empty() {
            label.to_string()
        } else {
            format!("{}: {}", label, message)
        };

        let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        if any(&["SIGNATURE", "INVALID_KEY", "FORBIDDEN", "UNAUTHORIZED"]) {
            BrokerError::Auth(detail)
        } else if any(&["TOO_MANY", "TOO MANY", "RATE LIMIT"]) {
            BrokerError::RateLimited(detail)
        } else if any(&["BALANCE", "INSUFFICIENT", "MARGIN"]) {
            BrokerError::InsufficientBalance(detail)
        } else if any(&["SIZE", "PRECISION", "QUANTO", "TICK", "LOT", "MIN_QTY"]) {
            BrokerError::StaleConstraints(detail)
        } else {
            BrokerError::Rejected(detail)
        }
    }

    /// Whether the symbol should sit out a cooldown before the next attempt
    pub fn needs_cooldown(&self) -> bool {
        matches!(
            self,
            BrokerError::StaleConstraints(_) | BrokerError::RateLimited(_)
        )
    }

    /// Whether the symbol's constraints should be refetched
    pub fn needs_catalog_refresh(&self) -> bool {
        matches!(self, BrokerError::StaleConstraints(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::Malformed(_) | BrokerError::RateLimited(_)
        )
    }
}

/// Account balances in settlement currency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equity {
    pub total: f64,
    pub available: f64,
}

/// Order acknowledgement
///
/// `avg_price` is None when the fill price is not yet known (resting orders).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
}

/// Source of candles and tradable symbols
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn fetch_universe(&self) -> Result<Vec<SymbolInfo>, BrokerError>;

    /// Constraints for a single symbol
    async fn fetch_symbol(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError> {
        Ok(self
            .fetch_universe()
            .await?
            .into_iter()
            .find(|info| info.symbol == symbol))
    }

    /// Open an unbounded feed of 1m candles for `symbols`
    ///
    /// The feed ends when the receiver is dropped.
    async fn stream_candles(&self, symbols: Vec<String>) -> Result<CandleStream, BrokerError>;
}

/// Trading account on the exchange
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn fetch_equity(&self) -> Result<Equity, BrokerError>;

    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, BrokerError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, BrokerError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), BrokerError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError>;
}
