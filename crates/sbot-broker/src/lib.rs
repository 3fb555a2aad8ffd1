//! Broker adapter port.
//!
//! Every brokerage backend (paper or live vendor) implements [`Broker`].
//! The engine consumes the port as `Arc<dyn Broker>`; all calls may suspend
//! and none are cancel-safe mid-call, so cancellation is observed between
//! calls. Adapters own their transport state (connection, stream) and must
//! impose their own network timeouts.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sbot_schemas::{OrderSide, OrderType};

#[derive(Clone, Debug)]
pub struct BrokerError {
    pub message: String,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker error: {}", self.message)
    }
}

impl std::error::Error for BrokerError {}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub cash: f64,
    pub equity: f64,
    pub portfolio_value: f64,
    pub buying_power: f64,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed: negative for shorts.
    pub quantity: f64,
    pub side: String,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: Option<f64>,
    pub avg_fill_price: Option<f64>,
    /// Raw vendor status; map with `sbot_schemas::map_broker_status`.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Latest quote for one symbol: mid price plus bid/ask/volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

/// One OHLCV bar. The engine only consumes daily bars.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    Day,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolCapabilities {
    pub tradable: bool,
    pub fractionable: bool,
}

/// Payload delivered by the optional trade-update stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub order_id: String,
    pub symbol: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// Stream callback. Must not block and must not touch engine shared state;
/// the runner's callback only signals its wake event.
pub type TradeUpdateCallback = Arc<dyn Fn(TradeUpdate) + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<bool>;
    async fn disconnect(&self) -> BrokerResult<bool>;
    async fn is_connected(&self) -> bool;

    async fn get_account_info(&self) -> BrokerResult<AccountInfo>;
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    /// Submit an order. `price` is required for non-market types; for
    /// stop-limit orders the single price is used for both legs.
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> BrokerResult<BrokerOrder>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool>;
    async fn get_order(&self, order_id: &str) -> BrokerResult<BrokerOrder>;
    async fn get_orders(&self, status: Option<&str>) -> BrokerResult<Vec<BrokerOrder>>;

    async fn get_market_data(&self, symbol: &str) -> BrokerResult<Quote>;

    async fn get_historical_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
        timeframe: Timeframe,
    ) -> BrokerResult<Vec<Bar>>;

    async fn is_market_open(&self) -> BrokerResult<bool>;
    async fn get_next_market_open(&self) -> BrokerResult<Option<DateTime<Utc>>>;

    async fn is_symbol_tradable(&self, symbol: &str) -> BrokerResult<bool> {
        let _ = symbol;
        Ok(true)
    }

    async fn is_symbol_fractionable(&self, symbol: &str) -> BrokerResult<bool> {
        let _ = symbol;
        Ok(true)
    }

    async fn get_symbol_capabilities(&self, symbol: &str) -> BrokerResult<SymbolCapabilities> {
        Ok(SymbolCapabilities {
            tradable: self.is_symbol_tradable(symbol).await?,
            fractionable: self.is_symbol_fractionable(symbol).await?,
        })
    }

    /// Optional trade-update stream. Returns false when the backend does not
    /// support streaming; callers must fall back to pure polling.
    async fn start_trade_update_stream(&self, on_update: TradeUpdateCallback) -> BrokerResult<bool> {
        let _ = on_update;
        Ok(false)
    }

    async fn stop_trade_update_stream(&self) -> BrokerResult<bool> {
        Ok(false)
    }
}
