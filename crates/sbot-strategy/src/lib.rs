//! Strategy interface and implementations.
//!
//! The runner treats a strategy as an object with on_start/on_tick/on_stop
//! hooks plus identity accessors; `on_tick` receives the latest quotes for
//! the strategy's symbol set and returns signal requests for the execution
//! service. No strategy is ever invoked concurrently with itself.

mod buy_and_hold;
mod config;
mod metrics_driven;

pub use buy_and_hold::BuyAndHoldStrategy;
pub use config::{StrategyConfig, StrategyParams};
pub use metrics_driven::MetricsDrivenStrategy;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sbot_broker::Quote;
use sbot_schemas::OrderType;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Close,
    Hold,
}

/// One actionable signal emitted by a strategy tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalRequest {
    pub symbol: String,
    pub signal: Signal,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub reason: String,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn symbols(&self) -> Vec<String>;
    /// Storage row id, when the strategy was loaded from a persisted record.
    fn strategy_id(&self) -> Option<i64>;

    fn on_start(&mut self);
    async fn on_tick(&mut self, quotes: &HashMap<String, Quote>) -> Vec<SignalRequest>;
    fn on_stop(&mut self);
}
