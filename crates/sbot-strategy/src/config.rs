//! Typed strategy configuration.
//!
//! The persisted strategy row carries a free-form JSON config; this module
//! gives it a bounded shape: identity, symbol set, the tunable parameter
//! table and the regime allow-list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sbot_screener::MarketRegime;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    /// Target notional per entry, in dollars.
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: f64,
    pub atr_stop_mult: f64,
    pub zscore_entry_threshold: f64,
    pub dip_buy_threshold_pct: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            position_size: 1000.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 5.0,
            trailing_stop_pct: 2.5,
            atr_stop_mult: 1.8,
            zscore_entry_threshold: -1.5,
            dip_buy_threshold_pct: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub name: String,
    pub strategy_id: Option<i64>,
    pub symbols: Vec<String>,
    #[serde(flatten)]
    pub params: StrategyParams,
    pub allowed_regimes: Vec<MarketRegime>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "metrics_driven".to_string(),
            strategy_id: None,
            symbols: Vec::new(),
            params: StrategyParams::default(),
            allowed_regimes: vec![MarketRegime::RangeBound, MarketRegime::TrendingUp],
        }
    }
}

impl StrategyConfig {
    /// Parse a persisted config blob, filling gaps with defaults.
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("strategy config serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let mut config = StrategyConfig::default();
        config.name = "weekly".to_string();
        config.symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        config.params.take_profit_pct = 6.5;

        let parsed = StrategyConfig::from_json(&config.to_json());
        assert_eq!(parsed.name, "weekly");
        assert_eq!(parsed.symbols.len(), 2);
        assert_eq!(parsed.params.take_profit_pct, 6.5);
        assert_eq!(parsed.allowed_regimes, config.allowed_regimes);
    }

    #[test]
    fn partial_blob_fills_defaults() {
        let parsed = StrategyConfig::from_json(&json!({
            "name": "partial",
            "symbols": ["SPY"],
            "stop_loss_pct": 3.0
        }));
        assert_eq!(parsed.name, "partial");
        assert_eq!(parsed.params.stop_loss_pct, 3.0);
        assert_eq!(parsed.params.position_size, 1000.0);
        assert!(parsed
            .allowed_regimes
            .contains(&MarketRegime::RangeBound));
    }
}
