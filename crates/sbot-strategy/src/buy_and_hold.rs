//! Buy-and-hold stub: buy each configured symbol once, then hold.

use std::collections::HashMap;

use async_trait::async_trait;

use sbot_broker::Quote;
use sbot_schemas::OrderType;

use crate::{Signal, SignalRequest, Strategy};

pub struct BuyAndHoldStrategy {
    name: String,
    strategy_id: Option<i64>,
    symbols: Vec<String>,
    /// Shares per symbol.
    position_size: f64,
    bought: HashMap<String, bool>,
}

impl BuyAndHoldStrategy {
    pub fn new(
        name: impl Into<String>,
        strategy_id: Option<i64>,
        symbols: Vec<String>,
        position_size: f64,
    ) -> Self {
        Self {
            name: name.into(),
            strategy_id,
            symbols,
            position_size,
            bought: HashMap::new(),
        }
    }
}

#[async_trait]
impl Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    fn strategy_id(&self) -> Option<i64> {
        self.strategy_id
    }

    fn on_start(&mut self) {
        for symbol in &self.symbols {
            self.bought.insert(symbol.clone(), false);
        }
    }

    async fn on_tick(&mut self, quotes: &HashMap<String, Quote>) -> Vec<SignalRequest> {
        let mut signals = Vec::new();
        for symbol in &self.symbols {
            if !quotes.contains_key(symbol) {
                continue;
            }
            if self.bought.get(symbol).copied().unwrap_or(false) {
                continue;
            }
            self.bought.insert(symbol.clone(), true);
            signals.push(SignalRequest {
                symbol: symbol.clone(),
                signal: Signal::Buy,
                quantity: self.position_size,
                order_type: OrderType::Market,
                price: None,
                reason: "Buy and hold - initial purchase".to_string(),
            });
        }
        signals
    }

    fn on_stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quote(symbol: &str, price: f64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price,
            bid: price,
            ask: price,
            volume: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn buys_each_symbol_exactly_once() {
        let mut strategy = BuyAndHoldStrategy::new(
            "hold",
            None,
            vec!["AAPL".to_string(), "MSFT".to_string()],
            10.0,
        );
        strategy.on_start();

        let mut quotes = HashMap::new();
        quotes.insert("AAPL".to_string(), quote("AAPL", 100.0));
        let first = strategy.on_tick(&quotes).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].symbol, "AAPL");

        quotes.insert("MSFT".to_string(), quote("MSFT", 300.0));
        let second = strategy.on_tick(&quotes).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].symbol, "MSFT");

        assert!(strategy.on_tick(&quotes).await.is_empty());
    }
}
