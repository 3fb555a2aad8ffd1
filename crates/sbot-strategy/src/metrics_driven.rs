//! Dip-buy / z-score entry with TP, trailing and ATR exits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use sbot_broker::Quote;
use sbot_schemas::OrderType;
use sbot_screener::{chart_indicators, IndicatorParams, MarketRegime, MarketScreener};

use crate::{Signal, SignalRequest, Strategy, StrategyConfig};

const CHART_LOOKBACK_DAYS: usize = 120;

#[derive(Clone, Debug)]
struct OpenLot {
    entry_price: f64,
    qty: f64,
    peak_price: f64,
    atr_stop_price: f64,
    take_profit_price: f64,
}

pub struct MetricsDrivenStrategy {
    config: StrategyConfig,
    screener: Arc<MarketScreener>,
    positions: HashMap<String, OpenLot>,
    last_regime: MarketRegime,
    running: bool,
}

impl MetricsDrivenStrategy {
    pub fn new(config: StrategyConfig, screener: Arc<MarketScreener>) -> Self {
        Self {
            config,
            screener,
            positions: HashMap::new(),
            last_regime: MarketRegime::Unknown,
            running: false,
        }
    }

    pub fn last_regime(&self) -> MarketRegime {
        self.last_regime
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn indicator_params(&self) -> IndicatorParams {
        IndicatorParams {
            take_profit_pct: self.config.params.take_profit_pct,
            trailing_stop_pct: self.config.params.trailing_stop_pct,
            atr_stop_mult: self.config.params.atr_stop_mult,
            zscore_entry_threshold: self.config.params.zscore_entry_threshold,
            dip_buy_threshold_pct: self.config.params.dip_buy_threshold_pct,
        }
    }
}

#[async_trait]
impl Strategy for MetricsDrivenStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn symbols(&self) -> Vec<String> {
        self.config.symbols.clone()
    }

    fn strategy_id(&self) -> Option<i64> {
        self.config.strategy_id
    }

    fn on_start(&mut self) {
        self.positions.clear();
        self.running = true;
    }

    async fn on_tick(&mut self, quotes: &HashMap<String, Quote>) -> Vec<SignalRequest> {
        let mut signals = Vec::new();
        let regime = self.screener.detect_market_regime().await;
        self.last_regime = regime;
        let params = self.config.params.clone();
        let indicator_params = self.indicator_params();

        for symbol in self.config.symbols.clone() {
            let Some(quote) = quotes.get(&symbol) else {
                continue;
            };
            let price = quote.price;
            if price <= 0.0 || !price.is_finite() {
                continue;
            }

            match self.positions.get_mut(&symbol) {
                None => {
                    let points = self
                        .screener
                        .get_symbol_chart(&symbol, CHART_LOOKBACK_DAYS)
                        .await;
                    let Some(indicators) = chart_indicators(&points, &indicator_params) else {
                        continue;
                    };
                    if !indicators.dip_buy_signal
                        || !self.config.allowed_regimes.contains(&regime)
                    {
                        continue;
                    }

                    let qty = (params.position_size / price).max(1.0);
                    let atr_stop =
                        price * (1.0 - params.atr_stop_mult * indicators.atr14_pct / 100.0);
                    let stop_loss = price * (1.0 - params.stop_loss_pct / 100.0);
                    let take_profit = price * (1.0 + params.take_profit_pct / 100.0);
                    self.positions.insert(
                        symbol.clone(),
                        OpenLot {
                            entry_price: price,
                            qty,
                            peak_price: price,
                            atr_stop_price: atr_stop.min(stop_loss),
                            take_profit_price: take_profit,
                        },
                    );
                    debug!(symbol = %symbol, price, qty, "dip entry");
                    signals.push(SignalRequest {
                        symbol: symbol.clone(),
                        signal: Signal::Buy,
                        quantity: qty,
                        order_type: OrderType::Market,
                        price: None,
                        reason: format!(
                            "Dip+zscore entry (regime={}, z={:.4})",
                            regime.as_str(),
                            indicators.zscore20
                        ),
                    });
                }
                Some(lot) => {
                    lot.peak_price = lot.peak_price.max(price);
                    let trailing_stop =
                        lot.peak_price * (1.0 - params.trailing_stop_pct / 100.0);
                    let should_exit = price <= lot.atr_stop_price
                        || price <= trailing_stop
                        || price >= lot.take_profit_price;
                    if should_exit {
                        let qty = lot.qty;
                        let reason = format!(
                            "Exit trigger tp={:.2}, trail={:.2}, atr_stop={:.2}, price={:.2}",
                            lot.take_profit_price, trailing_stop, lot.atr_stop_price, price
                        );
                        debug!(symbol = %symbol, entry = lot.entry_price, price, "exit");
                        self.positions.remove(&symbol);
                        signals.push(SignalRequest {
                            symbol: symbol.clone(),
                            signal: Signal::Sell,
                            quantity: qty,
                            order_type: OrderType::Market,
                            price: None,
                            reason,
                        });
                    }
                }
            }
        }

        signals
    }

    fn on_stop(&mut self) {
        self.running = false;
    }
}
