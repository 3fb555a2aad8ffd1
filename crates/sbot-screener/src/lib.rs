//! Market screener and indicator engine.
//!
//! Universe ranking, guardrail filtering, preset blending, chart series with
//! SMA overlays, entry/exit indicators and the SPY regime detector. All
//! numeric paths are deterministic for a given input series.

mod chart;
mod indicators;
mod regime;
mod universe;

pub use chart::{synthetic_series, with_sma, ChartPoint};
pub use indicators::{chart_indicators, ChartIndicators, IndicatorParams};
pub use regime::{detect_market_regime, detect_regime_windowed, MarketRegime};
pub use universe::{
    enrich_assets, fallback_etfs, fallback_stocks, optimize_assets, preset_guardrails,
    preset_symbols, Asset, AssetType, Guardrails, OptimizeConfig, PresetUniverseMode,
    SymbolCapability,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use tracing::warn;

use sbot_broker::{Broker, Timeframe};

const CACHE_TIMEOUT: StdDuration = StdDuration::from_secs(300);

struct CacheEntry {
    at: Instant,
    assets: Vec<Asset>,
}

/// Screener facade over an optional broker data source. Without a broker it
/// serves the deterministic fallback universes and synthetic chart series.
pub struct MarketScreener {
    broker: Option<Arc<dyn Broker>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl MarketScreener {
    pub fn new(broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            broker,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_active_stocks(&self, limit: usize) -> Vec<Asset> {
        let limit = limit.clamp(10, 200);
        self.cached(&format!("stocks_{limit}"), || {
            enrich_assets(fallback_stocks(limit))
        })
    }

    pub fn get_active_etfs(&self, limit: usize) -> Vec<Asset> {
        let limit = limit.clamp(10, 200);
        self.cached(&format!("etfs_{limit}"), || {
            enrich_assets(fallback_etfs(limit))
        })
    }

    pub fn get_screener_results(&self, asset_type: AssetType, limit: usize) -> Vec<Asset> {
        let limit = limit.clamp(10, 200);
        match asset_type {
            AssetType::Stock => self.get_active_stocks(limit),
            AssetType::Etf => self.get_active_etfs(limit),
            AssetType::Both => {
                let stock_limit = limit / 2;
                let etf_limit = limit - stock_limit;
                let mut combined = self.get_active_stocks(stock_limit.max(10));
                combined.extend(self.get_active_etfs(etf_limit.max(10)));
                combined.sort_by(|a, b| b.volume.cmp(&a.volume));
                combined.truncate(limit);
                combined
            }
        }
    }

    /// Curated assets for a strategy preset, optionally blended with the
    /// active universe.
    pub fn get_preset_assets(
        &self,
        asset_type: AssetType,
        preset: &str,
        limit: usize,
        mode: PresetUniverseMode,
    ) -> Result<Vec<Asset>, String> {
        let limit = limit.clamp(10, 200);
        let symbols = preset_symbols(asset_type, preset)
            .ok_or_else(|| format!("Unknown preset '{preset}' for asset type {asset_type:?}"))?;

        let universe = match asset_type {
            AssetType::Etf => self.get_active_etfs(200),
            _ => self.get_active_stocks(200),
        };
        let by_symbol: HashMap<&str, &Asset> =
            universe.iter().map(|a| (a.symbol.as_str(), a)).collect();

        let mut selected: Vec<Asset> = symbols
            .iter()
            .map(|symbol| match by_symbol.get(symbol.as_str()) {
                Some(asset) => (*asset).clone(),
                None => Asset::placeholder(symbol, asset_type),
            })
            .collect();

        match mode {
            PresetUniverseMode::SeedOnly => {}
            PresetUniverseMode::GuardrailOnly => {
                selected = universe.clone();
            }
            PresetUniverseMode::SeedGuardrailBlend => {
                let mut seen: Vec<String> = selected.iter().map(|a| a.symbol.clone()).collect();
                for asset in &universe {
                    if selected.len() >= limit {
                        break;
                    }
                    if seen.contains(&asset.symbol) {
                        continue;
                    }
                    seen.push(asset.symbol.clone());
                    selected.push(asset.clone());
                }
            }
        }

        selected.truncate(limit);
        Ok(enrich_assets(selected))
    }

    /// Historical daily chart with SMA50/SMA250 overlays. Falls back to a
    /// deterministic synthetic series when no broker data is available.
    pub async fn get_symbol_chart(&self, symbol: &str, days: usize) -> Vec<ChartPoint> {
        let days = days.clamp(60, 730);
        let symbol = symbol.to_ascii_uppercase();

        if let Some(broker) = &self.broker {
            let start = Utc::now() - Duration::days(days as i64 + 30);
            match broker
                .get_historical_bars(&symbol, start, None, None, Timeframe::Day)
                .await
            {
                Ok(bars) if !bars.is_empty() => {
                    let points = bars
                        .iter()
                        .map(|bar| {
                            let (mut high, mut low) = (bar.high, bar.low);
                            if high < low {
                                std::mem::swap(&mut high, &mut low);
                            }
                            ChartPoint {
                                timestamp: bar.timestamp,
                                close: bar.close,
                                high,
                                low,
                                sma50: None,
                                sma250: None,
                            }
                        })
                        .collect();
                    return with_sma(points);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "chart fetch failed, using synthetic series");
                }
            }
        }

        let base = fallback_base_price(&symbol);
        with_sma(synthetic_series(base, days))
    }

    /// Coarse market regime from SPY closes (last 60 of 80 days).
    pub async fn detect_market_regime(&self) -> MarketRegime {
        let points = self.get_symbol_chart("SPY", 80).await;
        let closes: Vec<f64> = points.iter().map(|p| p.close).collect();
        let tail = if closes.len() > 60 {
            &closes[closes.len() - 60..]
        } else {
            &closes[..]
        };
        detect_market_regime(tail)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn cached(&self, key: &str, build: impl FnOnce() -> Vec<Asset>) -> Vec<Asset> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(key) {
            if entry.at.elapsed() < CACHE_TIMEOUT {
                return entry.assets.clone();
            }
        }
        let assets = build();
        cache.insert(
            key.to_string(),
            CacheEntry {
                at: Instant::now(),
                assets: assets.clone(),
            },
        );
        assets
    }
}

fn fallback_base_price(symbol: &str) -> f64 {
    for asset in fallback_stocks(200).into_iter().chain(fallback_etfs(200)) {
        if asset.symbol == symbol {
            return asset.price;
        }
    }
    100.0
}
