//! Coarse market-regime classification from closing series.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    RangeBound,
    HighVolatilityRange,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::TrendingUp => "trending_up",
            MarketRegime::TrendingDown => "trending_down",
            MarketRegime::RangeBound => "range_bound",
            MarketRegime::HighVolatilityRange => "high_volatility_range",
            MarketRegime::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trending_up" => Some(MarketRegime::TrendingUp),
            "trending_down" => Some(MarketRegime::TrendingDown),
            "range_bound" => Some(MarketRegime::RangeBound),
            "high_volatility_range" => Some(MarketRegime::HighVolatilityRange),
            "unknown" => Some(MarketRegime::Unknown),
            _ => None,
        }
    }
}

/// Live detector over SPY closes (callers pass the last ~60 bars):
/// trend = (last − first)/first, vol = √(mean(r²)) of simple daily returns.
/// trending if |trend| > 4% with vol < 2%; high-volatility if vol ≥ 2%.
pub fn detect_market_regime(closes: &[f64]) -> MarketRegime {
    if closes.len() < 30 {
        return MarketRegime::Unknown;
    }
    classify(closes, 0.02)
}

/// Stricter multi-window variant used for backtest entries: 60- and 20-day
/// windows with a 1.5% vol threshold. Disagreement resolves to the more
/// cautious label (trending_down, then high_volatility_range, then the
/// 60-day read).
pub fn detect_regime_windowed(closes: &[f64]) -> MarketRegime {
    let regime_60 = regime_for_window(closes, 60);
    let regime_20 = regime_for_window(closes, 20);

    if regime_60 == regime_20 {
        return regime_60;
    }
    if regime_60 == MarketRegime::TrendingDown || regime_20 == MarketRegime::TrendingDown {
        return MarketRegime::TrendingDown;
    }
    if regime_60 == MarketRegime::HighVolatilityRange
        || regime_20 == MarketRegime::HighVolatilityRange
    {
        return MarketRegime::HighVolatilityRange;
    }
    regime_60
}

fn regime_for_window(closes: &[f64], window: usize) -> MarketRegime {
    let data = if closes.len() >= window {
        &closes[closes.len() - window..]
    } else {
        closes
    };
    if data.len() < 15 {
        return MarketRegime::Unknown;
    }
    classify(data, 0.015)
}

fn classify(data: &[f64], vol_threshold: f64) -> MarketRegime {
    let start = data[0];
    let end = data[data.len() - 1];
    let trend = if start > 0.0 { (end - start) / start } else { 0.0 };

    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 1..data.len() {
        let prev = data[i - 1];
        if prev > 0.0 {
            let r = (data[i] - prev) / prev;
            sum_sq += r * r;
            count += 1;
        }
    }
    let vol = if count > 0 {
        (sum_sq / count as f64).sqrt()
    } else {
        0.0
    };

    if trend > 0.04 && vol < vol_threshold {
        MarketRegime::TrendingUp
    } else if trend < -0.04 && vol < vol_threshold {
        MarketRegime::TrendingDown
    } else if vol >= vol_threshold {
        MarketRegime::HighVolatilityRange
    } else {
        MarketRegime::RangeBound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn short_series_is_unknown() {
        assert_eq!(detect_market_regime(&[100.0; 10]), MarketRegime::Unknown);
    }

    #[test]
    fn flat_series_is_range_bound() {
        assert_eq!(detect_market_regime(&[100.0; 60]), MarketRegime::RangeBound);
    }

    #[test]
    fn steady_climb_is_trending_up() {
        // +0.2% per day for 60 days: ~12% trend at ~0.2% daily vol.
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.002f64.powi(i)).collect();
        assert_eq!(detect_market_regime(&closes), MarketRegime::TrendingUp);
    }

    #[test]
    fn steady_decline_is_trending_down() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 0.998f64.powi(i)).collect();
        assert_eq!(detect_market_regime(&closes), MarketRegime::TrendingDown);
    }

    #[test]
    fn choppy_series_is_high_volatility() {
        let closes: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 104.0 })
            .collect();
        assert_eq!(
            detect_market_regime(&closes),
            MarketRegime::HighVolatilityRange
        );
    }

    #[test]
    fn detector_is_deterministic() {
        let closes = ramp(100.0, 0.05, 80);
        let a = detect_market_regime(&closes);
        let b = detect_market_regime(&closes);
        assert_eq!(a, b);
        let c = detect_regime_windowed(&closes);
        let d = detect_regime_windowed(&closes);
        assert_eq!(c, d);
    }

    #[test]
    fn windowed_disagreement_resolves_cautiously() {
        // Rise then fall: the full 60-day window nets out near flat
        // (range_bound) while the last 20 days read trending_down.
        let mut closes = ramp(100.0, 0.1, 40);
        closes.extend((0..20).map(|i| 104.0 - 0.235 * (i + 1) as f64));
        assert_eq!(regime_for_window(&closes, 60), MarketRegime::RangeBound);
        assert_eq!(regime_for_window(&closes, 20), MarketRegime::TrendingDown);
        assert_eq!(detect_regime_windowed(&closes), MarketRegime::TrendingDown);
    }
}
