//! Entry/exit indicators computed on a daily chart series.

use serde::{Deserialize, Serialize};

use crate::chart::ChartPoint;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub take_profit_pct: f64,
    pub trailing_stop_pct: f64,
    pub atr_stop_mult: f64,
    pub zscore_entry_threshold: f64,
    pub dip_buy_threshold_pct: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            take_profit_pct: 5.0,
            trailing_stop_pct: 2.5,
            atr_stop_mult: 1.8,
            zscore_entry_threshold: -1.5,
            dip_buy_threshold_pct: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChartIndicators {
    pub latest_close: f64,
    pub atr14: f64,
    pub atr14_pct: f64,
    pub zscore20: f64,
    pub take_profit_price: f64,
    pub trailing_stop_price: f64,
    pub atr_stop_price: f64,
    pub dip_trigger_price: Option<f64>,
    pub dip_buy_signal: bool,
}

/// Compute the indicator set on a chart series. Returns None when fewer than
/// two valid closes exist.
///
/// ATR(14) is the mean of the last 14 true ranges where
/// TR = max(high − low, |high − prev_close|, |low − prev_close|); missing
/// high/low fall back to the close/prev-close envelope. The z-score uses a
/// 20-bar window with population standard deviation. The dip signal requires
/// both close ≤ SMA50·(1 − threshold%) and z20 ≤ the entry threshold.
pub fn chart_indicators(points: &[ChartPoint], params: &IndicatorParams) -> Option<ChartIndicators> {
    let valid: Vec<&ChartPoint> = points
        .iter()
        .filter(|p| p.close.is_finite() && p.close > 0.0)
        .collect();
    if valid.len() < 2 {
        return None;
    }

    let closes: Vec<f64> = valid.iter().map(|p| p.close).collect();
    let latest_close = *closes.last().expect("non-empty");

    let atr_window = 14.min(closes.len() - 1);
    let start_idx = closes.len() - atr_window;
    let mut true_ranges = Vec::with_capacity(atr_window);
    for idx in start_idx..closes.len() {
        let prev_close = closes[idx - 1];
        let close = closes[idx];
        let mut high = sanitize(valid[idx].high).unwrap_or_else(|| close.max(prev_close));
        let mut low = sanitize(valid[idx].low).unwrap_or_else(|| close.min(prev_close));
        if high < low {
            std::mem::swap(&mut high, &mut low);
        }
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        if tr.is_finite() && tr >= 0.0 {
            true_ranges.push(tr);
        }
    }
    let atr14 = if true_ranges.is_empty() {
        0.0
    } else {
        true_ranges.iter().sum::<f64>() / true_ranges.len() as f64
    };
    let atr14_pct = if latest_close > 0.0 {
        atr14 / latest_close * 100.0
    } else {
        0.0
    };

    let z_window = 20.min(closes.len());
    let z_slice = &closes[closes.len() - z_window..];
    let z_mean = z_slice.iter().sum::<f64>() / z_slice.len() as f64;
    let variance = z_slice.iter().map(|v| (v - z_mean).powi(2)).sum::<f64>() / z_slice.len() as f64;
    let z_std = variance.sqrt();
    let zscore20 = if z_std > 0.0 {
        (latest_close - z_mean) / z_std
    } else {
        0.0
    };

    let latest_sma50 = valid.last().and_then(|p| p.sma50);
    let (dip_trigger_price, dip_buy_signal) = match latest_sma50 {
        Some(sma50) if sma50 > 0.0 => {
            let trigger = sma50 * (1.0 - params.dip_buy_threshold_pct / 100.0);
            let signal = latest_close <= trigger && zscore20 <= params.zscore_entry_threshold;
            (Some(trigger), signal)
        }
        _ => (None, false),
    };

    let trailing_window = 20.min(closes.len());
    let trailing_peak = closes[closes.len() - trailing_window..]
        .iter()
        .fold(f64::MIN, |acc, v| acc.max(*v));

    Some(ChartIndicators {
        latest_close,
        atr14,
        atr14_pct,
        zscore20,
        take_profit_price: latest_close * (1.0 + params.take_profit_pct / 100.0),
        trailing_stop_price: trailing_peak * (1.0 - params.trailing_stop_pct / 100.0),
        atr_stop_price: latest_close * (1.0 - params.atr_stop_mult * atr14_pct / 100.0),
        dip_trigger_price,
        dip_buy_signal,
    })
}

fn sanitize(value: f64) -> Option<f64> {
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn series_from_closes(closes: &[f64]) -> Vec<ChartPoint> {
        let now = Utc::now();
        let n = closes.len();
        crate::with_sma(
            closes
                .iter()
                .enumerate()
                .map(|(i, &close)| ChartPoint {
                    timestamp: now - Duration::days((n - i) as i64),
                    close,
                    high: close * 1.01,
                    low: close * 0.99,
                    sma50: None,
                    sma250: None,
                })
                .collect(),
        )
    }

    #[test]
    fn needs_at_least_two_closes() {
        let params = IndicatorParams::default();
        assert!(chart_indicators(&[], &params).is_none());
        assert!(chart_indicators(&series_from_closes(&[100.0]), &params).is_none());
        assert!(chart_indicators(&series_from_closes(&[100.0, 101.0]), &params).is_some());
    }

    #[test]
    fn flat_series_has_zero_atr_and_z() {
        let closes = vec![100.0; 60];
        let ind = chart_indicators(&series_from_closes(&closes), &IndicatorParams::default()).unwrap();
        assert_eq!(ind.zscore20, 0.0);
        // The 1% high/low envelope gives a 2-point true range on a flat 100 close.
        assert!((ind.atr14 - 2.0).abs() < 1e-9);
        assert!((ind.atr14_pct - 2.0).abs() < 1e-9);
        assert!(!ind.dip_buy_signal);
    }

    #[test]
    fn dip_below_sma_with_negative_z_triggers_signal() {
        // 59 flat closes at 100, then a sharp drop to 90: close is far below
        // SMA50 and the 20-bar z-score is strongly negative.
        let mut closes = vec![100.0; 59];
        closes.push(90.0);
        let ind = chart_indicators(&series_from_closes(&closes), &IndicatorParams::default()).unwrap();
        assert!(ind.zscore20 < -1.5);
        let trigger = ind.dip_trigger_price.unwrap();
        assert!(ind.latest_close <= trigger);
        assert!(ind.dip_buy_signal);
    }

    #[test]
    fn dip_without_z_confirmation_does_not_trigger() {
        // Gradual drift keeps the z-score mild even when price sits below
        // the dip trigger; both legs must hold.
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..80 {
            closes.push(110.0 - i as f64 * 0.35);
        }
        let params = IndicatorParams {
            zscore_entry_threshold: -3.5,
            ..IndicatorParams::default()
        };
        let ind = chart_indicators(&series_from_closes(&closes), &params).unwrap();
        if let Some(trigger) = ind.dip_trigger_price {
            assert!(ind.latest_close <= trigger);
        }
        assert!(!ind.dip_buy_signal);
    }

    #[test]
    fn exit_prices_derive_from_latest_close() {
        let closes = vec![100.0; 60];
        let ind = chart_indicators(&series_from_closes(&closes), &IndicatorParams::default()).unwrap();
        assert!((ind.take_profit_price - 105.0).abs() < 1e-9);
        assert!((ind.trailing_stop_price - 97.5).abs() < 1e-9);
        // atr_stop = 100 * (1 - 1.8 * 2.0 / 100) = 96.4
        assert!((ind.atr_stop_price - 96.4).abs() < 1e-9);
    }
}
