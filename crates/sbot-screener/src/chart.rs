//! Daily chart series with SMA overlays and the synthetic fallback series.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub sma50: Option<f64>,
    pub sma250: Option<f64>,
}

/// Attach SMA50 and SMA250 overlays (simple trailing means, available once
/// enough history exists).
pub fn with_sma(points: Vec<ChartPoint>) -> Vec<ChartPoint> {
    let closes: Vec<f64> = points.iter().map(|p| p.close).collect();
    points
        .into_iter()
        .enumerate()
        .map(|(idx, mut point)| {
            point.sma50 = trailing_mean(&closes, idx, 50);
            point.sma250 = trailing_mean(&closes, idx, 250);
            point
        })
        .collect()
}

fn trailing_mean(closes: &[f64], idx: usize, window: usize) -> Option<f64> {
    if idx + 1 < window {
        return None;
    }
    let slice = &closes[idx + 1 - window..=idx];
    Some(slice.iter().sum::<f64>() / window as f64)
}

/// Deterministic synthetic daily series: mild upward trend plus layered
/// sin/cos noise, ending today. Used when no bar history is available.
pub fn synthetic_series(base_price: f64, days: usize) -> Vec<ChartPoint> {
    let now = Utc::now();
    (0..days)
        .map(|i| {
            let noise = (i as f64 / 7.0).sin() * 0.8 + (i as f64 / 17.0).cos() * 0.4;
            let trend = (i as f64 / days.max(1) as f64) * 0.05;
            let close = (base_price * (1.0 + trend + noise / 100.0)).max(1.0);
            let intraday_range_pct = 0.004 + noise.abs() / 300.0;
            ChartPoint {
                timestamp: now - Duration::days((days - i) as i64),
                close,
                high: close * (1.0 + intraday_range_pct),
                low: (close * (1.0 - intraday_range_pct)).max(0.01),
                sma50: None,
                sma250: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_overlays_appear_when_history_permits() {
        let points = with_sma(synthetic_series(100.0, 300));
        assert!(points[48].sma50.is_none());
        assert!(points[49].sma50.is_some());
        assert!(points[248].sma250.is_none());
        assert!(points[249].sma250.is_some());

        // SMA50 at index 49 is the mean of the first 50 closes.
        let expected: f64 = points[..50].iter().map(|p| p.close).sum::<f64>() / 50.0;
        assert!((points[49].sma50.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn synthetic_series_is_deterministic() {
        let a = synthetic_series(100.0, 120);
        let b = synthetic_series(100.0, 120);
        assert_eq!(a.len(), 120);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.close, y.close);
            assert!(x.high >= x.close && x.low <= x.close);
        }
    }
}
