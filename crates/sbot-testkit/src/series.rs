//! Deterministic daily-series fixtures for backtest and screener tests.

use chrono::{NaiveDate, TimeZone, Utc};

use sbot_screener::{with_sma, ChartPoint};

/// Build a daily chart series from explicit closes, one bar per calendar
/// day starting at `start`. High/low are a symmetric envelope around the
/// close. SMA overlays are attached.
pub fn series_from_closes(start: NaiveDate, closes: &[f64], range_pct: f64) -> Vec<ChartPoint> {
    let points = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let date = start + chrono::Duration::days(i as i64);
            let ts = Utc
                .from_utc_datetime(&date.and_hms_opt(21, 0, 0).expect("valid bar close time"));
            ChartPoint {
                timestamp: ts,
                close,
                high: close * (1.0 + range_pct / 100.0),
                low: close * (1.0 - range_pct / 100.0),
                sma50: None,
                sma250: None,
            }
        })
        .collect();
    with_sma(points)
}

/// Range-bound closes with a gentle wiggle and periodic sharp dips that
/// trigger the dip-buy entry, recovering over the following days.
pub fn range_bound_dip_series(
    start: NaiveDate,
    days: usize,
    base: f64,
    dip_every: usize,
    dip_pct: f64,
) -> Vec<ChartPoint> {
    let mut closes = Vec::with_capacity(days);
    for i in 0..days {
        let wiggle = (i as f64 / 9.0).sin() * 0.002;
        let mut close = base * (1.0 + wiggle);
        if dip_every > 0 && i > 0 && i % dip_every == 0 {
            close *= 1.0 - dip_pct / 100.0;
        }
        closes.push(close);
    }
    series_from_closes(start, &closes, 0.8)
}

/// Steady geometric climb (or decline for negative `daily_pct`).
pub fn trending_series(start: NaiveDate, days: usize, base: f64, daily_pct: f64) -> Vec<ChartPoint> {
    let closes: Vec<f64> = (0..days)
        .map(|i| base * (1.0 + daily_pct / 100.0).powi(i as i32))
        .collect();
    series_from_closes(start, &closes, 0.5)
}
