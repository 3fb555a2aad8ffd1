//! Two sequential runs over the same synthetic series must produce
//! bit-identical reports.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use sbot_backtest::{run_backtest, BacktestRequest};
use sbot_testkit::range_bound_dip_series;

fn request() -> (BacktestRequest, BTreeMap<String, Vec<sbot_screener::ChartPoint>>) {
    let series_start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut series = BTreeMap::new();
    series.insert(
        "AAPL".to_string(),
        range_bound_dip_series(series_start, 400, 100.0, 30, 3.5),
    );
    series.insert(
        "MSFT".to_string(),
        range_bound_dip_series(series_start, 400, 60.0, 30, 3.5),
    );

    let request = BacktestRequest {
        strategy_id: "dip-weekly".to_string(),
        start_date: series_start + chrono::Duration::days(330),
        end_date: series_start + chrono::Duration::days(399),
        initial_capital: 100_000.0,
        symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
        parameters: BTreeMap::new(),
    };
    (request, series)
}

#[test]
fn repeated_runs_are_bit_identical() {
    let (request, series) = request();
    let first = run_backtest(&request, &series);
    let second = run_backtest(&request, &series);

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn dip_series_produces_round_trips() {
    let (request, series) = request();
    let result = run_backtest(&request, &series);

    assert!(result.total_trades >= 4, "expected entries on dip days, got {}", result.total_trades);
    assert_eq!(result.diagnostics.symbols_with_data, 2);
    assert!(result.diagnostics.entries_opened >= 4);
    assert!(!result.equity_curve.is_empty());
    // Both symbols traded.
    assert!(result.trades.iter().any(|t| t.symbol == "AAPL"));
    assert!(result.trades.iter().any(|t| t.symbol == "MSFT"));
    // Every trade carries an exit reason from the closed set.
    for trade in &result.trades {
        assert!(matches!(
            trade.reason.as_str(),
            "stop_exit" | "take_profit_exit" | "time_exit" | "end_of_backtest"
        ));
    }
}

#[test]
fn missing_symbols_are_reported_not_fatal() {
    let (mut request, series) = request();
    request.symbols.push("NODATA".to_string());
    let result = run_backtest(&request, &series);
    assert_eq!(result.diagnostics.symbols_with_data, 2);
    assert_eq!(result.diagnostics.symbols_without_data, vec!["NODATA".to_string()]);
}
