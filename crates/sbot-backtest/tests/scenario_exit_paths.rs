//! Exit-path coverage: take-profit, stop, time and end-of-window closes on
//! hand-built series.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use sbot_backtest::{run_backtest, BacktestRequest};
use sbot_screener::ChartPoint;
use sbot_testkit::series_from_closes;

const SERIES_DAYS: usize = 365;
const DIP_INDEX: usize = 360;

/// Flat closes at 100 with a single 3.5% dip at DIP_INDEX, then a caller
/// supplied tail.
fn dip_then(tail: &[f64]) -> Vec<ChartPoint> {
    let mut closes = vec![100.0; DIP_INDEX];
    closes.push(96.5);
    closes.extend_from_slice(tail);
    assert!(closes.len() <= SERIES_DAYS + tail.len() + 1);
    series_from_closes(series_start(), &closes, 0.8)
}

fn series_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn request_over(tail_len: usize, parameters: BTreeMap<String, f64>) -> BacktestRequest {
    BacktestRequest {
        strategy_id: "exit-paths".to_string(),
        start_date: series_start() + Duration::days(340),
        end_date: series_start() + Duration::days((DIP_INDEX + tail_len) as i64),
        initial_capital: 100_000.0,
        symbols: vec!["AAPL".to_string()],
        parameters,
    }
}

fn run(tail: &[f64], parameters: BTreeMap<String, f64>) -> sbot_backtest::BacktestResult {
    let mut series = BTreeMap::new();
    series.insert("AAPL".to_string(), dip_then(tail));
    run_backtest(&request_over(tail.len(), parameters), &series)
}

#[test]
fn rally_through_target_exits_at_take_profit() {
    // Take profit sits at ~96.55 * 1.05 = 101.4; the 102 bar's high crosses it.
    let result = run(&[98.0, 100.0, 102.0, 102.0], BTreeMap::new());
    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.reason, "take_profit_exit");
    assert!(trade.pnl > 0.0);
    assert_eq!(result.winning_trades, 1);
    assert_eq!(result.diagnostics.exit_reasons["take_profit_exit"], 1);
}

#[test]
fn crash_through_stop_exits_at_stop() {
    let result = run(&[90.0, 90.0, 90.0], BTreeMap::new());
    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.reason, "stop_exit");
    assert!(trade.pnl < 0.0);
    assert_eq!(result.losing_trades, 1);
}

#[test]
fn stale_position_exits_on_time() {
    let mut parameters = BTreeMap::new();
    parameters.insert("max_hold_days".to_string(), 3.0);
    // Mild drift that never touches the stop or the target; the window ends
    // on the forced-exit day.
    let result = run(&[97.0, 97.5, 97.8], parameters);
    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.reason, "time_exit");
    assert_eq!(trade.days_held, 3);
}

#[test]
fn open_position_is_force_closed_at_end() {
    // The window ends on the entry day.
    let result = run(&[], BTreeMap::new());
    assert_eq!(result.total_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.reason, "end_of_backtest");
    assert_eq!(trade.days_held, 0);
    assert_eq!(result.diagnostics.exit_reasons["end_of_backtest"], 1);
}

#[test]
fn flat_tape_records_no_dip_blocks() {
    let closes = vec![100.0; SERIES_DAYS];
    let mut series = BTreeMap::new();
    series.insert("AAPL".to_string(), series_from_closes(series_start(), &closes, 0.8));
    let request = BacktestRequest {
        strategy_id: "no-entries".to_string(),
        start_date: series_start() + Duration::days(340),
        end_date: series_start() + Duration::days(364),
        initial_capital: 100_000.0,
        symbols: vec!["AAPL".to_string()],
        parameters: BTreeMap::new(),
    };
    let result = run_backtest(&request, &series);
    assert_eq!(result.total_trades, 0);
    assert_eq!(result.final_capital, result.initial_capital);
    assert!(result.diagnostics.blocked_reasons["no_dip_signal"] > 0);
    assert_eq!(result.diagnostics.entries_opened, 0);
}
