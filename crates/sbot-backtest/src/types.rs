//! Backtest request/result types and the diagnostics report.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub strategy_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub symbols: Vec<String>,
    /// Overrides for the known tunable set; unknown keys are ignored.
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub id: u64,
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub return_pct: f64,
    /// stop_exit | take_profit_exit | time_exit | end_of_backtest
    pub reason: String,
    pub days_held: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetrics {
    pub profit_factor: f64,
    pub sortino_ratio: f64,
    pub expectancy_per_trade: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_win_loss_ratio: f64,
    pub max_consecutive_losses: u32,
    pub recovery_factor: f64,
    pub calmar_ratio: f64,
    pub avg_hold_days: f64,
    pub slippage_bps_applied: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub symbols_requested: usize,
    pub symbols_with_data: usize,
    pub symbols_without_data: Vec<String>,
    pub trading_days_evaluated: u64,
    pub bars_evaluated: u64,
    pub entry_checks: u64,
    pub entry_signals: u64,
    pub entries_opened: u64,
    pub blocked_reasons: BTreeMap<String, u64>,
    pub exit_reasons: BTreeMap<String, u64>,
    pub parameters_used: BTreeMap<String, f64>,
    /// Non-zero blockers, highest count first, at most five.
    pub top_blockers: Vec<BlockerCount>,
    pub advanced_metrics: AdvancedMetrics,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockerCount {
    pub reason: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub total_return: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub volatility: f64,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub diagnostics: Diagnostics,
}

/// Real-time metrics derived from recorded trades (operator reporting).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub strategy_id: String,
    pub win_rate: f64,
    pub volatility: f64,
    pub drawdown: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: f64,
    pub sharpe_ratio: Option<f64>,
}
