//! Deterministic historical backtester.
//!
//! Replays daily closing bars over a date range with multi-symbol per-day
//! iteration, an upward-ratcheting ATR stop, take-profit / trailing / time
//! exits, slippage on every fill and a diagnostics report. Given the same
//! inputs, two runs produce identical reports: iteration order is fixed
//! (ascending dates, sorted symbols) and no wall-clock or randomness is
//! consulted.

mod params;
mod stats;
mod types;

pub use params::{resolve_parameters, DEFAULT_PARAMETERS};
pub use stats::{
    annualized_volatility, avg_hold_days, avg_win_loss, calmar_ratio, equity_returns, expectancy,
    max_consecutive_losses, max_drawdown_from_equity, profit_factor, recovery_factor,
    risk_based_position_size, sharpe_ratio, sortino_ratio, strategy_metrics_from_trades,
};
pub use types::{
    AdvancedMetrics, BacktestRequest, BacktestResult, BacktestTrade, BlockerCount, Diagnostics,
    EquityPoint, StrategyMetrics,
};

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::debug;

use sbot_screener::{detect_regime_windowed, ChartPoint, MarketRegime};

/// Slippage applied to every fill (basis points).
pub const DEFAULT_SLIPPAGE_BPS: f64 = 5.0;

/// Warmup history loaded before the start date, per symbol.
pub const WARMUP_DAYS: i64 = 320;

/// Minimum bars of history before an entry signal can be evaluated (the
/// z-score window uses the same span).
const MIN_SIGNAL_BARS: usize = 50;

#[derive(Clone, Debug)]
struct DayBar {
    date: NaiveDate,
    close: f64,
    high: f64,
    low: f64,
    sma50: Option<f64>,
}

#[derive(Clone, Debug)]
struct OpenPosition {
    entry_price: f64,
    qty: f64,
    peak_price: f64,
    atr_stop_price: f64,
    take_profit_price: f64,
    entry_date: NaiveDate,
}

struct SignalMetrics {
    atr14_pct: f64,
    zscore: f64,
    dip_buy_signal: bool,
    regime: MarketRegime,
}

/// Run a deterministic backtest over pre-loaded daily series.
///
/// `series_by_symbol` should include warmup history (>= [`WARMUP_DAYS`]
/// before `request.start_date`); symbols missing from the map or with no
/// usable bars are reported in the diagnostics.
pub fn run_backtest(
    request: &BacktestRequest,
    series_by_symbol: &BTreeMap<String, Vec<ChartPoint>>,
) -> BacktestResult {
    let params = resolve_parameters(&request.parameters);
    let slippage_bps = DEFAULT_SLIPPAGE_BPS;
    let max_hold_days = params.get("max_hold_days").copied().unwrap_or(10.0) as i64;

    let mut diagnostics = Diagnostics {
        symbols_requested: request.symbols.len(),
        parameters_used: params.clone(),
        ..Diagnostics::default()
    };
    for reason in [
        "insufficient_history",
        "no_dip_signal",
        "regime_filtered",
        "already_in_position",
        "risk_cap_too_low",
        "invalid_position_size",
        "cash_insufficient",
    ] {
        diagnostics.blocked_reasons.insert(reason.to_string(), 0);
    }
    for reason in ["stop_exit", "take_profit_exit", "time_exit", "end_of_backtest"] {
        diagnostics.exit_reasons.insert(reason.to_string(), 0);
    }

    // Normalize and index the series per symbol.
    let warmup_start = request.start_date - Duration::days(WARMUP_DAYS);
    let mut bars_by_symbol: BTreeMap<String, Vec<DayBar>> = BTreeMap::new();
    let mut date_index: BTreeMap<String, BTreeMap<NaiveDate, usize>> = BTreeMap::new();
    let mut all_dates: std::collections::BTreeSet<NaiveDate> = Default::default();

    for raw_symbol in &request.symbols {
        let symbol = raw_symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || bars_by_symbol.contains_key(&symbol) {
            continue;
        }
        let bars = series_by_symbol
            .get(&symbol)
            .map(|points| prepare_series(points, warmup_start, request.end_date))
            .unwrap_or_default();
        if bars.is_empty() {
            diagnostics.symbols_without_data.push(symbol);
            continue;
        }
        diagnostics.symbols_with_data += 1;
        let mut index = BTreeMap::new();
        for (i, bar) in bars.iter().enumerate() {
            index.insert(bar.date, i);
            all_dates.insert(bar.date);
        }
        date_index.insert(symbol.clone(), index);
        bars_by_symbol.insert(symbol, bars);
    }
    diagnostics.symbols_without_data.sort();
    diagnostics.symbols_without_data.dedup();

    let initial_capital = request.initial_capital;
    let mut cash = initial_capital;
    let mut trade_id = 1u64;
    let mut open_positions: BTreeMap<String, OpenPosition> = BTreeMap::new();
    let mut latest_price: BTreeMap<String, f64> = BTreeMap::new();
    let mut trades: Vec<BacktestTrade> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::new();

    if bars_by_symbol.is_empty() {
        diagnostics.advanced_metrics.slippage_bps_applied = slippage_bps;
        return empty_result(request, initial_capital, diagnostics);
    }

    for day in all_dates.iter().copied() {
        if day < request.start_date || day > request.end_date {
            continue;
        }
        diagnostics.trading_days_evaluated += 1;

        for (symbol, bars) in bars_by_symbol.iter() {
            let Some(&idx) = date_index[symbol].get(&day) else {
                continue;
            };
            diagnostics.bars_evaluated += 1;
            let bar = &bars[idx];
            latest_price.insert(symbol.clone(), bar.close);

            if let Some(position) = open_positions.get_mut(symbol) {
                // Recompute the ATR stop from today's close and ratchet
                // upward only.
                if let Some(atr_pct) = atr_pct_at(bars, idx) {
                    if atr_pct > 0.0 {
                        let new_stop =
                            bar.close * (1.0 - params["atr_stop_mult"] * atr_pct / 100.0);
                        if new_stop > position.atr_stop_price {
                            position.atr_stop_price = new_stop;
                        }
                    }
                }

                position.peak_price = position.peak_price.max(bar.close);
                let trailing_stop =
                    position.peak_price * (1.0 - params["trailing_stop_pct"] / 100.0);
                let effective_stop = position.atr_stop_price.max(trailing_stop);
                let take_profit = position.take_profit_price;
                let days_held = (day - position.entry_date).num_days();

                let exit = if days_held >= max_hold_days {
                    Some((bar.close * (1.0 - slippage_bps / 10_000.0), "time_exit"))
                } else if bar.low <= effective_stop {
                    Some((effective_stop * (1.0 - slippage_bps / 10_000.0), "stop_exit"))
                } else if bar.high >= take_profit {
                    Some((take_profit * (1.0 - slippage_bps / 10_000.0), "take_profit_exit"))
                } else {
                    None
                };

                if let Some((exit_price, reason)) = exit {
                    *diagnostics
                        .exit_reasons
                        .entry(reason.to_string())
                        .or_insert(0) += 1;
                    let position = open_positions.remove(symbol).expect("position present");
                    cash += position.qty * exit_price;
                    trades.push(build_trade(
                        &mut trade_id,
                        symbol,
                        &position,
                        day,
                        exit_price,
                        reason,
                        days_held,
                    ));
                    continue;
                }
                // Still held: no entry evaluation for this symbol today.
                *diagnostics
                    .blocked_reasons
                    .entry("already_in_position".to_string())
                    .or_insert(0) += 1;
                continue;
            }

            diagnostics.entry_checks += 1;
            let Some(metrics) = signal_metrics_at(bars, idx, &params) else {
                *diagnostics
                    .blocked_reasons
                    .entry("insufficient_history".to_string())
                    .or_insert(0) += 1;
                continue;
            };
            if !metrics.dip_buy_signal {
                *diagnostics
                    .blocked_reasons
                    .entry("no_dip_signal".to_string())
                    .or_insert(0) += 1;
                continue;
            }
            diagnostics.entry_signals += 1;
            // Dip-buy mean reversion only enters calm, sideways tape.
            if metrics.regime != MarketRegime::RangeBound {
                *diagnostics
                    .blocked_reasons
                    .entry("regime_filtered".to_string())
                    .or_insert(0) += 1;
                continue;
            }

            let open_equity = cash
                + open_positions
                    .iter()
                    .map(|(sym, pos)| {
                        pos.qty * latest_price.get(sym).copied().unwrap_or(pos.entry_price)
                    })
                    .sum::<f64>();
            let target_notional = risk_based_position_size(
                open_equity,
                params["risk_per_trade"],
                params["stop_loss_pct"],
                params["position_size"],
                cash,
            );
            if target_notional < 1.0 {
                *diagnostics
                    .blocked_reasons
                    .entry("risk_cap_too_low".to_string())
                    .or_insert(0) += 1;
                continue;
            }

            let fill_price = bar.close * (1.0 + slippage_bps / 10_000.0);
            let qty = if fill_price > 0.0 {
                target_notional / fill_price
            } else {
                0.0
            };
            if qty <= 0.0 {
                *diagnostics
                    .blocked_reasons
                    .entry("invalid_position_size".to_string())
                    .or_insert(0) += 1;
                continue;
            }
            let fill_notional = qty * fill_price;
            if fill_notional > cash {
                *diagnostics
                    .blocked_reasons
                    .entry("cash_insufficient".to_string())
                    .or_insert(0) += 1;
                continue;
            }

            cash -= fill_notional;
            let atr_stop = fill_price * (1.0 - params["atr_stop_mult"] * metrics.atr14_pct / 100.0);
            let stop_loss = fill_price * (1.0 - params["stop_loss_pct"] / 100.0);
            open_positions.insert(
                symbol.clone(),
                OpenPosition {
                    entry_price: fill_price,
                    qty,
                    peak_price: fill_price,
                    atr_stop_price: atr_stop.min(stop_loss),
                    take_profit_price: fill_price * (1.0 + params["take_profit_pct"] / 100.0),
                    entry_date: day,
                },
            );
            diagnostics.entries_opened += 1;
            debug!(symbol = %symbol, %day, fill_price, qty, z = metrics.zscore, "backtest entry");
        }

        let market_value: f64 = open_positions
            .iter()
            .map(|(sym, pos)| pos.qty * latest_price.get(sym).copied().unwrap_or(pos.entry_price))
            .sum();
        equity_curve.push(EquityPoint {
            date: day,
            equity: stats::round2(cash + market_value),
        });
    }

    // Force-close whatever is still open at the end of the window.
    if !open_positions.is_empty() {
        let final_day = request.end_date;
        let symbols: Vec<String> = open_positions.keys().cloned().collect();
        for symbol in symbols {
            let position = open_positions.remove(&symbol).expect("position present");
            let close = latest_price
                .get(&symbol)
                .copied()
                .unwrap_or(position.entry_price);
            let exit_price = close * (1.0 - slippage_bps / 10_000.0);
            cash += position.qty * exit_price;
            let days_held = (final_day - position.entry_date).num_days();
            *diagnostics
                .exit_reasons
                .entry("end_of_backtest".to_string())
                .or_insert(0) += 1;
            trades.push(build_trade(
                &mut trade_id,
                &symbol,
                &position,
                final_day,
                exit_price,
                "end_of_backtest",
                days_held,
            ));
        }
        equity_curve.push(EquityPoint {
            date: final_day,
            equity: stats::round2(cash),
        });
    }

    let final_capital = stats::round2(cash);
    let total_pnl = final_capital - initial_capital;
    let total_trades = trades.len();
    let winning_trades = trades.iter().filter(|t| t.pnl > 0.0).count();
    let losing_trades = trades.iter().filter(|t| t.pnl < 0.0).count();
    let win_rate = if total_trades > 0 {
        winning_trades as f64 / total_trades as f64 * 100.0
    } else {
        0.0
    };
    let total_return = if initial_capital > 0.0 {
        total_pnl / initial_capital * 100.0
    } else {
        0.0
    };

    let max_drawdown = max_drawdown_from_equity(&equity_curve);
    let returns = equity_returns(&equity_curve);
    let volatility = annualized_volatility(&returns);
    let sharpe = sharpe_ratio(&returns);
    let (avg_win, avg_loss) = avg_win_loss(&trades);

    let mut blockers: Vec<BlockerCount> = diagnostics
        .blocked_reasons
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(reason, count)| BlockerCount {
            reason: reason.clone(),
            count: *count,
        })
        .collect();
    blockers.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    blockers.truncate(5);
    diagnostics.top_blockers = blockers;

    diagnostics.advanced_metrics = AdvancedMetrics {
        profit_factor: round3(profit_factor(&trades)),
        sortino_ratio: round3(sortino_ratio(&returns)),
        expectancy_per_trade: stats::round2(expectancy(&trades)),
        avg_win: stats::round2(avg_win),
        avg_loss: stats::round2(avg_loss),
        avg_win_loss_ratio: if avg_loss != 0.0 {
            stats::round2(avg_win / avg_loss.abs())
        } else {
            0.0
        },
        max_consecutive_losses: max_consecutive_losses(&trades),
        recovery_factor: round3(recovery_factor(total_return, max_drawdown)),
        calmar_ratio: round3(calmar_ratio(&returns, max_drawdown)),
        avg_hold_days: (avg_hold_days(&trades) * 10.0).round() / 10.0,
        slippage_bps_applied: slippage_bps,
    };

    BacktestResult {
        strategy_id: request.strategy_id.clone(),
        start_date: request.start_date,
        end_date: request.end_date,
        initial_capital,
        final_capital,
        total_return,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        max_drawdown,
        sharpe_ratio: sharpe,
        volatility,
        trades,
        equity_curve,
        diagnostics,
    }
}

fn empty_result(
    request: &BacktestRequest,
    initial_capital: f64,
    diagnostics: Diagnostics,
) -> BacktestResult {
    BacktestResult {
        strategy_id: request.strategy_id.clone(),
        start_date: request.start_date,
        end_date: request.end_date,
        initial_capital,
        final_capital: initial_capital,
        total_return: 0.0,
        total_trades: 0,
        winning_trades: 0,
        losing_trades: 0,
        win_rate: 0.0,
        max_drawdown: 0.0,
        sharpe_ratio: 0.0,
        volatility: 0.0,
        trades: Vec::new(),
        equity_curve: Vec::new(),
        diagnostics,
    }
}

fn build_trade(
    trade_id: &mut u64,
    symbol: &str,
    position: &OpenPosition,
    exit_date: NaiveDate,
    exit_price: f64,
    reason: &str,
    days_held: i64,
) -> BacktestTrade {
    let id = *trade_id;
    *trade_id += 1;
    let pnl = (exit_price - position.entry_price) * position.qty;
    BacktestTrade {
        id,
        symbol: symbol.to_string(),
        entry_date: position.entry_date,
        exit_date,
        entry_price: round4(position.entry_price),
        exit_price: round4(exit_price),
        quantity: round6(position.qty),
        pnl: stats::round2(pnl),
        return_pct: if position.entry_price > 0.0 {
            stats::round2((exit_price - position.entry_price) / position.entry_price * 100.0)
        } else {
            0.0
        },
        reason: reason.to_string(),
        days_held,
    }
}

/// Normalize chart points into day bars inside [warmup_start, end], sorted
/// ascending. Non-positive closes are dropped; inverted high/low are
/// swapped.
fn prepare_series(points: &[ChartPoint], warmup_start: NaiveDate, end: NaiveDate) -> Vec<DayBar> {
    let mut bars: Vec<DayBar> = points
        .iter()
        .filter_map(|point| {
            let date = point.timestamp.date_naive();
            if date < warmup_start || date > end {
                return None;
            }
            if !point.close.is_finite() || point.close <= 0.0 {
                return None;
            }
            let (mut high, mut low) = (point.high, point.low);
            if !high.is_finite() || high <= 0.0 {
                high = point.close;
            }
            if !low.is_finite() || low <= 0.0 {
                low = point.close;
            }
            if high < low {
                std::mem::swap(&mut high, &mut low);
            }
            Some(DayBar {
                date,
                close: point.close,
                high,
                low,
                sma50: point.sma50,
            })
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);
    bars
}

/// ATR(14) as a percentage of the close at `idx`. Needs 14 prior bars.
fn atr_pct_at(bars: &[DayBar], idx: usize) -> Option<f64> {
    if idx < 14 {
        return None;
    }
    let close = bars[idx].close;
    if close <= 0.0 {
        return None;
    }
    let mut tr_values = Vec::with_capacity(14);
    for j in (idx - 13)..=idx {
        let prev_close = bars[j - 1].close;
        let tr = (bars[j].high - bars[j].low)
            .max((bars[j].high - prev_close).abs())
            .max((bars[j].low - prev_close).abs());
        tr_values.push(tr.max(0.0));
    }
    let atr_abs = tr_values.iter().sum::<f64>() / tr_values.len() as f64;
    Some(atr_abs / close * 100.0)
}

/// Entry metrics on history up to and including `idx`. The z-score uses a
/// 50-bar window for statistical stability; the entry signal is a composite
/// (dip below SMA50 trigger OR z-score at/below the threshold).
fn signal_metrics_at(
    bars: &[DayBar],
    idx: usize,
    params: &BTreeMap<String, f64>,
) -> Option<SignalMetrics> {
    if idx < MIN_SIGNAL_BARS {
        return None;
    }

    let closes: Vec<f64> = bars[..=idx].iter().map(|b| b.close).collect();
    let latest_close = closes[idx];
    let latest_sma50 = bars[idx].sma50.or_else(|| {
        if idx >= 49 {
            Some(closes[idx - 49..=idx].iter().sum::<f64>() / 50.0)
        } else {
            None
        }
    })?;

    let atr_pct = atr_pct_at(bars, idx).unwrap_or(0.0);

    let z_window = MIN_SIGNAL_BARS.min(closes.len());
    let z_slice = &closes[closes.len() - z_window..];
    let z_mean = z_slice.iter().sum::<f64>() / z_slice.len() as f64;
    let variance = z_slice.iter().map(|v| (v - z_mean).powi(2)).sum::<f64>() / z_slice.len() as f64;
    let z_std = variance.sqrt();
    let zscore = if z_std > 0.0 {
        (latest_close - z_mean) / z_std
    } else {
        0.0
    };

    let dip_trigger = latest_sma50 * (1.0 - params["dip_buy_threshold_pct"] / 100.0);
    let dip_condition = latest_close <= dip_trigger;
    let zscore_condition = zscore <= params["zscore_entry_threshold"];
    let dip_buy_signal = dip_condition || zscore_condition;

    Some(SignalMetrics {
        atr14_pct: atr_pct,
        zscore,
        dip_buy_signal,
        regime: detect_regime_windowed(&closes),
    })
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
