//! Statistical calculations shared by the backtester and reporting.

use sbot_schemas::TradeRow;

use crate::types::{BacktestTrade, EquityPoint, StrategyMetrics};

const RISK_FREE_RATE: f64 = 0.02;
const TRADING_DAYS: f64 = 252.0;

/// Shared position-sizing rule used by both backtest and live runner.
///
/// Sizes the position so a full stop-loss hit equals the intended
/// risk-per-trade dollar amount (risk_dollars / stop_loss_pct), further
/// capped by the requested position size, available cash and a
/// 10%-of-equity guardrail. Floor $25.
pub fn risk_based_position_size(
    equity: f64,
    risk_per_trade_pct: f64,
    stop_loss_pct: f64,
    position_size_cap: f64,
    cash: f64,
) -> f64 {
    let risk_pct = risk_per_trade_pct.clamp(0.1, 5.0);
    let sl_pct = stop_loss_pct.clamp(0.5, 10.0);
    let mut caps = vec![position_size_cap];
    if equity > 0.0 {
        let risk_dollars = equity * (risk_pct / 100.0);
        caps.push((risk_dollars / (sl_pct / 100.0)).max(50.0));
        caps.push((equity * 0.10).max(75.0));
    }
    if cash > 0.0 {
        caps.push(cash);
    }
    let sized = caps.into_iter().fold(f64::INFINITY, f64::min);
    round2(sized).max(25.0)
}

pub fn equity_returns(curve: &[EquityPoint]) -> Vec<f64> {
    let mut returns = Vec::new();
    for window in curve.windows(2) {
        let prev = window[0].equity;
        if prev > 0.0 {
            returns.push((window[1].equity - prev) / prev);
        }
    }
    returns
}

/// Annualized volatility: sample stdev of daily returns times √252.
pub fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    round6(variance.sqrt() * TRADING_DAYS.sqrt())
}

/// Annualized Sharpe ratio over daily returns (2% risk-free).
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let mean_sq = returns.iter().map(|r| r * r).sum::<f64>() / returns.len() as f64;
    let daily_vol = (mean_sq - mean * mean).max(0.0).sqrt();
    if daily_vol == 0.0 {
        return 0.0;
    }
    let annualized_return = mean * TRADING_DAYS;
    let annualized_vol = daily_vol * TRADING_DAYS.sqrt();
    round4((annualized_return - RISK_FREE_RATE) / annualized_vol)
}

/// Annualized Sortino ratio (downside deviation only).
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return 0.0;
    }
    let downside_var = downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64;
    let downside_vol = downside_var.sqrt();
    if downside_vol == 0.0 {
        return 0.0;
    }
    round4((mean * TRADING_DAYS - RISK_FREE_RATE) / (downside_vol * TRADING_DAYS.sqrt()))
}

/// Gross profits / gross losses.
pub fn profit_factor(trades: &[BacktestTrade]) -> f64 {
    let gross_profits: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_losses: f64 = trades
        .iter()
        .filter(|t| t.pnl < 0.0)
        .map(|t| t.pnl)
        .sum::<f64>()
        .abs();
    if gross_losses == 0.0 {
        return if gross_profits > 0.0 { gross_profits } else { 0.0 };
    }
    gross_profits / gross_losses
}

/// Per-trade expected profit: avg_win·win_rate + avg_loss·loss_rate.
pub fn expectancy(trades: &[BacktestTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let winners: Vec<f64> = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
    let losers: Vec<f64> = trades.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl).collect();
    let total = trades.len() as f64;
    let win_rate = winners.len() as f64 / total;
    let loss_rate = losers.len() as f64 / total;
    let avg_win = mean_or_zero(&winners);
    let avg_loss = mean_or_zero(&losers);
    avg_win * win_rate + avg_loss * loss_rate
}

pub fn avg_win_loss(trades: &[BacktestTrade]) -> (f64, f64) {
    let winners: Vec<f64> = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
    let losers: Vec<f64> = trades.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl).collect();
    (mean_or_zero(&winners), mean_or_zero(&losers))
}

pub fn max_consecutive_losses(trades: &[BacktestTrade]) -> u32 {
    let mut max_streak = 0u32;
    let mut streak = 0u32;
    for trade in trades {
        if trade.pnl < 0.0 {
            streak += 1;
            max_streak = max_streak.max(streak);
        } else {
            streak = 0;
        }
    }
    max_streak
}

pub fn recovery_factor(total_return: f64, max_drawdown: f64) -> f64 {
    if max_drawdown == 0.0 {
        return if total_return > 0.0 { total_return } else { 0.0 };
    }
    total_return / max_drawdown
}

pub fn calmar_ratio(returns: &[f64], max_drawdown: f64) -> f64 {
    if returns.len() < 2 || max_drawdown == 0.0 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    mean * TRADING_DAYS * 100.0 / max_drawdown
}

pub fn avg_hold_days(trades: &[BacktestTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().map(|t| t.days_held as f64).sum::<f64>() / trades.len() as f64
}

/// Maximum drawdown percent from the equity-curve peak.
pub fn max_drawdown_from_equity(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 2 {
        return 0.0;
    }
    let mut peak = curve[0].equity;
    let mut max_drawdown = 0.0f64;
    for point in curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - point.equity) / peak * 100.0);
        }
    }
    round2(max_drawdown)
}

/// Operator-facing metrics from recorded trade rows: win rate, annualized
/// volatility of percent returns, drawdown from cumulative P&L, Sharpe.
pub fn strategy_metrics_from_trades(strategy_id: &str, trades: &[TradeRow]) -> StrategyMetrics {
    if trades.is_empty() {
        return StrategyMetrics {
            strategy_id: strategy_id.to_string(),
            ..StrategyMetrics::default()
        };
    }

    let total_trades = trades.len();
    let winning_trades = trades
        .iter()
        .filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0)
        .count();
    let losing_trades = trades
        .iter()
        .filter(|t| t.realized_pnl.unwrap_or(0.0) < 0.0)
        .count();
    let total_pnl: f64 = trades.iter().filter_map(|t| t.realized_pnl).sum();

    let mut pct_returns = Vec::new();
    for trade in trades {
        let Some(pnl) = trade.realized_pnl else {
            continue;
        };
        let cost_basis = if trade.quantity > 0.0 && trade.price > 0.0 {
            trade.quantity * trade.price
        } else {
            0.0
        };
        if cost_basis > 0.0 {
            pct_returns.push(pnl / cost_basis);
        } else if pnl != 0.0 {
            pct_returns.push(0.0);
        }
    }

    // Drawdown from the cumulative realized P&L peak.
    let mut cumulative = 0.0;
    let mut peak = 0.0f64;
    let mut drawdown = 0.0f64;
    for trade in trades {
        cumulative += trade.realized_pnl.unwrap_or(0.0);
        peak = peak.max(cumulative);
        if peak > 0.0 {
            drawdown = drawdown.max((peak - cumulative) / peak * 100.0);
        }
    }

    StrategyMetrics {
        strategy_id: strategy_id.to_string(),
        win_rate: winning_trades as f64 / total_trades as f64 * 100.0,
        volatility: annualized_volatility(&pct_returns),
        drawdown: round2(drawdown),
        total_trades,
        winning_trades,
        losing_trades,
        total_pnl,
        sharpe_ratio: if pct_returns.is_empty() {
            None
        } else {
            Some(sharpe_ratio(&pct_returns))
        },
    }
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub(crate) fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn trade(pnl: f64, days_held: i64) -> BacktestTrade {
        BacktestTrade {
            id: 0,
            symbol: "AAPL".to_string(),
            entry_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            exit_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            entry_price: 100.0,
            exit_price: 100.0,
            quantity: 1.0,
            pnl,
            return_pct: 0.0,
            reason: "stop_exit".to_string(),
            days_held,
        }
    }

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                equity,
            })
            .collect()
    }

    #[test]
    fn position_sizing_caps_and_floors() {
        // Unconstrained by equity: cap wins.
        assert_eq!(risk_based_position_size(100_000.0, 1.0, 2.0, 1000.0, 50_000.0), 1000.0);
        // Risk cap: 10_000 * 1% / 2% = 5000, but 10% equity = 1000 wins.
        assert_eq!(risk_based_position_size(10_000.0, 1.0, 2.0, 8000.0, 9000.0), 1000.0);
        // Cash-bound.
        assert_eq!(risk_based_position_size(100_000.0, 1.0, 2.0, 5000.0, 300.0), 300.0);
        // Floor at $25.
        assert_eq!(risk_based_position_size(100.0, 0.1, 10.0, 10.0, 5.0), 25.0);
        // Clamps out-of-range risk/stop inputs.
        assert_eq!(
            risk_based_position_size(10_000.0, 50.0, 0.01, 100_000.0, 100_000.0),
            risk_based_position_size(10_000.0, 5.0, 0.5, 100_000.0, 100_000.0)
        );
    }

    #[test]
    fn drawdown_from_curve() {
        let dd = max_drawdown_from_equity(&curve(&[100.0, 120.0, 90.0, 110.0]));
        // Peak 120 -> trough 90 = 25%.
        assert_eq!(dd, 25.0);
        assert_eq!(max_drawdown_from_equity(&curve(&[100.0])), 0.0);
    }

    #[test]
    fn profit_factor_and_expectancy() {
        let trades = vec![trade(10.0, 1), trade(-5.0, 2), trade(20.0, 3)];
        assert!((profit_factor(&trades) - 6.0).abs() < 1e-9);
        // avg_win 15 * 2/3 + avg_loss -5 * 1/3 = 10 - 5/3.
        assert!((expectancy(&trades) - (10.0 - 5.0 / 3.0)).abs() < 1e-9);
        let (avg_win, avg_loss) = avg_win_loss(&trades);
        assert_eq!(avg_win, 15.0);
        assert_eq!(avg_loss, -5.0);
    }

    #[test]
    fn loss_streaks() {
        let trades = vec![
            trade(-1.0, 1),
            trade(-1.0, 1),
            trade(2.0, 1),
            trade(-1.0, 1),
            trade(-1.0, 1),
            trade(-1.0, 1),
        ];
        assert_eq!(max_consecutive_losses(&trades), 3);
        assert_eq!(avg_hold_days(&trades), 1.0);
    }

    #[test]
    fn sharpe_flat_returns_is_zero() {
        assert_eq!(sharpe_ratio(&[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01]), 0.0);
        assert!(sharpe_ratio(&[0.01, 0.012, 0.009, 0.011]) > 0.0);
    }

    #[test]
    fn sortino_requires_downside() {
        assert_eq!(sortino_ratio(&[0.01, 0.02, 0.03]), 0.0);
        assert!(sortino_ratio(&[0.02, -0.01, 0.02, -0.005]).is_finite());
    }

    #[test]
    fn equity_returns_skip_nonpositive_bases() {
        let returns = equity_returns(&curve(&[100.0, 110.0, 0.0, 50.0]));
        // 0-base day is dropped.
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-9);
    }
}
