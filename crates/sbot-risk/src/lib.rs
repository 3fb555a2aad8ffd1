//! Stateful pre-trade risk gate.
//!
//! Tracks daily P&L (auto-reset on the local day boundary), peak equity,
//! drawdown, consecutive losses and win/loss totals, and latches a circuit
//! breaker that blocks every validation until explicitly deactivated.
//!
//! `validate_order` applies its checks in a fixed order; the first failure
//! wins and is returned as a typed violation carrying the operator-facing
//! message.

use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use sbot_schemas::normalize_symbol;

/// Exposure snapshot for one held symbol, as seen by the risk gate.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionExposure {
    pub symbol: String,
    pub quantity: f64,
    pub market_value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RiskViolation {
    CircuitBreakerActive,
    InvalidSymbol,
    InvalidNumbers,
    PositionSizeExceeded { limit: f64 },
    DailyLossLimitReached { limit: f64 },
    ExposureLimitExceeded { projected: f64, limit: f64 },
    MaxOpenPositionsReached { limit: u32 },
    ConcentrationExceeded { projected_pct: f64, limit_pct: f64 },
}

impl fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskViolation::CircuitBreakerActive => {
                write!(f, "Circuit breaker is active - trading halted")
            }
            RiskViolation::InvalidSymbol => write!(f, "Invalid symbol format"),
            RiskViolation::InvalidNumbers => {
                write!(f, "Quantity and price must be positive finite numbers")
            }
            RiskViolation::PositionSizeExceeded { limit } => {
                write!(f, "Order exceeds max position size ({limit})")
            }
            RiskViolation::DailyLossLimitReached { limit } => {
                write!(f, "Daily loss limit reached ({limit})")
            }
            RiskViolation::ExposureLimitExceeded { projected, limit } => write!(
                f,
                "Portfolio exposure limit exceeded: projected ${projected:.2} > ${limit:.2}"
            ),
            RiskViolation::MaxOpenPositionsReached { limit } => {
                write!(f, "Max open positions reached ({limit})")
            }
            RiskViolation::ConcentrationExceeded {
                projected_pct,
                limit_pct,
            } => write!(
                f,
                "Symbol concentration limit exceeded: projected {projected_pct:.2}% > {limit_pct:.2}%"
            ),
        }
    }
}

impl std::error::Error for RiskViolation {}

#[derive(Clone, Debug, Serialize)]
pub struct RiskMetrics {
    pub daily_pnl: f64,
    pub daily_loss_limit: f64,
    pub daily_pnl_percent: f64,
    pub daily_loss_remaining: f64,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_reason: String,
    pub max_position_size: f64,
    pub max_portfolio_exposure: f64,
    pub max_symbol_concentration_pct: f64,
    pub max_open_positions: u32,
    pub consecutive_losses: u32,
    pub max_consecutive_losses: u32,
    pub total_wins: u64,
    pub total_losses: u64,
    pub peak_equity: f64,
    pub current_equity: f64,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Clone, Debug)]
pub struct RiskConfig {
    pub max_position_size: f64,
    pub daily_loss_limit: f64,
    pub max_portfolio_exposure: f64,
    pub max_symbol_concentration_pct: f64,
    pub max_open_positions: u32,
    pub max_consecutive_losses: u32,
    pub max_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 10_000.0,
            daily_loss_limit: 500.0,
            max_portfolio_exposure: 100_000.0,
            max_symbol_concentration_pct: 45.0,
            max_open_positions: 25,
            max_consecutive_losses: 3,
            max_drawdown_pct: 15.0,
        }
    }
}

#[derive(Debug)]
pub struct RiskManager {
    max_position_size: f64,
    daily_loss_limit: f64,
    max_portfolio_exposure: f64,
    max_symbol_concentration_pct: f64,
    max_open_positions: u32,
    max_consecutive_losses: u32,
    max_drawdown_pct: f64,

    daily_pnl: f64,
    daily_reset_time: NaiveDateTime,

    circuit_breaker_active: bool,
    circuit_breaker_reason: String,

    consecutive_losses: u32,
    total_losses: u64,
    total_wins: u64,

    peak_equity: f64,
    current_equity: f64,
    current_drawdown_pct: f64,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self::new_at(config, Local::now())
    }

    pub fn new_at(config: RiskConfig, now: DateTime<Local>) -> Self {
        Self {
            // Clamp limits into sane operating ranges.
            max_position_size: config.max_position_size.max(1.0),
            daily_loss_limit: config.daily_loss_limit.max(1.0),
            max_portfolio_exposure: config.max_portfolio_exposure.max(1.0),
            max_symbol_concentration_pct: config.max_symbol_concentration_pct.clamp(1.0, 100.0),
            max_open_positions: config.max_open_positions.max(1),
            max_consecutive_losses: config.max_consecutive_losses.max(1),
            max_drawdown_pct: config.max_drawdown_pct.clamp(1.0, 50.0),
            daily_pnl: 0.0,
            daily_reset_time: day_start(now),
            circuit_breaker_active: false,
            circuit_breaker_reason: String::new(),
            consecutive_losses: 0,
            total_losses: 0,
            total_wins: 0,
            peak_equity: 0.0,
            current_equity: 0.0,
            current_drawdown_pct: 0.0,
        }
    }

    pub fn validate_order(
        &mut self,
        symbol: &str,
        quantity: f64,
        price: f64,
        current_positions: &[PositionExposure],
    ) -> Result<(), RiskViolation> {
        self.reset_daily_stats_if_needed(Local::now());

        if self.circuit_breaker_active {
            return Err(RiskViolation::CircuitBreakerActive);
        }

        let normalized_symbol =
            normalize_symbol(symbol).map_err(|_| RiskViolation::InvalidSymbol)?;

        if !quantity.is_finite() || !price.is_finite() || quantity <= 0.0 || price <= 0.0 {
            return Err(RiskViolation::InvalidNumbers);
        }

        let order_value = quantity * price;

        if order_value > self.max_position_size {
            return Err(RiskViolation::PositionSizeExceeded {
                limit: self.max_position_size,
            });
        }

        if self.daily_pnl < -self.daily_loss_limit {
            return Err(RiskViolation::DailyLossLimitReached {
                limit: self.daily_loss_limit,
            });
        }

        let positions = normalize_exposures(current_positions);
        let current_exposure: f64 = positions.values().map(|v| v.max(0.0)).sum();
        let projected_exposure = current_exposure + order_value;
        if projected_exposure > self.max_portfolio_exposure {
            return Err(RiskViolation::ExposureLimitExceeded {
                projected: projected_exposure,
                limit: self.max_portfolio_exposure,
            });
        }

        let is_new_symbol = !positions.contains_key(&normalized_symbol);
        if is_new_symbol && positions.len() as u32 >= self.max_open_positions {
            return Err(RiskViolation::MaxOpenPositionsReached {
                limit: self.max_open_positions,
            });
        }

        // Concentration is only meaningful once the portfolio has exposure.
        if current_exposure > 0.0 {
            let existing_symbol_value = positions
                .get(&normalized_symbol)
                .copied()
                .unwrap_or(0.0)
                .max(0.0);
            let projected_symbol_value = existing_symbol_value + order_value;
            let projected_concentration_pct = if projected_exposure > 0.0 {
                projected_symbol_value / projected_exposure * 100.0
            } else {
                0.0
            };
            if projected_concentration_pct > self.max_symbol_concentration_pct {
                return Err(RiskViolation::ConcentrationExceeded {
                    projected_pct: projected_concentration_pct,
                    limit_pct: self.max_symbol_concentration_pct,
                });
            }
        }

        Ok(())
    }

    /// Record a closed trade result for consecutive-loss tracking.
    pub fn record_trade_result(&mut self, pnl: f64) {
        if pnl < 0.0 {
            self.consecutive_losses += 1;
            self.total_losses += 1;
            if self.consecutive_losses >= self.max_consecutive_losses {
                let reason = format!(
                    "Consecutive loss limit reached ({} losses in a row, limit={})",
                    self.consecutive_losses, self.max_consecutive_losses
                );
                self.activate_circuit_breaker(&reason);
            }
        } else {
            self.consecutive_losses = 0;
            if pnl > 0.0 {
                self.total_wins += 1;
            }
        }
    }

    /// Update current equity for drawdown monitoring. Peak is a monotonic
    /// high-water mark.
    pub fn update_equity(&mut self, equity: f64) {
        if equity <= 0.0 || !equity.is_finite() {
            return;
        }
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.current_drawdown_pct = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity * 100.0
        } else {
            0.0
        };
        if self.current_drawdown_pct >= self.max_drawdown_pct {
            let reason = format!(
                "Account drawdown kill switch triggered: {:.1}% drawdown from peak (limit={:.1}%)",
                self.current_drawdown_pct, self.max_drawdown_pct
            );
            self.activate_circuit_breaker(&reason);
        }
    }

    pub fn update_daily_pnl(&mut self, pnl: f64) {
        self.reset_daily_stats_if_needed(Local::now());
        self.daily_pnl += pnl;
        if self.daily_pnl < -self.daily_loss_limit {
            self.activate_circuit_breaker("Daily loss limit exceeded");
        }
    }

    pub fn activate_circuit_breaker(&mut self, reason: &str) {
        self.circuit_breaker_active = true;
        self.circuit_breaker_reason = reason.to_string();
        warn!(reason, "circuit breaker activated");
    }

    /// Deactivation also resets the consecutive-loss counter.
    pub fn deactivate_circuit_breaker(&mut self) {
        self.circuit_breaker_active = false;
        self.circuit_breaker_reason.clear();
        self.consecutive_losses = 0;
        warn!("circuit breaker deactivated");
    }

    pub fn is_circuit_breaker_active(&self) -> bool {
        self.circuit_breaker_active
    }

    pub fn metrics(&mut self) -> RiskMetrics {
        self.reset_daily_stats_if_needed(Local::now());
        RiskMetrics {
            daily_pnl: self.daily_pnl,
            daily_loss_limit: self.daily_loss_limit,
            daily_pnl_percent: if self.daily_loss_limit > 0.0 {
                self.daily_pnl / self.daily_loss_limit * 100.0
            } else {
                0.0
            },
            daily_loss_remaining: (self.daily_loss_limit + self.daily_pnl).max(0.0),
            circuit_breaker_active: self.circuit_breaker_active,
            circuit_breaker_reason: self.circuit_breaker_reason.clone(),
            max_position_size: self.max_position_size,
            max_portfolio_exposure: self.max_portfolio_exposure,
            max_symbol_concentration_pct: self.max_symbol_concentration_pct,
            max_open_positions: self.max_open_positions,
            consecutive_losses: self.consecutive_losses,
            max_consecutive_losses: self.max_consecutive_losses,
            total_wins: self.total_wins,
            total_losses: self.total_losses,
            peak_equity: self.peak_equity,
            current_equity: self.current_equity,
            current_drawdown_pct: (self.current_drawdown_pct * 100.0).round() / 100.0,
            max_drawdown_pct: self.max_drawdown_pct,
        }
    }

    fn reset_daily_stats_if_needed(&mut self, now: DateTime<Local>) {
        let today_start = day_start(now);
        if today_start > self.daily_reset_time {
            self.daily_pnl = 0.0;
            self.daily_reset_time = today_start;
        }
    }
}

fn day_start(now: DateTime<Local>) -> NaiveDateTime {
    now.date_naive().and_hms_opt(0, 0, 0).expect("midnight exists")
}

/// Symbol-keyed non-negative market values. Rows with blank or invalid
/// symbols are dropped; a zero market value with positive quantity falls
/// back to nothing here because the caller supplies marked values.
fn normalize_exposures(rows: &[PositionExposure]) -> BTreeMap<String, f64> {
    let mut normalized = BTreeMap::new();
    for row in rows {
        let symbol = match normalize_symbol(&row.symbol) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let value = if row.market_value.is_finite() {
            row.market_value.max(0.0)
        } else {
            0.0
        };
        *normalized.entry(symbol).or_insert(0.0) += value;
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(symbol: &str, market_value: f64) -> PositionExposure {
        PositionExposure {
            symbol: symbol.to_string(),
            quantity: 1.0,
            market_value,
        }
    }

    #[test]
    fn accepts_clean_order() {
        let mut rm = RiskManager::new(RiskConfig::default());
        assert!(rm.validate_order("AAPL", 10.0, 100.0, &[]).is_ok());
    }

    #[test]
    fn rejects_bad_symbols_and_numbers() {
        let mut rm = RiskManager::new(RiskConfig::default());
        assert_eq!(
            rm.validate_order("123", 1.0, 1.0, &[]),
            Err(RiskViolation::InvalidSymbol)
        );
        assert_eq!(
            rm.validate_order("AAPL", 0.0, 1.0, &[]),
            Err(RiskViolation::InvalidNumbers)
        );
        assert_eq!(
            rm.validate_order("AAPL", 1.0, f64::NAN, &[]),
            Err(RiskViolation::InvalidNumbers)
        );
    }

    #[test]
    fn rejects_oversized_order() {
        let mut rm = RiskManager::new(RiskConfig {
            max_position_size: 500.0,
            ..RiskConfig::default()
        });
        let err = rm.validate_order("AAPL", 10.0, 100.0, &[]).unwrap_err();
        assert!(matches!(err, RiskViolation::PositionSizeExceeded { .. }));
    }

    #[test]
    fn concentration_guard() {
        // Existing AAPL worth 1000 of 1000 total exposure; buying 2000 more
        // projects AAPL at 3000/3000 = 100% > 50%.
        let mut rm = RiskManager::new(RiskConfig {
            max_symbol_concentration_pct: 50.0,
            ..RiskConfig::default()
        });
        let positions = vec![exposure("AAPL", 1000.0)];
        let err = rm
            .validate_order("AAPL", 20.0, 100.0, &positions)
            .unwrap_err();
        match err {
            RiskViolation::ConcentrationExceeded { projected_pct, .. } => {
                assert!((projected_pct - 100.0).abs() < 1e-9);
            }
            other => panic!("expected concentration violation, got {other:?}"),
        }
        assert!(err.to_string().contains("Symbol concentration limit exceeded"));
    }

    #[test]
    fn concentration_skipped_with_no_exposure() {
        let mut rm = RiskManager::new(RiskConfig {
            max_symbol_concentration_pct: 10.0,
            ..RiskConfig::default()
        });
        // First position would always be 100% concentrated; allowed.
        assert!(rm.validate_order("AAPL", 10.0, 100.0, &[]).is_ok());
    }

    #[test]
    fn consecutive_losses_trip_breaker() {
        let mut rm = RiskManager::new(RiskConfig {
            max_consecutive_losses: 3,
            ..RiskConfig::default()
        });
        rm.record_trade_result(-10.0);
        rm.record_trade_result(-10.0);
        assert!(!rm.is_circuit_breaker_active());
        rm.record_trade_result(-10.0);
        assert!(rm.is_circuit_breaker_active());

        let err = rm.validate_order("AAPL", 1.0, 1.0, &[]).unwrap_err();
        assert_eq!(err, RiskViolation::CircuitBreakerActive);
        assert!(err.to_string().contains("Circuit breaker is active"));
    }

    #[test]
    fn win_resets_loss_streak() {
        let mut rm = RiskManager::new(RiskConfig {
            max_consecutive_losses: 3,
            ..RiskConfig::default()
        });
        rm.record_trade_result(-10.0);
        rm.record_trade_result(-10.0);
        rm.record_trade_result(5.0);
        rm.record_trade_result(-10.0);
        assert!(!rm.is_circuit_breaker_active());
        let m = rm.metrics();
        assert_eq!(m.consecutive_losses, 1);
        assert_eq!(m.total_losses, 3);
        assert_eq!(m.total_wins, 1);
    }

    #[test]
    fn drawdown_trips_breaker() {
        let mut rm = RiskManager::new(RiskConfig {
            max_drawdown_pct: 15.0,
            ..RiskConfig::default()
        });
        rm.update_equity(10_000.0);
        rm.update_equity(9_000.0);
        assert!(!rm.is_circuit_breaker_active());
        rm.update_equity(8_400.0);
        assert!(rm.is_circuit_breaker_active());
        assert!(rm.metrics().circuit_breaker_reason.contains("drawdown"));
    }

    #[test]
    fn daily_loss_trips_breaker() {
        let mut rm = RiskManager::new(RiskConfig {
            daily_loss_limit: 500.0,
            ..RiskConfig::default()
        });
        rm.update_daily_pnl(-400.0);
        assert!(!rm.is_circuit_breaker_active());
        rm.update_daily_pnl(-200.0);
        assert!(rm.is_circuit_breaker_active());
    }

    #[test]
    fn deactivate_resets_streak() {
        let mut rm = RiskManager::new(RiskConfig {
            max_consecutive_losses: 2,
            ..RiskConfig::default()
        });
        rm.record_trade_result(-1.0);
        rm.record_trade_result(-1.0);
        assert!(rm.is_circuit_breaker_active());
        rm.deactivate_circuit_breaker();
        assert!(!rm.is_circuit_breaker_active());
        assert_eq!(rm.metrics().consecutive_losses, 0);
        assert!(rm.validate_order("AAPL", 1.0, 1.0, &[]).is_ok());
    }

    #[test]
    fn exposure_limit() {
        let mut rm = RiskManager::new(RiskConfig {
            max_portfolio_exposure: 5_000.0,
            ..RiskConfig::default()
        });
        let positions = vec![exposure("MSFT", 4_500.0)];
        let err = rm
            .validate_order("AAPL", 10.0, 100.0, &positions)
            .unwrap_err();
        assert!(matches!(err, RiskViolation::ExposureLimitExceeded { .. }));
    }

    #[test]
    fn open_position_count_limit() {
        let mut rm = RiskManager::new(RiskConfig {
            max_open_positions: 2,
            max_symbol_concentration_pct: 100.0,
            ..RiskConfig::default()
        });
        let positions = vec![exposure("MSFT", 100.0), exposure("NVDA", 100.0)];
        let err = rm
            .validate_order("AAPL", 1.0, 10.0, &positions)
            .unwrap_err();
        assert!(matches!(err, RiskViolation::MaxOpenPositionsReached { .. }));
        // Adding to an existing symbol is not a new slot.
        assert!(rm.validate_order("MSFT", 1.0, 10.0, &positions).is_ok());
    }
}
