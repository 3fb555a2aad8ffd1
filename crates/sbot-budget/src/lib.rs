//! Weekly trading budget tracker.
//!
//! Counters roll over at local Monday 00:00: any observation after the
//! stored week boundary first clears used budget / trade count / weekly pnl,
//! then applies the new event. Counters live in memory only; the Monday
//! boundary bounds the damage of a restart.
//!
//! Every public operation has an `*_at` variant taking the observation time
//! so the boundary logic stays clock-injectable for tests; the plain
//! variants use the local wall clock.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime};
use serde::Serialize;
use tracing::info;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BudgetStatus {
    pub weekly_budget: f64,
    pub used_budget: f64,
    pub remaining_budget: f64,
    pub used_percent: f64,
    pub trades_this_week: u32,
    pub weekly_pnl: f64,
    pub week_start: NaiveDateTime,
    pub days_remaining: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WeekSummary {
    #[serde(flatten)]
    pub status: BudgetStatus,
    pub average_trade_size: f64,
    pub roi_percent: f64,
    pub budget_efficiency: f64,
}

#[derive(Clone, Debug)]
pub struct WeeklyBudgetTracker {
    weekly_budget: f64,
    current_week_start: NaiveDateTime,
    used_budget: f64,
    trades_this_week: u32,
    weekly_pnl: f64,
}

impl WeeklyBudgetTracker {
    pub fn new(weekly_budget: f64) -> Self {
        Self::new_at(weekly_budget, Local::now())
    }

    pub fn new_at(weekly_budget: f64, now: DateTime<Local>) -> Self {
        Self {
            weekly_budget,
            current_week_start: week_start(now),
            used_budget: 0.0,
            trades_this_week: 0,
            weekly_pnl: 0.0,
        }
    }

    pub fn weekly_budget(&self) -> f64 {
        self.weekly_budget
    }

    pub fn trades_this_week(&mut self) -> u32 {
        self.trades_this_week_at(Local::now())
    }

    pub fn trades_this_week_at(&mut self, now: DateTime<Local>) -> u32 {
        self.check_weekly_reset(now);
        self.trades_this_week
    }

    pub fn remaining_budget(&mut self) -> f64 {
        self.remaining_budget_at(Local::now())
    }

    pub fn remaining_budget_at(&mut self, now: DateTime<Local>) -> f64 {
        self.check_weekly_reset(now);
        (self.weekly_budget - self.used_budget).max(0.0)
    }

    /// Whether a buy of `amount` fits the remaining budget. Returns the
    /// rejection reason on failure.
    pub fn can_trade(&mut self, amount: f64) -> Result<(), String> {
        self.can_trade_at(amount, Local::now())
    }

    pub fn can_trade_at(&mut self, amount: f64, now: DateTime<Local>) -> Result<(), String> {
        self.check_weekly_reset(now);
        if amount <= 0.0 || !amount.is_finite() {
            return Err("Invalid trade amount".to_string());
        }
        let remaining = self.remaining_budget_at(now);
        if amount > remaining {
            return Err(format!("Insufficient budget: ${remaining:.2} remaining"));
        }
        Ok(())
    }

    /// Record a trade. Buys consume budget and bump the trade counter; a
    /// supplied realized pnl is added to the weekly pnl either way. Returns
    /// false when a buy exceeds the remaining budget (nothing recorded for
    /// the buy leg).
    pub fn record_trade(&mut self, amount: f64, is_buy: bool, realized_pnl: Option<f64>) -> bool {
        self.record_trade_at(amount, is_buy, realized_pnl, Local::now())
    }

    pub fn record_trade_at(
        &mut self,
        amount: f64,
        is_buy: bool,
        realized_pnl: Option<f64>,
        now: DateTime<Local>,
    ) -> bool {
        self.check_weekly_reset(now);

        if is_buy {
            if amount > self.remaining_budget_at(now) {
                return false;
            }
            self.used_budget += amount;
            self.trades_this_week += 1;
        }

        if let Some(pnl) = realized_pnl {
            self.weekly_pnl += pnl;
        }
        true
    }

    pub fn set_weekly_budget(&mut self, budget: f64) -> Result<(), String> {
        if budget < 0.0 || !budget.is_finite() {
            return Err("Budget must be non-negative".to_string());
        }
        self.weekly_budget = budget;
        Ok(())
    }

    pub fn budget_status(&mut self) -> BudgetStatus {
        self.budget_status_at(Local::now())
    }

    pub fn budget_status_at(&mut self, now: DateTime<Local>) -> BudgetStatus {
        self.check_weekly_reset(now);
        let remaining = (self.weekly_budget - self.used_budget).max(0.0);
        let used_percent = if self.weekly_budget > 0.0 {
            self.used_budget / self.weekly_budget * 100.0
        } else {
            0.0
        };
        BudgetStatus {
            weekly_budget: self.weekly_budget,
            used_budget: self.used_budget,
            remaining_budget: remaining,
            used_percent,
            trades_this_week: self.trades_this_week,
            weekly_pnl: self.weekly_pnl,
            week_start: self.current_week_start,
            days_remaining: 7 - now.weekday().num_days_from_monday() as i64,
        }
    }

    pub fn week_summary_at(&mut self, now: DateTime<Local>) -> WeekSummary {
        let status = self.budget_status_at(now);
        let average_trade_size = if status.trades_this_week > 0 {
            status.used_budget / status.trades_this_week as f64
        } else {
            0.0
        };
        let roi_percent = if status.used_budget > 0.0 {
            status.weekly_pnl / status.used_budget * 100.0
        } else {
            0.0
        };
        let budget_efficiency = if status.trades_this_week > 0 {
            status.used_percent
        } else {
            0.0
        };
        WeekSummary {
            status,
            average_trade_size,
            roi_percent,
            budget_efficiency,
        }
    }

    /// Manual reset (admin / tests).
    pub fn reset_week(&mut self) {
        self.reset_week_at(Local::now());
    }

    pub fn reset_week_at(&mut self, now: DateTime<Local>) {
        self.current_week_start = week_start(now);
        self.used_budget = 0.0;
        self.trades_this_week = 0;
        self.weekly_pnl = 0.0;
    }

    fn check_weekly_reset(&mut self, now: DateTime<Local>) {
        let current = week_start(now);
        if current > self.current_week_start {
            info!(week_start = %current, "weekly budget counters reset");
            self.current_week_start = current;
            self.used_budget = 0.0;
            self.trades_this_week = 0;
            self.weekly_pnl = 0.0;
        }
    }
}

/// Monday 00:00 of the week containing `now`, in local naive time.
fn week_start(now: DateTime<Local>) -> NaiveDateTime {
    let days_since_monday = now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() - Duration::days(days_since_monday);
    monday.and_hms_opt(0, 0, 0).expect("midnight exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn buy_consumes_budget_and_counts_trade() {
        // Wednesday.
        let now = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, now);

        assert!(tracker.record_trade_at(120.0, true, None, now));
        let status = tracker.budget_status_at(now);
        assert_eq!(status.used_budget, 120.0);
        assert_eq!(status.trades_this_week, 1);
        assert_eq!(status.remaining_budget, 80.0);
    }

    #[test]
    fn buy_over_remaining_is_rejected() {
        let now = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, now);
        assert!(tracker.record_trade_at(150.0, true, None, now));
        assert!(!tracker.record_trade_at(60.0, true, None, now));
        assert_eq!(tracker.budget_status_at(now).trades_this_week, 1);
    }

    #[test]
    fn counters_reset_on_next_monday() {
        // Wednesday 2026-03-04 -> Monday 2026-03-09 00:00.
        let wednesday = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, wednesday);
        assert!(tracker.record_trade_at(120.0, true, Some(-5.0), wednesday));

        let next_monday = local(2026, 3, 9, 0);
        assert_eq!(tracker.remaining_budget_at(next_monday), 200.0);
        let status = tracker.budget_status_at(next_monday);
        assert_eq!(status.trades_this_week, 0);
        assert_eq!(status.weekly_pnl, 0.0);
    }

    #[test]
    fn sells_track_pnl_without_consuming_budget() {
        let now = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, now);
        assert!(tracker.record_trade_at(100.0, false, Some(12.5), now));
        let status = tracker.budget_status_at(now);
        assert_eq!(status.used_budget, 0.0);
        assert_eq!(status.trades_this_week, 0);
        assert_eq!(status.weekly_pnl, 12.5);
    }

    #[test]
    fn can_trade_rules() {
        let now = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, now);
        assert!(tracker.can_trade_at(200.0, now).is_ok());
        assert!(tracker.can_trade_at(0.0, now).is_err());
        assert!(tracker.can_trade_at(-5.0, now).is_err());
        let err = tracker.can_trade_at(250.0, now).unwrap_err();
        assert!(err.contains("Insufficient budget"));
    }

    #[test]
    fn negative_budget_rejected() {
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, local(2026, 3, 4, 10));
        assert!(tracker.set_weekly_budget(-1.0).is_err());
        assert!(tracker.set_weekly_budget(0.0).is_ok());
    }

    #[test]
    fn week_summary_derives_roi_and_efficiency() {
        let now = local(2026, 3, 4, 10);
        let mut tracker = WeeklyBudgetTracker::new_at(200.0, now);
        tracker.record_trade_at(100.0, true, None, now);
        tracker.record_trade_at(50.0, true, Some(15.0), now);
        let summary = tracker.week_summary_at(now);
        assert_eq!(summary.average_trade_size, 75.0);
        assert_eq!(summary.roi_percent, 10.0);
        assert_eq!(summary.budget_efficiency, 75.0);
    }
}
