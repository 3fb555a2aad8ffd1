//! Risk tolerance profiles for small weekly-budget accounts.
//!
//! Profiles bound per-trade size, concurrent position count and the weekly
//! loss fraction. Take-profit to stop-loss ratios stay at or above 2.3:1.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Clone, Debug)]
pub struct ProfileLimits {
    pub name: &'static str,
    pub max_position_size: f64,
    pub max_positions: usize,
    /// Fraction of the weekly budget per trade.
    pub position_size_percent: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    /// Max fraction of the weekly budget that may be lost in one week.
    pub max_weekly_loss: f64,
    pub diversification_required: bool,
    pub max_hold_days: u32,
}

pub fn profile_limits(profile: RiskProfile) -> ProfileLimits {
    match profile {
        RiskProfile::Conservative => ProfileLimits {
            name: "Conservative",
            max_position_size: 100.0,
            max_positions: 3,
            position_size_percent: 0.25,
            stop_loss_percent: 0.02,
            take_profit_percent: 0.05,
            max_weekly_loss: 0.15,
            diversification_required: true,
            max_hold_days: 12,
        },
        RiskProfile::Balanced => ProfileLimits {
            name: "Balanced",
            max_position_size: 150.0,
            max_positions: 4,
            position_size_percent: 0.30,
            stop_loss_percent: 0.025,
            take_profit_percent: 0.06,
            max_weekly_loss: 0.25,
            diversification_required: true,
            max_hold_days: 10,
        },
        RiskProfile::Aggressive => ProfileLimits {
            name: "Aggressive",
            max_position_size: 200.0,
            max_positions: 5,
            position_size_percent: 0.40,
            stop_loss_percent: 0.035,
            take_profit_percent: 0.08,
            max_weekly_loss: 0.35,
            diversification_required: false,
            max_hold_days: 8,
        },
    }
}

/// Recommended position size for a profile: percent of the weekly budget,
/// capped by the profile max, shrunk when diversification requires room for
/// more positions. Floor $10.
pub fn position_size_for(profile: RiskProfile, weekly_budget: f64, current_positions: usize) -> f64 {
    let limits = profile_limits(profile);
    let mut size = (weekly_budget * limits.position_size_percent).min(limits.max_position_size);
    if current_positions > 0 && limits.diversification_required {
        size *= 1.0 - current_positions as f64 * 0.1;
    }
    size.max(10.0)
}

/// Validate a proposed trade against profile limits. Returns the rejection
/// reason on failure.
pub fn validate_trade(
    profile: RiskProfile,
    position_size: f64,
    weekly_budget: f64,
    current_positions: usize,
    weekly_loss: f64,
) -> Result<(), String> {
    let limits = profile_limits(profile);

    if position_size > limits.max_position_size {
        return Err(format!(
            "Position size ${position_size:.2} exceeds max ${:.2}",
            limits.max_position_size
        ));
    }
    if current_positions >= limits.max_positions {
        return Err(format!(
            "Already at max positions ({})",
            limits.max_positions
        ));
    }
    let max_loss_amount = weekly_budget * limits.max_weekly_loss;
    if weekly_loss > max_loss_amount {
        return Err(format!(
            "Weekly loss limit reached (${weekly_loss:.2} > ${max_loss_amount:.2})"
        ));
    }
    if position_size > weekly_budget {
        return Err(format!(
            "Position size ${position_size:.2} exceeds remaining budget ${weekly_budget:.2}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_limits_trade_size() {
        let err = validate_trade(RiskProfile::Conservative, 150.0, 200.0, 0, 0.0).unwrap_err();
        assert!(err.contains("exceeds max"));
        assert!(validate_trade(RiskProfile::Conservative, 90.0, 200.0, 0, 0.0).is_ok());
    }

    #[test]
    fn position_count_cap() {
        let err = validate_trade(RiskProfile::Balanced, 50.0, 200.0, 4, 0.0).unwrap_err();
        assert!(err.contains("max positions"));
    }

    #[test]
    fn weekly_loss_cap() {
        // 25% of a $200 budget is $50.
        let err = validate_trade(RiskProfile::Balanced, 50.0, 200.0, 0, 60.0).unwrap_err();
        assert!(err.contains("Weekly loss limit"));
    }

    #[test]
    fn recommended_size_shrinks_for_diversification() {
        let base = position_size_for(RiskProfile::Conservative, 200.0, 0);
        let shrunk = position_size_for(RiskProfile::Conservative, 200.0, 2);
        assert!((base - 50.0).abs() < 1e-9);
        assert!(shrunk < base);
        assert!(position_size_for(RiskProfile::Conservative, 1.0, 0) >= 10.0);
    }
}
