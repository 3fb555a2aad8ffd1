//! The tunable parameter table: bounds, steps and integer flags.
//!
//! Kept intentionally focused; widening it rapidly increases runtime.

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug)]
pub struct TunableBound {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub integer: bool,
}

pub const TUNABLES: &[TunableBound] = &[
    TunableBound { name: "position_size", min: 100.0, max: 10_000.0, step: 100.0, integer: false },
    TunableBound { name: "risk_per_trade", min: 0.1, max: 5.0, step: 0.1, integer: false },
    TunableBound { name: "stop_loss_pct", min: 0.5, max: 10.0, step: 0.5, integer: false },
    TunableBound { name: "take_profit_pct", min: 1.0, max: 20.0, step: 0.5, integer: false },
    TunableBound { name: "trailing_stop_pct", min: 0.5, max: 15.0, step: 0.5, integer: false },
    TunableBound { name: "atr_stop_mult", min: 0.5, max: 5.0, step: 0.1, integer: false },
    TunableBound { name: "zscore_entry_threshold", min: -4.0, max: -0.2, step: 0.1, integer: false },
    TunableBound { name: "dip_buy_threshold_pct", min: 0.5, max: 10.0, step: 0.5, integer: false },
    TunableBound { name: "max_hold_days", min: 2.0, max: 30.0, step: 1.0, integer: true },
    TunableBound { name: "dca_tranches", min: 1.0, max: 5.0, step: 1.0, integer: true },
    TunableBound { name: "max_consecutive_losses", min: 2.0, max: 10.0, step: 1.0, integer: true },
    TunableBound { name: "max_drawdown_pct", min: 5.0, max: 50.0, step: 1.0, integer: true },
];

pub fn tunable_bounds(name: &str) -> Option<&'static TunableBound> {
    TUNABLES.iter().find(|b| b.name == name)
}

/// Clamp to bounds, snap to step, round integer parameters. Keys outside
/// the tunable table and non-finite values pass through untouched;
/// normalization is idempotent.
pub fn normalize_parameters(parameters: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut normalized = parameters.clone();
    for bound in TUNABLES {
        let Some(&raw) = normalized.get(bound.name) else {
            continue;
        };
        if !raw.is_finite() {
            continue;
        }
        let mut value = raw.clamp(bound.min, bound.max);
        if bound.step > 0.0 {
            value = ((value / bound.step).round() * bound.step * 1e6).round() / 1e6;
        }
        if bound.integer {
            value = value.round();
        }
        normalized.insert(bound.name.to_string(), value.clamp(bound.min, bound.max));
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_and_snaps() {
        let mut params = BTreeMap::new();
        params.insert("stop_loss_pct".to_string(), 11.7);
        params.insert("take_profit_pct".to_string(), 4.74);
        params.insert("max_hold_days".to_string(), 7.6);
        params.insert("custom_key".to_string(), 123.456);

        let normalized = normalize_parameters(&params);
        assert_eq!(normalized["stop_loss_pct"], 10.0);
        assert_eq!(normalized["take_profit_pct"], 4.5);
        assert_eq!(normalized["max_hold_days"], 8.0);
        assert_eq!(normalized["custom_key"], 123.456);
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut params = BTreeMap::new();
        for (i, bound) in TUNABLES.iter().enumerate() {
            // Deliberately off-grid values across each range.
            let raw = bound.min + (bound.max - bound.min) * (i as f64 * 0.137).fract() + 0.037;
            params.insert(bound.name.to_string(), raw);
        }
        let once = normalize_parameters(&params);
        let twice = normalize_parameters(&once);
        assert_eq!(once, twice);
    }
}
