//! Backtest parameter resolution.

use std::collections::BTreeMap;

/// Supported tunables and their defaults. Defaults keep TP:SL at 2.5:1 and
/// trailing_stop >= stop_loss, and include max_hold_days for timely exits.
pub const DEFAULT_PARAMETERS: &[(&str, f64)] = &[
    ("position_size", 1000.0),
    ("risk_per_trade", 1.0),
    ("stop_loss_pct", 2.0),
    ("take_profit_pct", 5.0),
    ("trailing_stop_pct", 2.5),
    ("atr_stop_mult", 2.0),
    ("zscore_entry_threshold", -1.2),
    ("dip_buy_threshold_pct", 1.5),
    ("max_hold_days", 10.0),
];

/// Merge overrides onto the defaults. Unknown keys and non-finite values
/// are ignored.
pub fn resolve_parameters(overrides: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut resolved: BTreeMap<String, f64> = DEFAULT_PARAMETERS
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    for (key, value) in overrides {
        if !resolved.contains_key(key) || !value.is_finite() {
            continue;
        }
        resolved.insert(key.clone(), *value);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_merge_onto_defaults() {
        let mut overrides = BTreeMap::new();
        overrides.insert("stop_loss_pct".to_string(), 3.0);
        overrides.insert("unknown_knob".to_string(), 42.0);
        overrides.insert("take_profit_pct".to_string(), f64::NAN);

        let resolved = resolve_parameters(&overrides);
        assert_eq!(resolved["stop_loss_pct"], 3.0);
        assert_eq!(resolved["take_profit_pct"], 5.0);
        assert!(!resolved.contains_key("unknown_knob"));
        assert_eq!(resolved.len(), DEFAULT_PARAMETERS.len());
    }
}
