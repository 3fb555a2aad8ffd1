//! Optimizer behavior against a canned backtest function: mutation bounds,
//! scoring gates, symbol trimming, walk-forward windows and cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;

use sbot_backtest::{BacktestResult, BacktestTrade, Diagnostics, EquityPoint};
use sbot_optimizer::{
    candidate_symbol_counts, mutate_parameters, normalize_parameters, objective_score, optimize,
    rank_symbols_by_result, tunable_bounds, Objective, OptimizationContext, OptimizerError,
    OptimizerOptions, TUNABLES,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn context() -> OptimizationContext {
    OptimizationContext {
        strategy_id: "opt-test".to_string(),
        start_date: date(2025, 1, 1),
        end_date: date(2025, 8, 28), // 240 days inclusive
        initial_capital: 10_000.0,
    }
}

fn canned_result(
    start: NaiveDate,
    end: NaiveDate,
    symbols: &[String],
    sharpe: f64,
    total_return: f64,
    trades_per_symbol: usize,
) -> BacktestResult {
    let mut trades = Vec::new();
    let mut id = 1u64;
    for symbol in symbols {
        for _ in 0..trades_per_symbol {
            trades.push(BacktestTrade {
                id,
                symbol: symbol.clone(),
                entry_date: start,
                exit_date: end,
                entry_price: 100.0,
                exit_price: 101.0,
                quantity: 1.0,
                pnl: 1.0,
                return_pct: 1.0,
                reason: "take_profit_exit".to_string(),
                days_held: 2,
            });
            id += 1;
        }
    }
    let total_trades = trades.len();
    BacktestResult {
        strategy_id: "opt-test".to_string(),
        start_date: start,
        end_date: end,
        initial_capital: 10_000.0,
        final_capital: 10_000.0 * (1.0 + total_return / 100.0),
        total_return,
        total_trades,
        winning_trades: total_trades,
        losing_trades: 0,
        win_rate: if total_trades > 0 { 100.0 } else { 0.0 },
        max_drawdown: 2.0,
        sharpe_ratio: sharpe,
        volatility: 0.1,
        trades,
        equity_curve: vec![
            EquityPoint { date: start, equity: 10_000.0 },
            EquityPoint { date: end, equity: 10_000.0 * (1.0 + total_return / 100.0) },
        ],
        diagnostics: Diagnostics::default(),
    }
}

fn base_params() -> BTreeMap<String, f64> {
    let mut params = BTreeMap::new();
    params.insert("stop_loss_pct".to_string(), 2.0);
    params.insert("take_profit_pct".to_string(), 5.0);
    params.insert("trailing_stop_pct".to_string(), 2.5);
    params.insert("position_size".to_string(), 1000.0);
    params
}

fn symbols(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("SY{i}")).collect()
}

#[test]
fn mutations_stay_in_bounds_and_keep_risk_relationships() {
    let base = normalize_parameters(&base_params());
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..300 {
        let candidate = mutate_parameters(&base, &mut rng);
        for bound in TUNABLES {
            if let Some(value) = candidate.get(bound.name) {
                assert!(
                    *value >= bound.min - 1e-9 && *value <= bound.max + 1e-9,
                    "{} out of bounds: {value}",
                    bound.name
                );
                if bound.integer {
                    assert_eq!(value.fract(), 0.0, "{} not integer: {value}", bound.name);
                }
            }
        }
        let sl = candidate["stop_loss_pct"];
        let tp = candidate["take_profit_pct"];
        let trail = candidate["trailing_stop_pct"];
        let tp_max = tunable_bounds("take_profit_pct").unwrap().max;
        // Repairs hold unless capped at the upper bound (half a snap step of
        // tolerance).
        assert!(tp >= (sl * 1.8).min(tp_max) - 0.25, "tp {tp} vs sl {sl}");
        let trail_max = tunable_bounds("trailing_stop_pct").unwrap().max;
        assert!(trail >= (sl * 0.9).min(trail_max) - 0.25, "trail {trail} vs sl {sl}");
    }
}

#[test]
fn seeded_mutation_is_reproducible() {
    let base = normalize_parameters(&base_params());
    let mut rng_a = StdRng::seed_from_u64(42);
    let mut rng_b = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        assert_eq!(
            mutate_parameters(&base, &mut rng_a),
            mutate_parameters(&base, &mut rng_b)
        );
    }
}

#[test]
fn strict_gate_collapses_underfilled_candidates() {
    let ctx = context();
    let result = canned_result(ctx.start_date, ctx.end_date, &symbols(2), 1.0, 10.0, 1);
    // 2 symbols * 1 trade = 2 trades, below a gate of 10.
    let (score, meets) = objective_score(&result, 10, Objective::Balanced, true);
    assert!(!meets);
    assert!(score <= -1_000_000.0);

    let (soft_score, soft_meets) = objective_score(&result, 10, Objective::Balanced, false);
    assert!(!soft_meets);
    // Soft penalty: 8 missing trades * 0.35.
    let (full_score, _) = objective_score(&result, 2, Objective::Balanced, false);
    assert!((full_score - soft_score - 8.0 * 0.35).abs() < 1e-9);
}

#[test]
fn objective_weightings_differ() {
    let ctx = context();
    let result = canned_result(ctx.start_date, ctx.end_date, &symbols(2), 1.5, 12.0, 5);
    let (balanced, _) = objective_score(&result, 1, Objective::Balanced, false);
    let (sharpe, _) = objective_score(&result, 1, Objective::Sharpe, false);
    let (ret, _) = objective_score(&result, 1, Objective::Return, false);
    assert!(sharpe > balanced);
    assert!(balanced != ret);
}

#[test]
fn symbol_trim_counts_floor_at_eight() {
    assert_eq!(candidate_symbol_counts(6), vec![6]);
    assert_eq!(candidate_symbol_counts(8), vec![8]);
    let counts = candidate_symbol_counts(20);
    assert_eq!(counts, vec![20, 17, 14, 11, 8]);
}

#[test]
fn symbols_rank_by_pnl_then_win_rate() {
    let ctx = context();
    let syms = vec!["AAA".to_string(), "BBB".to_string(), "CCC".to_string()];
    let mut result = canned_result(ctx.start_date, ctx.end_date, &syms, 1.0, 5.0, 1);
    // AAA loses, BBB wins big, CCC never traded.
    result.trades.clear();
    result.trades.push(BacktestTrade {
        id: 1,
        symbol: "AAA".to_string(),
        entry_date: ctx.start_date,
        exit_date: ctx.end_date,
        entry_price: 100.0,
        exit_price: 95.0,
        quantity: 1.0,
        pnl: -5.0,
        return_pct: -5.0,
        reason: "stop_exit".to_string(),
        days_held: 2,
    });
    result.trades.push(BacktestTrade {
        id: 2,
        symbol: "BBB".to_string(),
        entry_date: ctx.start_date,
        exit_date: ctx.end_date,
        entry_price: 100.0,
        exit_price: 110.0,
        quantity: 1.0,
        pnl: 10.0,
        return_pct: 10.0,
        reason: "take_profit_exit".to_string(),
        days_held: 2,
    });
    let ranked = rank_symbols_by_result(&syms, &result);
    assert_eq!(ranked, vec!["BBB".to_string(), "AAA".to_string(), "CCC".to_string()]);
}

#[test]
fn trimming_adopts_better_subset() {
    let ctx = context();
    let universe = symbols(10);
    // Fewer symbols -> better sharpe, so the 8-symbol trim should win.
    let backtest = |start: NaiveDate,
                    end: NaiveDate,
                    syms: &[String],
                    _params: &BTreeMap<String, f64>|
     -> Result<BacktestResult, String> {
        let sharpe = 2.0 - syms.len() as f64 * 0.1;
        Ok(canned_result(start, end, syms, sharpe, 10.0, 2))
    };
    let options = OptimizerOptions {
        iterations: 2,
        min_trades: 1,
        walk_forward_enabled: false,
        random_seed: Some(11),
        ..OptimizerOptions::default()
    };
    let report = optimize(&ctx, &universe, &base_params(), &options, &backtest, &|| false)
        .expect("optimize succeeds");
    assert_eq!(report.recommended_symbols.len(), 8);
    assert_eq!(report.evaluated_iterations, 2);
    assert!(report.walk_forward.is_none());
    assert!(report.score > 0.0);
}

#[test]
fn walk_forward_builds_expanding_windows() {
    let ctx = context();
    let backtest = |start: NaiveDate,
                    end: NaiveDate,
                    syms: &[String],
                    _params: &BTreeMap<String, f64>|
     -> Result<BacktestResult, String> {
        Ok(canned_result(start, end, syms, 1.0, 5.0, 3))
    };
    let options = OptimizerOptions {
        iterations: 1,
        min_trades: 1,
        walk_forward_enabled: true,
        walk_forward_folds: 3,
        random_seed: Some(5),
        ..OptimizerOptions::default()
    };
    let report = optimize(&ctx, &symbols(4), &base_params(), &options, &backtest, &|| false)
        .expect("optimize succeeds");

    let wf = report.walk_forward.expect("walk-forward present");
    assert_eq!(wf.folds_completed, 3);
    // 240 days / (3 + 1) = 60-day test spans.
    let first = &wf.folds[0];
    assert_eq!(first.train_start, ctx.start_date);
    assert_eq!((first.test_end - first.test_start).num_days() + 1, 60);
    assert_eq!(first.test_start, first.train_end + chrono::Duration::days(1));
    // Train window expands fold over fold.
    assert!(wf.folds[1].train_end > wf.folds[0].train_end);
    assert_eq!(wf.pass_rate_pct, 100.0);
}

#[test]
fn short_range_skips_walk_forward() {
    let ctx = OptimizationContext {
        strategy_id: "short".to_string(),
        start_date: date(2025, 1, 1),
        end_date: date(2025, 2, 28),
        initial_capital: 10_000.0,
    };
    let backtest = |start: NaiveDate,
                    end: NaiveDate,
                    syms: &[String],
                    _params: &BTreeMap<String, f64>|
     -> Result<BacktestResult, String> {
        Ok(canned_result(start, end, syms, 1.0, 5.0, 3))
    };
    let options = OptimizerOptions {
        iterations: 1,
        min_trades: 1,
        random_seed: Some(5),
        ..OptimizerOptions::default()
    };
    let report = optimize(&ctx, &symbols(2), &base_params(), &options, &backtest, &|| false)
        .expect("optimize succeeds");
    let wf = report.walk_forward.expect("report present");
    assert_eq!(wf.folds_completed, 0);
    assert!(wf.notes[0].contains("too short"));
}

#[test]
fn cancellation_aborts_between_candidates() {
    let ctx = context();
    let calls = AtomicUsize::new(0);
    let backtest = |start: NaiveDate,
                    end: NaiveDate,
                    syms: &[String],
                    _params: &BTreeMap<String, f64>|
     -> Result<BacktestResult, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(canned_result(start, end, syms, 1.0, 5.0, 3))
    };
    // Cancel after the first candidate completes.
    let cancel = || calls.load(Ordering::SeqCst) >= 1;
    let options = OptimizerOptions {
        iterations: 5,
        min_trades: 1,
        random_seed: Some(5),
        ..OptimizerOptions::default()
    };
    let err = optimize(&ctx, &symbols(2), &base_params(), &options, &backtest, &cancel)
        .expect_err("must cancel");
    assert!(matches!(err, OptimizerError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn rejects_empty_symbols_and_zero_iterations() {
    let ctx = context();
    let backtest = |start: NaiveDate,
                    end: NaiveDate,
                    syms: &[String],
                    _params: &BTreeMap<String, f64>|
     -> Result<BacktestResult, String> {
        Ok(canned_result(start, end, syms, 1.0, 5.0, 3))
    };
    let options = OptimizerOptions {
        iterations: 0,
        ..OptimizerOptions::default()
    };
    assert!(matches!(
        optimize(&ctx, &symbols(2), &base_params(), &options, &backtest, &|| false),
        Err(OptimizerError::Invalid(_))
    ));
    let options = OptimizerOptions::default();
    assert!(matches!(
        optimize(&ctx, &[], &base_params(), &options, &backtest, &|| false),
        Err(OptimizerError::Invalid(_))
    ));
}
