//! Strategy optimizer.
//!
//! Bounded parameter + symbol-universe search over the deterministic
//! backtester: Gaussian local mutation with occasional broad jumps,
//! objective scoring with trade-count gating, progressive symbol trimming
//! from the winning run's per-symbol results, and optional expanding-window
//! walk-forward validation. A cancellation predicate is checked between
//! candidates and between folds.

mod history;
mod tunables;

pub use history::run_row_from_report;
pub use tunables::{normalize_parameters, tunable_bounds, TunableBound, TUNABLES};

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::info;

use sbot_backtest::BacktestResult;

#[derive(Clone, Debug)]
pub enum OptimizerError {
    /// Cooperative abort requested by the caller.
    Cancelled,
    Invalid(String),
    Backtest(String),
}

impl fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerError::Cancelled => write!(f, "optimization canceled"),
            OptimizerError::Invalid(m) => write!(f, "invalid optimizer input: {m}"),
            OptimizerError::Backtest(m) => write!(f, "backtest failed: {m}"),
        }
    }
}

impl std::error::Error for OptimizerError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Balanced,
    Sharpe,
    Return,
}

impl Objective {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Some(Objective::Balanced),
            "sharpe" => Some(Objective::Sharpe),
            "return" => Some(Objective::Return),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Objective::Balanced => "balanced_risk_adjusted",
            Objective::Sharpe => "sharpe_priority",
            Objective::Return => "return_priority",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OptimizerOptions {
    pub iterations: usize,
    pub min_trades: u32,
    pub objective: Objective,
    pub strict_min_trades: bool,
    pub walk_forward_enabled: bool,
    pub walk_forward_folds: usize,
    pub random_seed: Option<u64>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            iterations: 12,
            min_trades: 8,
            objective: Objective::Balanced,
            strict_min_trades: false,
            walk_forward_enabled: true,
            walk_forward_folds: 3,
            random_seed: None,
        }
    }
}

/// Shared context for all candidate runs.
#[derive(Clone, Debug)]
pub struct OptimizationContext {
    pub strategy_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
}

/// The backtest seam: (start, end, symbols, parameters) -> result. The CLI
/// wires this to the deterministic backtester over pre-loaded series.
pub type BacktestFn<'a> =
    &'a dyn Fn(NaiveDate, NaiveDate, &[String], &BTreeMap<String, f64>) -> Result<BacktestResult, String>;

pub type CancelFn<'a> = &'a dyn Fn() -> bool;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub rank: usize,
    pub score: f64,
    pub meets_min_trades: bool,
    pub symbol_count: usize,
    pub sharpe_ratio: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalkForwardFold {
    pub fold_index: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
    pub score: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub meets_min_trades: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub enabled: bool,
    pub objective: String,
    pub strict_min_trades: bool,
    pub min_trades_target: u32,
    pub folds_requested: usize,
    pub folds_completed: usize,
    pub pass_rate_pct: f64,
    pub average_score: f64,
    pub average_return: f64,
    pub average_sharpe: f64,
    pub worst_fold_return: f64,
    pub folds: Vec<WalkForwardFold>,
    pub notes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub requested_iterations: usize,
    pub evaluated_iterations: usize,
    pub objective: String,
    pub recommended_parameters: BTreeMap<String, f64>,
    pub recommended_symbols: Vec<String>,
    pub top_candidates: Vec<CandidateSummary>,
    pub best_result: BacktestResult,
    pub score: f64,
    pub min_trades_target: u32,
    pub strict_min_trades: bool,
    pub best_candidate_meets_min_trades: bool,
    pub walk_forward: Option<WalkForwardReport>,
    pub notes: Vec<String>,
}

struct Outcome {
    score: f64,
    meets_min_trades: bool,
    parameters: BTreeMap<String, f64>,
    symbols: Vec<String>,
    result: BacktestResult,
}

/// Run the full optimization: parameter search, symbol trimming and
/// optional walk-forward validation.
pub fn optimize(
    context: &OptimizationContext,
    base_symbols: &[String],
    base_parameters: &BTreeMap<String, f64>,
    options: &OptimizerOptions,
    backtest: BacktestFn<'_>,
    should_cancel: CancelFn<'_>,
) -> Result<OptimizationReport, OptimizerError> {
    let symbols = normalize_symbols(base_symbols);
    if symbols.is_empty() {
        return Err(OptimizerError::Invalid(
            "Optimizer requires at least one candidate symbol".to_string(),
        ));
    }
    if options.iterations < 1 {
        return Err(OptimizerError::Invalid("iterations must be >= 1".to_string()));
    }

    let base_params = normalize_parameters(base_parameters);
    let mut rng = match options.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let candidates = build_parameter_candidates(&base_params, options.iterations, &mut rng);

    let mut outcomes: Vec<Outcome> = Vec::new();
    for params in &candidates {
        if should_cancel() {
            return Err(OptimizerError::Cancelled);
        }
        let result = backtest(context.start_date, context.end_date, &symbols, params)
            .map_err(OptimizerError::Backtest)?;
        let (score, meets_min_trades) = objective_score(
            &result,
            options.min_trades,
            options.objective,
            options.strict_min_trades,
        );
        outcomes.push(Outcome {
            score,
            meets_min_trades,
            parameters: params.clone(),
            symbols: symbols.clone(),
            result,
        });
    }

    outcomes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut best_index = 0usize;

    // Symbol trimming: rank symbols from the winning run's trades and
    // re-test progressively tighter universes with the winning parameters.
    let ranked_symbols = rank_symbols_by_result(&symbols, &outcomes[best_index].result);
    for count in candidate_symbol_counts(ranked_symbols.len()) {
        if count >= ranked_symbols.len() {
            continue;
        }
        if should_cancel() {
            return Err(OptimizerError::Cancelled);
        }
        let subset: Vec<String> = ranked_symbols[..count].to_vec();
        let result = backtest(
            context.start_date,
            context.end_date,
            &subset,
            &outcomes[best_index].parameters,
        )
        .map_err(OptimizerError::Backtest)?;
        let (score, meets) = objective_score(
            &result,
            options.min_trades,
            options.objective,
            options.strict_min_trades,
        );
        if score > outcomes[best_index].score {
            info!(count, score, "trimmed universe improved objective score");
            let parameters = outcomes[best_index].parameters.clone();
            outcomes.insert(
                0,
                Outcome {
                    score,
                    meets_min_trades: meets,
                    parameters,
                    symbols: subset,
                    result,
                },
            );
            best_index = 0;
        }
    }

    let walk_forward = if options.walk_forward_enabled {
        Some(walk_forward_report(
            context,
            &outcomes[best_index].symbols,
            &outcomes[best_index].parameters,
            options,
            backtest,
            should_cancel,
        )?)
    } else {
        None
    };

    let best = &outcomes[best_index];
    let any_meets = outcomes.iter().any(|o| o.meets_min_trades);
    let top_candidates: Vec<CandidateSummary> = outcomes
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, o)| CandidateSummary {
            rank: i + 1,
            score: round6(o.score),
            meets_min_trades: o.meets_min_trades,
            symbol_count: o.symbols.len(),
            sharpe_ratio: round6(o.result.sharpe_ratio),
            total_return: round6(o.result.total_return),
            max_drawdown: round6(o.result.max_drawdown),
            win_rate: round6(o.result.win_rate),
            total_trades: o.result.total_trades,
            parameters: o.parameters.clone(),
        })
        .collect();

    let notes = vec![
        format!(
            "Optimization objective: {} with drawdown/risk penalties.",
            options.objective.label()
        ),
        format!(
            "Minimum trades target: {} ({}).",
            options.min_trades,
            if options.strict_min_trades {
                "strict gate"
            } else {
                "soft penalty"
            }
        ),
        "Final symbol set may be trimmed from the candidate universe when trim variants improve objective score."
            .to_string(),
        if options.strict_min_trades && !any_meets {
            "No candidate met strict min-trades target; best available candidate was returned."
                .to_string()
        } else if best.meets_min_trades {
            "Selected candidate met trade-count target.".to_string()
        } else {
            "Selected candidate is below trade-count target (soft-penalty mode).".to_string()
        },
        "Apply recommended parameters/symbols to strategy config before running live or paper sessions."
            .to_string(),
    ];

    Ok(OptimizationReport {
        requested_iterations: options.iterations,
        evaluated_iterations: candidates.len(),
        objective: options.objective.label().to_string(),
        recommended_parameters: best.parameters.clone(),
        recommended_symbols: best.symbols.clone(),
        top_candidates,
        best_result: best.result.clone(),
        score: round6(best.score),
        min_trades_target: options.min_trades,
        strict_min_trades: options.strict_min_trades,
        best_candidate_meets_min_trades: best.meets_min_trades,
        walk_forward,
        notes,
    })
}

/// Candidate parameter sets: the base plus (iterations − 1) mutations.
fn build_parameter_candidates(
    base: &BTreeMap<String, f64>,
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<BTreeMap<String, f64>> {
    let mut candidates = vec![base.clone()];
    while candidates.len() < iterations {
        candidates.push(mutate_parameters(base, rng));
    }
    candidates
}

/// Biased local search: Gaussian steps (σ = 0.12·span) around the base with
/// a 20% chance of a broad uniform jump, then clamp, snap to step and repair
/// the TP/SL and trailing/SL relationships.
pub fn mutate_parameters(base: &BTreeMap<String, f64>, rng: &mut StdRng) -> BTreeMap<String, f64> {
    let mut candidate = base.clone();
    for bound in TUNABLES {
        let span = bound.max - bound.min;
        if span <= 0.0 {
            continue;
        }
        let base_value = candidate
            .get(bound.name)
            .copied()
            .unwrap_or((bound.min + bound.max) / 2.0);
        let raw = if rng.gen::<f64>() < 0.2 {
            rng.gen_range(bound.min..=bound.max)
        } else {
            let normal = Normal::new(0.0, span * 0.12).expect("positive sigma");
            base_value + normal.sample(rng)
        };
        let mut value = snap(raw.clamp(bound.min, bound.max), bound.step);
        if bound.integer {
            value = value.round();
        }
        candidate.insert(bound.name.to_string(), value.clamp(bound.min, bound.max));
    }

    // Keep a defensible relationship between the key risk parameters.
    let stop_loss = candidate
        .get("stop_loss_pct")
        .copied()
        .unwrap_or_else(|| base.get("stop_loss_pct").copied().unwrap_or(2.0));

    if let Some(tp_bound) = tunable_bounds("take_profit_pct") {
        let current = candidate
            .get("take_profit_pct")
            .copied()
            .unwrap_or_else(|| base.get("take_profit_pct").copied().unwrap_or(5.0));
        let repaired = snap(current.max(stop_loss * 1.8).min(tp_bound.max), tp_bound.step);
        candidate.insert("take_profit_pct".to_string(), repaired);
    }
    if let Some(trail_bound) = tunable_bounds("trailing_stop_pct") {
        let current = candidate
            .get("trailing_stop_pct")
            .copied()
            .unwrap_or_else(|| base.get("trailing_stop_pct").copied().unwrap_or(2.5));
        let repaired = snap(
            current.max(stop_loss * 0.9).min(trail_bound.max),
            trail_bound.step,
        );
        candidate.insert("trailing_stop_pct".to_string(), repaired);
    }

    normalize_parameters(&candidate)
}

/// Objective score plus the min-trades verdict. In strict mode candidates
/// below the trade gate collapse to a deeply negative score.
pub fn objective_score(
    result: &BacktestResult,
    min_trades: u32,
    objective: Objective,
    strict_min_trades: bool,
) -> (f64, bool) {
    let sharpe = result.sharpe_ratio;
    let total_return = result.total_return;
    let drawdown = result.max_drawdown.abs();
    let win_rate = result.win_rate;
    let trades = result.total_trades as i64;
    let meets_min_trades = trades >= min_trades as i64;

    let trade_penalty = (min_trades as i64 - trades).max(0) as f64 * 0.35;
    let blocked = &result.diagnostics.blocked_reasons;
    let blocker_penalty = blocked.get("risk_circuit_breaker").copied().unwrap_or(0) as f64 * 0.001
        + blocked.get("daily_risk_limit").copied().unwrap_or(0) as f64 * 0.0005;

    let base_score = match objective {
        Objective::Sharpe => sharpe * 110.0 + total_return * 1.1 + win_rate * 0.12 - drawdown,
        Objective::Return => total_return * 3.1 + sharpe * 30.0 + win_rate * 0.08 - drawdown * 0.7,
        Objective::Balanced => {
            sharpe * 80.0 + total_return * 1.8 + win_rate * 0.14 - drawdown * 0.9
        }
    };

    if strict_min_trades && !meets_min_trades {
        let shortfall = (min_trades as i64 - trades).max(1) as f64;
        return (-1_000_000.0 - shortfall * 1000.0 - drawdown, false);
    }
    (base_score - trade_penalty - blocker_penalty, meets_min_trades)
}

/// Progressively tighter universe sizes: 100/85/70/55/40 percent of the
/// ranked list, floored at 8 symbols. Universes of 8 or fewer are not
/// trimmed.
pub fn candidate_symbol_counts(total: usize) -> Vec<usize> {
    if total <= 8 {
        return vec![total];
    }
    let mut counts: Vec<usize> = [1.0, 0.85, 0.70, 0.55, 0.40]
        .iter()
        .map(|f| ((total as f64 * f) as usize).max(8))
        .collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts.dedup();
    counts
}

/// Rank symbols by (pnl, win rate, trade count) from a run's trades.
/// Symbols with no trades keep deterministic ordering at the back.
pub fn rank_symbols_by_result(symbols: &[String], result: &BacktestResult) -> Vec<String> {
    #[derive(Default)]
    struct Row {
        pnl: f64,
        trades: f64,
        wins: f64,
    }
    let mut stats: BTreeMap<String, Row> = BTreeMap::new();
    for trade in &result.trades {
        let symbol = trade.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let row = stats.entry(symbol).or_default();
        row.pnl += trade.pnl;
        row.trades += 1.0;
        if trade.pnl > 0.0 {
            row.wins += 1.0;
        }
    }

    let score = |symbol: &str| -> (f64, f64, f64) {
        match stats.get(symbol) {
            Some(row) => {
                let win_rate = if row.trades > 0.0 {
                    row.wins / row.trades * 100.0
                } else {
                    0.0
                };
                (row.pnl, win_rate, row.trades)
            }
            None => (-1e12, 0.0, 0.0),
        }
    };

    let mut ordered = symbols.to_vec();
    ordered.sort_by(|a, b| {
        let sa = score(a);
        let sb = score(b);
        sb.0.total_cmp(&sa.0)
            .then(sb.1.total_cmp(&sa.1))
            .then(sb.2.total_cmp(&sa.2))
            .then_with(|| a.cmp(b))
    });
    ordered
}

/// Expanding train windows with sequential fixed-size test windows; each
/// fold is scored with the same objective and gating as the main run.
fn walk_forward_report(
    context: &OptimizationContext,
    symbols: &[String],
    parameters: &BTreeMap<String, f64>,
    options: &OptimizerOptions,
    backtest: BacktestFn<'_>,
    should_cancel: CancelFn<'_>,
) -> Result<WalkForwardReport, OptimizerError> {
    let safe_folds = options.walk_forward_folds.max(2);
    let total_days = (context.end_date - context.start_date).num_days() + 1;
    let mut report = WalkForwardReport {
        enabled: true,
        objective: options.objective.label().to_string(),
        strict_min_trades: options.strict_min_trades,
        min_trades_target: options.min_trades,
        folds_requested: safe_folds,
        folds_completed: 0,
        pass_rate_pct: 0.0,
        average_score: 0.0,
        average_return: 0.0,
        average_sharpe: 0.0,
        worst_fold_return: 0.0,
        folds: Vec::new(),
        notes: Vec::new(),
    };

    if total_days < 120 {
        report.notes.push(
            "Walk-forward skipped: date range too short for meaningful out-of-sample folds (need at least ~120 days)."
                .to_string(),
        );
        return Ok(report);
    }

    let test_span_days = (total_days / (safe_folds as i64 + 1)).max(30);
    for idx in 1..=safe_folds {
        if should_cancel() {
            return Err(OptimizerError::Cancelled);
        }

        let train_start = context.start_date;
        let train_end = context.start_date + chrono::Duration::days(idx as i64 * test_span_days - 1);
        let test_start = train_end + chrono::Duration::days(1);
        let test_end = std::cmp::min(
            context.end_date,
            test_start + chrono::Duration::days(test_span_days - 1),
        );

        if train_end <= train_start || test_start > context.end_date {
            break;
        }
        if (test_end - test_start).num_days() + 1 < 20 {
            break;
        }

        let result = backtest(test_start, test_end, symbols, parameters)
            .map_err(OptimizerError::Backtest)?;
        let (score, meets) = objective_score(
            &result,
            options.min_trades,
            options.objective,
            options.strict_min_trades,
        );
        report.folds.push(WalkForwardFold {
            fold_index: idx,
            train_start,
            train_end,
            test_start,
            test_end,
            score: round6(score),
            total_return: round6(result.total_return),
            sharpe_ratio: round6(result.sharpe_ratio),
            max_drawdown: round6(result.max_drawdown),
            win_rate: round6(result.win_rate),
            total_trades: result.total_trades,
            meets_min_trades: meets,
        });
    }

    let completed = report.folds.len();
    report.folds_completed = completed;
    if completed == 0 {
        report.notes.push(
            "Walk-forward completed with zero folds. Increase date range or reduce fold count."
                .to_string(),
        );
        return Ok(report);
    }

    let pass_count = report.folds.iter().filter(|f| f.meets_min_trades).count();
    report.pass_rate_pct = round2(pass_count as f64 / completed as f64 * 100.0);
    report.average_score =
        round6(report.folds.iter().map(|f| f.score).sum::<f64>() / completed as f64);
    report.average_return =
        round6(report.folds.iter().map(|f| f.total_return).sum::<f64>() / completed as f64);
    report.average_sharpe =
        round6(report.folds.iter().map(|f| f.sharpe_ratio).sum::<f64>() / completed as f64);
    report.worst_fold_return = round6(
        report
            .folds
            .iter()
            .map(|f| f.total_return)
            .fold(f64::INFINITY, f64::min),
    );
    report.notes = vec![
        "Walk-forward uses expanding train windows with sequential out-of-sample test windows."
            .to_string(),
        "Folds are scored with the same objective and trade-count gating as the optimizer run."
            .to_string(),
    ];
    Ok(report)
}

fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut normalized = Vec::new();
    for raw in symbols {
        let symbol = raw.trim().to_ascii_uppercase();
        if symbol.is_empty() || normalized.contains(&symbol) {
            continue;
        }
        normalized.push(symbol);
    }
    normalized
}

fn snap(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    round6((value / step).round() * step)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
