//! Optimization-run history rows.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use sbot_schemas::{OptimizationRunRow, OptimizationSource, OptimizationStatus};

use crate::{OptimizationReport, OptimizerOptions};

/// Build a persistable history row from a completed report. `started_at`
/// comes from the caller so queued/running upserts and the final row share
/// one timeline.
pub fn run_row_from_report(
    run_id: Option<Uuid>,
    strategy_id: i64,
    strategy_name: &str,
    source: OptimizationSource,
    options: &OptimizerOptions,
    report: &OptimizationReport,
    started_at: DateTime<Utc>,
) -> OptimizationRunRow {
    let run_id = run_id.unwrap_or_else(Uuid::new_v4);
    OptimizationRunRow {
        run_id: run_id.to_string(),
        strategy_id,
        strategy_name: strategy_name.to_string(),
        source,
        status: OptimizationStatus::Succeeded,
        request_payload: json!({
            "iterations": options.iterations,
            "min_trades": options.min_trades,
            "objective": options.objective.label(),
            "strict_min_trades": options.strict_min_trades,
            "walk_forward_enabled": options.walk_forward_enabled,
            "walk_forward_folds": options.walk_forward_folds,
            "random_seed": options.random_seed,
        }),
        result_payload: serde_json::to_value(report).ok(),
        error: None,
        objective: Some(report.objective.clone()),
        score: Some(report.score),
        total_return: Some(report.best_result.total_return),
        sharpe_ratio: Some(report.best_result.sharpe_ratio),
        max_drawdown: Some(report.best_result.max_drawdown),
        total_trades: Some(report.best_result.total_trades as i64),
        win_rate: Some(report.best_result.win_rate),
        recommended_symbol_count: report.recommended_symbols.len() as i64,
        created_at: started_at,
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
    }
}
