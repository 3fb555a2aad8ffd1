//! sbot entry point.
//!
//! Thin wiring binary: database maintenance, offline backtests and
//! optimizations over the synthetic/paper data path, and a paper trading
//! session driving the full runner stack against Postgres storage.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;

use sbot_backtest::{run_backtest, BacktestRequest, WARMUP_DAYS};
use sbot_broker_paper::PaperBroker;
use sbot_budget::WeeklyBudgetTracker;
use sbot_db::{PgStorage, Storage};
use sbot_execution::{ExecutionConfig, OrderExecutionService};
use sbot_optimizer::{
    optimize, run_row_from_report, Objective, OptimizationContext, OptimizerOptions,
};
use sbot_risk::{RiskConfig, RiskManager};
use sbot_runner::{RunnerConfig, StrategyRunner};
use sbot_schemas::OptimizationSource;
use sbot_screener::{ChartPoint, MarketScreener};
use sbot_strategy::{MetricsDrivenStrategy, StrategyConfig};

#[derive(Parser)]
#[command(name = "sbot")]
#[command(about = "StocksBot trading engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Run a deterministic backtest over synthetic/paper chart data
    Backtest {
        #[arg(long, default_value = "metrics_driven")]
        strategy_id: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 100_000.0)]
        capital: f64,
        /// Comma-separated symbols
        #[arg(long, default_value = "AAPL,MSFT")]
        symbols: String,
    },

    /// Optimize strategy parameters and the symbol universe
    Optimize {
        #[arg(long, default_value = "metrics_driven")]
        strategy_id: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 100_000.0)]
        capital: f64,
        #[arg(long, default_value = "AAPL,MSFT,NVDA,AMZN,GOOGL")]
        symbols: String,
        #[arg(long, default_value_t = 12)]
        iterations: usize,
        #[arg(long, default_value = "balanced")]
        objective: String,
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Start a paper trading session (requires SBOT_DATABASE_URL)
    Run {
        #[arg(long, default_value = "AAPL,MSFT")]
        symbols: String,
        #[arg(long, default_value_t = 60)]
        tick_secs: u64,
        #[arg(long, default_value_t = 200.0)]
        weekly_budget: f64,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = sbot_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let status = sbot_db::status(&pool).await?;
                    println!("db_ok={} has_orders_table={}", status.ok, status.has_orders_table);
                }
                DbCmd::Migrate => {
                    sbot_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Backtest {
            strategy_id,
            start,
            end,
            capital,
            symbols,
        } => {
            let symbols = parse_symbols(&symbols)?;
            let request = BacktestRequest {
                strategy_id,
                start_date: start,
                end_date: end,
                initial_capital: capital,
                symbols: symbols.clone(),
                parameters: BTreeMap::new(),
            };
            let series = load_series(&symbols, start, end).await;
            let result = run_backtest(&request, &series);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Optimize {
            strategy_id,
            start,
            end,
            capital,
            symbols,
            iterations,
            objective,
            seed,
        } => {
            let symbols = parse_symbols(&symbols)?;
            let objective = Objective::parse(&objective)
                .with_context(|| format!("unsupported objective '{objective}'"))?;
            let options = OptimizerOptions {
                iterations,
                objective,
                random_seed: seed,
                ..OptimizerOptions::default()
            };
            let context = OptimizationContext {
                strategy_id: strategy_id.clone(),
                start_date: start,
                end_date: end,
                initial_capital: capital,
            };

            let series = load_series(&symbols, start, end).await;
            let backtest_fn = |window_start: NaiveDate,
                               window_end: NaiveDate,
                               run_symbols: &[String],
                               parameters: &BTreeMap<String, f64>|
             -> std::result::Result<sbot_backtest::BacktestResult, String> {
                let request = BacktestRequest {
                    strategy_id: strategy_id.clone(),
                    start_date: window_start,
                    end_date: window_end,
                    initial_capital: capital,
                    symbols: run_symbols.to_vec(),
                    parameters: parameters.clone(),
                };
                Ok(run_backtest(&request, &series))
            };

            let started_at = chrono::Utc::now();
            let report = optimize(&context, &symbols, &BTreeMap::new(), &options, &backtest_fn, &|| false)?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            // Best-effort history row when a database is configured.
            if std::env::var(sbot_db::ENV_DB_URL).is_ok() {
                let pool = sbot_db::connect_from_env().await?;
                sbot_db::migrate(&pool).await?;
                let storage = PgStorage::new(pool);
                let row = run_row_from_report(
                    None,
                    0,
                    &context.strategy_id,
                    OptimizationSource::Sync,
                    &options,
                    &report,
                    started_at,
                );
                storage.upsert_optimization_run(&row).await?;
                info!(run_id = %row.run_id, "optimization run recorded");
            }
        }

        Commands::Run {
            symbols,
            tick_secs,
            weekly_budget,
        } => {
            let symbols = parse_symbols(&symbols)?;
            run_paper_session(symbols, tick_secs, weekly_budget).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn parse_symbols(raw: &str) -> Result<Vec<String>> {
    let mut symbols = Vec::new();
    for part in raw.split(',') {
        let symbol = sbot_schemas::normalize_symbol(part)?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    if symbols.is_empty() {
        bail!("at least one symbol is required");
    }
    Ok(symbols)
}

/// Load daily series (warmup included) from the screener's chart path.
async fn load_series(
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> BTreeMap<String, Vec<ChartPoint>> {
    let screener = MarketScreener::new(None);
    let today = chrono::Utc::now().date_naive();
    let span = (end.min(today) - start).num_days().max(0) + WARMUP_DAYS;
    let mut series = BTreeMap::new();
    for symbol in symbols {
        let points = screener.get_symbol_chart(symbol, span as usize + 30).await;
        series.insert(symbol.clone(), points);
    }
    series
}

async fn run_paper_session(symbols: Vec<String>, tick_secs: u64, weekly_budget: f64) -> Result<()> {
    let pool = sbot_db::connect_from_env().await?;
    sbot_db::migrate(&pool).await?;
    let storage: Arc<dyn Storage> = Arc::new(PgStorage::new(pool));

    // Seed operator preferences on first run; never clobber existing ones.
    if storage
        .get_config(sbot_schemas::TRADING_PREFERENCES_KEY)
        .await?
        .is_none()
    {
        let defaults = serde_json::json!({
            "asset_type": "stock",
            "stock_preset": "weekly_optimized",
            "etf_preset": "balanced",
        });
        storage
            .upsert_config(
                sbot_schemas::TRADING_PREFERENCES_KEY,
                &defaults.to_string(),
                "json",
                Some("Operator trading preferences"),
            )
            .await?;
    }

    let broker = Arc::new(PaperBroker::default());
    let screener = Arc::new(MarketScreener::new(Some(broker.clone())));
    let budget = Arc::new(Mutex::new(WeeklyBudgetTracker::new(weekly_budget)));
    let risk_manager = Arc::new(Mutex::new(RiskManager::new(RiskConfig::default())));

    let execution = Arc::new(
        OrderExecutionService::new(broker.clone(), storage.clone(), ExecutionConfig::default())
            .with_budget_tracker(budget)
            .with_risk_manager(risk_manager),
    );

    let runner = StrategyRunner::new(
        broker,
        storage,
        execution,
        RunnerConfig {
            tick_interval: Duration::from_secs(tick_secs.max(1)),
            streaming_enabled: false,
        },
    );

    let config = StrategyConfig {
        symbols,
        ..StrategyConfig::default()
    };
    runner
        .load_strategy(Box::new(MetricsDrivenStrategy::new(config, screener)))
        .await;

    if !runner.start().await {
        bail!("runner failed to start");
    }
    info!("paper session running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    runner.stop().await;
    info!("paper session stopped");
    Ok(())
}
