//! Storage port and PostgreSQL implementation.
//!
//! [`Storage`] is the transactional persistence seam the execution service
//! and the runner depend on. The production implementation is
//! [`PgStorage`] (sqlx/Postgres, embedded migrations); tests use the
//! in-memory implementation from `sbot-testkit`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use sbot_schemas::{
    AuditEventType, AuditLogRow, ConfigEntry, OptimizationRunRow, OrderRow, OrderSide, OrderType,
    PortfolioSnapshotRow, PositionRow, PositionSide, StrategyRow, TradeRow, TradeType,
};

mod pg;

pub use pg::PgStorage;

pub const ENV_DB_URL: &str = "SBOT_DATABASE_URL";

/// Connect to Postgres using SBOT_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

// ---------------------------------------------------------------------------
// Insert payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct NewPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
}

#[derive(Clone, Debug)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub strategy_id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct NewTrade {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub trade_type: TradeType,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub fees: f64,
    pub realized_pnl: Option<f64>,
    pub strategy_id: Option<i64>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewStrategy {
    pub name: String,
    pub strategy_type: String,
    pub config: Value,
    pub is_enabled: bool,
    pub is_active: bool,
}

#[derive(Clone, Debug)]
pub struct NewAuditLog {
    pub event_type: AuditEventType,
    pub description: String,
    pub details: Option<Value>,
    pub user_id: Option<String>,
    pub strategy_id: Option<i64>,
    pub order_id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct NewPortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl_total: f64,
    pub open_positions: i64,
}

// ---------------------------------------------------------------------------
// Storage port
// ---------------------------------------------------------------------------

/// Repository surface over the durable aggregates. One trait object serves
/// all request-time callers; the runner owns its own handle for the loop
/// lifetime.
#[async_trait]
pub trait Storage: Send + Sync {
    // Positions. At most one open row per (symbol, side) is maintained by
    // the execution service; `get_open_position` returns the open row for a
    // symbol regardless of side.
    async fn create_position(&self, new: NewPosition) -> Result<PositionRow>;
    async fn get_open_position(&self, symbol: &str) -> Result<Option<PositionRow>>;
    async fn get_open_positions(&self) -> Result<Vec<PositionRow>>;
    async fn update_position(&self, row: &PositionRow) -> Result<()>;

    // Orders.
    async fn create_order(&self, new: NewOrder) -> Result<OrderRow>;
    async fn get_order(&self, id: i64) -> Result<Option<OrderRow>>;
    /// Non-terminal orders (pending/open/partially_filled), oldest first.
    async fn get_open_orders(&self, limit: i64) -> Result<Vec<OrderRow>>;
    async fn update_order(&self, row: &OrderRow) -> Result<()>;

    // Trades (append-only).
    async fn record_trade(&self, new: NewTrade) -> Result<TradeRow>;
    async fn trades_for_order(&self, order_id: i64) -> Result<Vec<TradeRow>>;
    async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>>;

    // Strategies.
    async fn create_strategy(&self, new: NewStrategy) -> Result<StrategyRow>;
    async fn get_strategy_by_name(&self, name: &str) -> Result<Option<StrategyRow>>;
    async fn get_active_strategies(&self) -> Result<Vec<StrategyRow>>;
    async fn update_strategy(&self, row: &StrategyRow) -> Result<()>;

    // Config key/value (upsert semantics).
    async fn upsert_config(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        description: Option<&str>,
    ) -> Result<()>;
    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>>;

    // Audit log (append-only).
    async fn create_audit_log(&self, new: NewAuditLog) -> Result<()>;
    async fn recent_audit_logs(
        &self,
        event_type: Option<AuditEventType>,
        limit: i64,
    ) -> Result<Vec<AuditLogRow>>;

    // Portfolio snapshots (append-only).
    async fn record_portfolio_snapshot(&self, new: NewPortfolioSnapshot) -> Result<()>;
    async fn recent_portfolio_snapshots(&self, limit: i64) -> Result<Vec<PortfolioSnapshotRow>>;

    // Optimization-run history.
    async fn upsert_optimization_run(&self, row: &OptimizationRunRow) -> Result<()>;
    async fn get_optimization_run(&self, run_id: &str) -> Result<Option<OptimizationRunRow>>;
    async fn list_recent_optimization_runs(
        &self,
        strategy_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<OptimizationRunRow>>;
    /// Keep the newest `keep` rows per strategy; returns deleted count.
    async fn prune_optimization_runs(&self, strategy_id: i64, keep: i64) -> Result<u64>;
    async fn delete_optimization_run(&self, run_id: &str) -> Result<bool>;
}
