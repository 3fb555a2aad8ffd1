//! Shared domain rows and enums for the trading engine.
//!
//! Every durable aggregate (positions, orders, trades, strategies, config
//! entries, audit logs, portfolio snapshots, optimization runs) is defined
//! here so that storage, execution and the runner agree on one schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod symbols;

pub use symbols::{normalize_symbol, SymbolError};

/// Config key for the runner sleep/resume continuity checkpoint.
pub const RUNNER_SLEEP_STATE_KEY: &str = "runner_sleep_state";
/// Config key for the runner runtime health/status checkpoint.
pub const RUNNER_RUNTIME_STATE_KEY: &str = "runner_runtime_state";
/// Config key for operator trading preferences (asset type + presets).
pub const TRADING_PREFERENCES_KEY: &str = "trading_preferences";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    /// Limit/stop/stop-limit orders all carry a price; market orders do not.
    pub fn requires_price(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal statuses never transition again; the complement is exactly
    /// the open-order reconciliation set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Map a broker-reported status string onto the local order status enum.
/// Unknown strings map to PENDING, expirations to CANCELLED.
pub fn map_broker_status(raw: &str) -> OrderStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pending" => OrderStatus::Pending,
        "submitted" | "accepted" | "new" | "open" => OrderStatus::Open,
        "filled" => OrderStatus::Filled,
        "partially_filled" | "partial_fill" => OrderStatus::PartiallyFilled,
        "cancelled" | "canceled" | "expired" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Open,
    Close,
    Adjustment,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Open => "open",
            TradeType::Close => "close",
            TradeType::Adjustment => "adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TradeType::Open),
            "close" => Some(TradeType::Close),
            "adjustment" => Some(TradeType::Adjustment),
            _ => None,
        }
    }
}

/// Closed set of audit event kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    OrderCreated,
    OrderFilled,
    OrderCancelled,
    StrategyStarted,
    StrategyStopped,
    PositionOpened,
    PositionClosed,
    ConfigUpdated,
    RunnerStarted,
    RunnerStopped,
    Error,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::OrderCreated => "order_created",
            AuditEventType::OrderFilled => "order_filled",
            AuditEventType::OrderCancelled => "order_cancelled",
            AuditEventType::StrategyStarted => "strategy_started",
            AuditEventType::StrategyStopped => "strategy_stopped",
            AuditEventType::PositionOpened => "position_opened",
            AuditEventType::PositionClosed => "position_closed",
            AuditEventType::ConfigUpdated => "config_updated",
            AuditEventType::RunnerStarted => "runner_started",
            AuditEventType::RunnerStopped => "runner_stopped",
            AuditEventType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order_created" => Some(AuditEventType::OrderCreated),
            "order_filled" => Some(AuditEventType::OrderFilled),
            "order_cancelled" => Some(AuditEventType::OrderCancelled),
            "strategy_started" => Some(AuditEventType::StrategyStarted),
            "strategy_stopped" => Some(AuditEventType::StrategyStopped),
            "position_opened" => Some(AuditEventType::PositionOpened),
            "position_closed" => Some(AuditEventType::PositionClosed),
            "config_updated" => Some(AuditEventType::ConfigUpdated),
            "runner_started" => Some(AuditEventType::RunnerStarted),
            "runner_stopped" => Some(AuditEventType::RunnerStopped),
            "error" => Some(AuditEventType::Error),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationSource {
    Sync,
    Async,
}

impl OptimizationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationSource::Sync => "sync",
            OptimizationSource::Async => "async",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(OptimizationSource::Sync),
            "async" => Some(OptimizationSource::Async),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OptimizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationStatus::Queued => "queued",
            OptimizationStatus::Running => "running",
            OptimizationStatus::Succeeded => "succeeded",
            OptimizationStatus::Failed => "failed",
            OptimizationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(OptimizationStatus::Queued),
            "running" => Some(OptimizationStatus::Running),
            "succeeded" => Some(OptimizationStatus::Succeeded),
            "failed" => Some(OptimizationStatus::Failed),
            "cancelled" => Some(OptimizationStatus::Cancelled),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One open or historical position. At most one open row per (symbol, side).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionRow {
    pub id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    /// Invariant outside the atomic update step: |quantity| * avg_entry_price.
    pub cost_basis: f64,
    pub realized_pnl: f64,
    pub is_open: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: i64,
    /// Broker order id; null until the broker acknowledges the submit.
    pub external_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: f64,
    pub price: Option<f64>,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub strategy_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Append-only execution record; one order may produce many trades.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: i64,
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

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: i64,
    pub name: String,
    pub strategy_type: String,
    pub config: Value,
    pub is_enabled: bool,
    pub is_active: bool,
    pub total_trades: i64,
    pub win_rate: Option<f64>,
    pub total_pnl: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Key/value config row with upsert semantics. Also carries runner
/// checkpoint blobs (value_type = "json").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogRow {
    pub id: i64,
    pub event_type: AuditEventType,
    pub description: String,
    pub details: Option<Value>,
    pub user_id: Option<String>,
    pub strategy_id: Option<i64>,
    pub order_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time account snapshot; one row per successful runner tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortfolioSnapshotRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl_total: f64,
    pub open_positions: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationRunRow {
    pub run_id: String,
    pub strategy_id: i64,
    pub strategy_name: String,
    pub source: OptimizationSource,
    pub status: OptimizationStatus,
    pub request_payload: Value,
    pub result_payload: Option<Value>,
    pub error: Option<String>,
    pub objective: Option<String>,
    pub score: Option<f64>,
    pub total_return: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub total_trades: Option<i64>,
    pub win_rate: Option<f64>,
    pub recommended_symbol_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_and_terminality() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn broker_status_mapping() {
        assert_eq!(map_broker_status("accepted"), OrderStatus::Open);
        assert_eq!(map_broker_status("NEW"), OrderStatus::Open);
        assert_eq!(map_broker_status("filled"), OrderStatus::Filled);
        assert_eq!(map_broker_status("partial_fill"), OrderStatus::PartiallyFilled);
        assert_eq!(map_broker_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(map_broker_status("expired"), OrderStatus::Cancelled);
        assert_eq!(map_broker_status("bogus"), OrderStatus::Pending);
    }

    #[test]
    fn audit_event_serde_uses_snake_case() {
        let json = serde_json::to_string(&AuditEventType::OrderFilled).unwrap();
        assert_eq!(json, "\"order_filled\"");
    }
}
