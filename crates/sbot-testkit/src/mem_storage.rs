//! In-memory [`Storage`] implementation.
//!
//! Mirrors the Postgres implementation's observable behavior closely enough
//! for scenario tests: ids are sequential, open-order queries return oldest
//! first, snapshots and audits are append-only.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use sbot_db::{
    NewAuditLog, NewOrder, NewPortfolioSnapshot, NewPosition, NewStrategy, NewTrade, Storage,
};
use sbot_schemas::{
    AuditEventType, AuditLogRow, ConfigEntry, OptimizationRunRow, OrderRow, OrderStatus,
    PortfolioSnapshotRow, PositionRow, StrategyRow, TradeRow,
};

#[derive(Default)]
struct MemState {
    next_id: i64,
    positions: Vec<PositionRow>,
    orders: Vec<OrderRow>,
    trades: Vec<TradeRow>,
    strategies: Vec<StrategyRow>,
    config: BTreeMap<String, ConfigEntry>,
    audit_logs: Vec<AuditLogRow>,
    snapshots: Vec<PortfolioSnapshotRow>,
    optimization_runs: BTreeMap<String, OptimizationRunRow>,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemStorage {
    state: Mutex<MemState>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All audit rows of one event type, oldest first (assertion helper).
    pub fn audit_logs_of_type(&self, event_type: AuditEventType) -> Vec<AuditLogRow> {
        self.state
            .lock()
            .unwrap()
            .audit_logs
            .iter()
            .filter(|row| row.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    pub fn trade_count(&self) -> usize {
        self.state.lock().unwrap().trades.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn create_position(&self, new: NewPosition) -> Result<PositionRow> {
        let mut st = self.state.lock().unwrap();
        let now = Utc::now();
        let row = PositionRow {
            id: st.next_id(),
            symbol: new.symbol,
            side: new.side,
            quantity: new.quantity,
            avg_entry_price: new.avg_entry_price,
            cost_basis: new.quantity.abs() * new.avg_entry_price,
            realized_pnl: 0.0,
            is_open: true,
            opened_at: now,
            closed_at: None,
            updated_at: now,
        };
        st.positions.push(row.clone());
        Ok(row)
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<PositionRow>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .positions
            .iter()
            .find(|p| p.symbol == symbol && p.is_open)
            .cloned())
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionRow>> {
        let st = self.state.lock().unwrap();
        let mut rows: Vec<PositionRow> =
            st.positions.iter().filter(|p| p.is_open).cloned().collect();
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(rows)
    }

    async fn update_position(&self, row: &PositionRow) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(existing) = st.positions.iter_mut().find(|p| p.id == row.id) {
            *existing = row.clone();
            existing.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_order(&self, new: NewOrder) -> Result<OrderRow> {
        let mut st = self.state.lock().unwrap();
        let now = Utc::now();
        let row = OrderRow {
            id: st.next_id(),
            external_id: None,
            symbol: new.symbol,
            side: new.side,
            order_type: new.order_type,
            status: OrderStatus::Pending,
            quantity: new.quantity,
            price: new.price,
            filled_quantity: 0.0,
            avg_fill_price: None,
            strategy_id: new.strategy_id,
            created_at: now,
            updated_at: now,
            filled_at: None,
        };
        st.orders.push(row.clone());
        Ok(row)
    }

    async fn get_order(&self, id: i64) -> Result<Option<OrderRow>> {
        let st = self.state.lock().unwrap();
        Ok(st.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn get_open_orders(&self, limit: i64) -> Result<Vec<OrderRow>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_order(&self, row: &OrderRow) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(existing) = st.orders.iter_mut().find(|o| o.id == row.id) {
            *existing = row.clone();
            existing.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_trade(&self, new: NewTrade) -> Result<TradeRow> {
        let mut st = self.state.lock().unwrap();
        let row = TradeRow {
            id: st.next_id(),
            order_id: new.order_id,
            symbol: new.symbol,
            side: new.side,
            trade_type: new.trade_type,
            quantity: new.quantity,
            price: new.price,
            commission: new.commission,
            fees: new.fees,
            realized_pnl: new.realized_pnl,
            strategy_id: new.strategy_id,
            executed_at: new.executed_at,
        };
        st.trades.push(row.clone());
        Ok(row)
    }

    async fn trades_for_order(&self, order_id: i64) -> Result<Vec<TradeRow>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .trades
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>> {
        let st = self.state.lock().unwrap();
        let mut rows = st.trades.clone();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn create_strategy(&self, new: NewStrategy) -> Result<StrategyRow> {
        let mut st = self.state.lock().unwrap();
        let row = StrategyRow {
            id: st.next_id(),
            name: new.name,
            strategy_type: new.strategy_type,
            config: new.config,
            is_enabled: new.is_enabled,
            is_active: new.is_active,
            total_trades: 0,
            win_rate: None,
            total_pnl: 0.0,
            last_run_at: None,
        };
        st.strategies.push(row.clone());
        Ok(row)
    }

    async fn get_strategy_by_name(&self, name: &str) -> Result<Option<StrategyRow>> {
        let st = self.state.lock().unwrap();
        Ok(st.strategies.iter().find(|s| s.name == name).cloned())
    }

    async fn get_active_strategies(&self) -> Result<Vec<StrategyRow>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .strategies
            .iter()
            .filter(|s| s.is_active && s.is_enabled)
            .cloned()
            .collect())
    }

    async fn update_strategy(&self, row: &StrategyRow) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(existing) = st.strategies.iter_mut().find(|s| s.id == row.id) {
            *existing = row.clone();
        }
        Ok(())
    }

    async fn upsert_config(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.config.insert(
            key.to_string(),
            ConfigEntry {
                key: key.to_string(),
                value: value.to_string(),
                value_type: value_type.to_string(),
                description: description.map(|s| s.to_string()),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let st = self.state.lock().unwrap();
        Ok(st.config.get(key).cloned())
    }

    async fn create_audit_log(&self, new: NewAuditLog) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id();
        st.audit_logs.push(AuditLogRow {
            id,
            event_type: new.event_type,
            description: new.description,
            details: new.details,
            user_id: new.user_id,
            strategy_id: new.strategy_id,
            order_id: new.order_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn recent_audit_logs(
        &self,
        event_type: Option<AuditEventType>,
        limit: i64,
    ) -> Result<Vec<AuditLogRow>> {
        let st = self.state.lock().unwrap();
        let mut rows: Vec<AuditLogRow> = st
            .audit_logs
            .iter()
            .filter(|row| event_type.map_or(true, |et| row.event_type == et))
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn record_portfolio_snapshot(&self, new: NewPortfolioSnapshot) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id();
        st.snapshots.push(PortfolioSnapshotRow {
            id,
            timestamp: new.timestamp,
            equity: new.equity,
            cash: new.cash,
            buying_power: new.buying_power,
            market_value: new.market_value,
            unrealized_pnl: new.unrealized_pnl,
            realized_pnl_total: new.realized_pnl_total,
            open_positions: new.open_positions,
        });
        Ok(())
    }

    async fn recent_portfolio_snapshots(&self, limit: i64) -> Result<Vec<PortfolioSnapshotRow>> {
        let st = self.state.lock().unwrap();
        let mut rows = st.snapshots.clone();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = rows.len().saturating_sub(limit.max(0) as usize);
        Ok(rows.split_off(skip))
    }

    async fn upsert_optimization_run(&self, row: &OptimizationRunRow) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.optimization_runs.insert(row.run_id.clone(), row.clone());
        Ok(())
    }

    async fn get_optimization_run(&self, run_id: &str) -> Result<Option<OptimizationRunRow>> {
        let st = self.state.lock().unwrap();
        Ok(st.optimization_runs.get(run_id).cloned())
    }

    async fn list_recent_optimization_runs(
        &self,
        strategy_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<OptimizationRunRow>> {
        let st = self.state.lock().unwrap();
        let mut rows: Vec<OptimizationRunRow> = st
            .optimization_runs
            .values()
            .filter(|r| strategy_id.map_or(true, |id| r.strategy_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.clamp(1, 500) as usize);
        Ok(rows)
    }

    async fn prune_optimization_runs(&self, strategy_id: i64, keep: i64) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        let mut rows: Vec<(String, chrono::DateTime<Utc>)> = st
            .optimization_runs
            .values()
            .filter(|r| r.strategy_id == strategy_id)
            .map(|r| (r.run_id.clone(), r.created_at))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        let mut deleted = 0;
        for (run_id, _) in rows.into_iter().skip(keep.clamp(1, 500) as usize) {
            st.optimization_runs.remove(&run_id);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn delete_optimization_run(&self, run_id: &str) -> Result<bool> {
        let mut st = self.state.lock().unwrap();
        Ok(st.optimization_runs.remove(run_id).is_some())
    }
}
