//! PostgreSQL implementation of the [`Storage`] port.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use sbot_schemas::{
    AuditEventType, AuditLogRow, ConfigEntry, OptimizationRunRow, OptimizationSource,
    OptimizationStatus, OrderRow, OrderSide, OrderStatus, OrderType, PortfolioSnapshotRow,
    PositionRow, PositionSide, StrategyRow, TradeRow, TradeType,
};

use crate::{
    NewAuditLog, NewOrder, NewPortfolioSnapshot, NewPosition, NewStrategy, NewTrade, Storage,
};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn position_from_row(row: &PgRow) -> Result<PositionRow> {
    let side: String = row.try_get("side")?;
    Ok(PositionRow {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        side: PositionSide::parse(&side).ok_or_else(|| anyhow!("invalid position side: {side}"))?,
        quantity: row.try_get("quantity")?,
        avg_entry_price: row.try_get("avg_entry_price")?,
        cost_basis: row.try_get("cost_basis")?,
        realized_pnl: row.try_get("realized_pnl")?,
        is_open: row.try_get("is_open")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<OrderRow> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    Ok(OrderRow {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        symbol: row.try_get("symbol")?,
        side: OrderSide::parse(&side).ok_or_else(|| anyhow!("invalid order side: {side}"))?,
        order_type: OrderType::parse(&order_type)
            .ok_or_else(|| anyhow!("invalid order type: {order_type}"))?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid order status: {status}"))?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        filled_quantity: row.try_get("filled_quantity")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        strategy_id: row.try_get("strategy_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        filled_at: row.try_get("filled_at")?,
    })
}

fn trade_from_row(row: &PgRow) -> Result<TradeRow> {
    let side: String = row.try_get("side")?;
    let trade_type: String = row.try_get("trade_type")?;
    Ok(TradeRow {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        symbol: row.try_get("symbol")?,
        side: OrderSide::parse(&side).ok_or_else(|| anyhow!("invalid trade side: {side}"))?,
        trade_type: TradeType::parse(&trade_type)
            .ok_or_else(|| anyhow!("invalid trade type: {trade_type}"))?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        commission: row.try_get("commission")?,
        fees: row.try_get("fees")?,
        realized_pnl: row.try_get("realized_pnl")?,
        strategy_id: row.try_get("strategy_id")?,
        executed_at: row.try_get("executed_at")?,
    })
}

fn strategy_from_row(row: &PgRow) -> Result<StrategyRow> {
    Ok(StrategyRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        strategy_type: row.try_get("strategy_type")?,
        config: row.try_get("config")?,
        is_enabled: row.try_get("is_enabled")?,
        is_active: row.try_get("is_active")?,
        total_trades: row.try_get("total_trades")?,
        win_rate: row.try_get("win_rate")?,
        total_pnl: row.try_get("total_pnl")?,
        last_run_at: row.try_get("last_run_at")?,
    })
}

fn optimization_run_from_row(row: &PgRow) -> Result<OptimizationRunRow> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(OptimizationRunRow {
        run_id: row.try_get("run_id")?,
        strategy_id: row.try_get("strategy_id")?,
        strategy_name: row.try_get("strategy_name")?,
        source: OptimizationSource::parse(&source)
            .ok_or_else(|| anyhow!("invalid optimization source: {source}"))?,
        status: OptimizationStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid optimization status: {status}"))?,
        request_payload: row.try_get("request_payload")?,
        result_payload: row.try_get("result_payload")?,
        error: row.try_get("error")?,
        objective: row.try_get("objective")?,
        score: row.try_get("score")?,
        total_return: row.try_get("total_return")?,
        sharpe_ratio: row.try_get("sharpe_ratio")?,
        max_drawdown: row.try_get("max_drawdown")?,
        total_trades: row.try_get("total_trades")?,
        win_rate: row.try_get("win_rate")?,
        recommended_symbol_count: row.try_get("recommended_symbol_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_position(&self, new: NewPosition) -> Result<PositionRow> {
        let cost_basis = new.quantity.abs() * new.avg_entry_price;
        let row = sqlx::query(
            r#"
            insert into positions (symbol, side, quantity, avg_entry_price, cost_basis, is_open)
            values ($1, $2, $3, $4, $5, true)
            returning *
            "#,
        )
        .bind(&new.symbol)
        .bind(new.side.as_str())
        .bind(new.quantity)
        .bind(new.avg_entry_price)
        .bind(cost_basis)
        .fetch_one(&self.pool)
        .await
        .context("create_position failed")?;
        position_from_row(&row)
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<PositionRow>> {
        let row = sqlx::query("select * from positions where symbol = $1 and is_open limit 1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .context("get_open_position failed")?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionRow>> {
        let rows = sqlx::query("select * from positions where is_open order by symbol")
            .fetch_all(&self.pool)
            .await
            .context("get_open_positions failed")?;
        rows.iter().map(position_from_row).collect()
    }

    async fn update_position(&self, row: &PositionRow) -> Result<()> {
        sqlx::query(
            r#"
            update positions
            set quantity = $2,
                avg_entry_price = $3,
                cost_basis = $4,
                realized_pnl = $5,
                is_open = $6,
                closed_at = $7,
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.quantity)
        .bind(row.avg_entry_price)
        .bind(row.cost_basis)
        .bind(row.realized_pnl)
        .bind(row.is_open)
        .bind(row.closed_at)
        .execute(&self.pool)
        .await
        .context("update_position failed")?;
        Ok(())
    }

    async fn create_order(&self, new: NewOrder) -> Result<OrderRow> {
        let row = sqlx::query(
            r#"
            insert into orders (symbol, side, order_type, status, quantity, price, strategy_id)
            values ($1, $2, $3, 'pending', $4, $5, $6)
            returning *
            "#,
        )
        .bind(&new.symbol)
        .bind(new.side.as_str())
        .bind(new.order_type.as_str())
        .bind(new.quantity)
        .bind(new.price)
        .bind(new.strategy_id)
        .fetch_one(&self.pool)
        .await
        .context("create_order failed")?;
        order_from_row(&row)
    }

    async fn get_order(&self, id: i64) -> Result<Option<OrderRow>> {
        let row = sqlx::query("select * from orders where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_order failed")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn get_open_orders(&self, limit: i64) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query(
            r#"
            select * from orders
            where status in ('pending', 'open', 'partially_filled')
            order by created_at asc
            limit $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("get_open_orders failed")?;
        rows.iter().map(order_from_row).collect()
    }

    async fn update_order(&self, row: &OrderRow) -> Result<()> {
        sqlx::query(
            r#"
            update orders
            set external_id = $2,
                status = $3,
                filled_quantity = $4,
                avg_fill_price = $5,
                filled_at = $6,
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.external_id)
        .bind(row.status.as_str())
        .bind(row.filled_quantity)
        .bind(row.avg_fill_price)
        .bind(row.filled_at)
        .execute(&self.pool)
        .await
        .context("update_order failed")?;
        Ok(())
    }

    async fn record_trade(&self, new: NewTrade) -> Result<TradeRow> {
        let row = sqlx::query(
            r#"
            insert into trades (
              order_id, symbol, side, trade_type, quantity, price,
              commission, fees, realized_pnl, strategy_id, executed_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            returning *
            "#,
        )
        .bind(new.order_id)
        .bind(&new.symbol)
        .bind(new.side.as_str())
        .bind(new.trade_type.as_str())
        .bind(new.quantity)
        .bind(new.price)
        .bind(new.commission)
        .bind(new.fees)
        .bind(new.realized_pnl)
        .bind(new.strategy_id)
        .bind(new.executed_at)
        .fetch_one(&self.pool)
        .await
        .context("record_trade failed")?;
        trade_from_row(&row)
    }

    async fn trades_for_order(&self, order_id: i64) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query("select * from trades where order_id = $1 order by executed_at asc")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .context("trades_for_order failed")?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query("select * from trades order by executed_at desc limit $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("recent_trades failed")?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn create_strategy(&self, new: NewStrategy) -> Result<StrategyRow> {
        let row = sqlx::query(
            r#"
            insert into strategies (name, strategy_type, config, is_enabled, is_active)
            values ($1, $2, $3, $4, $5)
            returning *
            "#,
        )
        .bind(&new.name)
        .bind(&new.strategy_type)
        .bind(&new.config)
        .bind(new.is_enabled)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await
        .context("create_strategy failed")?;
        strategy_from_row(&row)
    }

    async fn get_strategy_by_name(&self, name: &str) -> Result<Option<StrategyRow>> {
        let row = sqlx::query("select * from strategies where name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("get_strategy_by_name failed")?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn get_active_strategies(&self) -> Result<Vec<StrategyRow>> {
        let rows = sqlx::query("select * from strategies where is_active and is_enabled")
            .fetch_all(&self.pool)
            .await
            .context("get_active_strategies failed")?;
        rows.iter().map(strategy_from_row).collect()
    }

    async fn update_strategy(&self, row: &StrategyRow) -> Result<()> {
        sqlx::query(
            r#"
            update strategies
            set strategy_type = $2,
                config = $3,
                is_enabled = $4,
                is_active = $5,
                total_trades = $6,
                win_rate = $7,
                total_pnl = $8,
                last_run_at = $9,
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.strategy_type)
        .bind(&row.config)
        .bind(row.is_enabled)
        .bind(row.is_active)
        .bind(row.total_trades)
        .bind(row.win_rate)
        .bind(row.total_pnl)
        .bind(row.last_run_at)
        .execute(&self.pool)
        .await
        .context("update_strategy failed")?;
        Ok(())
    }

    async fn upsert_config(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        description: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into config (key, value, value_type, description)
            values ($1, $2, $3, $4)
            on conflict (key) do update
            set value = excluded.value,
                value_type = excluded.value_type,
                description = coalesce(excluded.description, config.description),
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(description)
        .execute(&self.pool)
        .await
        .context("upsert_config failed")?;
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let row = sqlx::query(
            "select key, value, value_type, description, updated_at from config where key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("get_config failed")?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ConfigEntry {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                value_type: row.try_get("value_type")?,
                description: row.try_get("description")?,
                updated_at: row.try_get("updated_at")?,
            })),
        }
    }

    async fn create_audit_log(&self, new: NewAuditLog) -> Result<()> {
        sqlx::query(
            r#"
            insert into audit_logs (event_type, description, details, user_id, strategy_id, order_id)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(new.event_type.as_str())
        .bind(&new.description)
        .bind(&new.details)
        .bind(&new.user_id)
        .bind(new.strategy_id)
        .bind(new.order_id)
        .execute(&self.pool)
        .await
        .context("create_audit_log failed")?;
        Ok(())
    }

    async fn recent_audit_logs(
        &self,
        event_type: Option<AuditEventType>,
        limit: i64,
    ) -> Result<Vec<AuditLogRow>> {
        let rows = match event_type {
            Some(et) => {
                sqlx::query(
                    "select * from audit_logs where event_type = $1 order by timestamp desc limit $2",
                )
                .bind(et.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("select * from audit_logs order by timestamp desc limit $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("recent_audit_logs failed")?;

        rows.iter()
            .map(|row| {
                let et: String = row.try_get("event_type")?;
                Ok(AuditLogRow {
                    id: row.try_get("id")?,
                    event_type: AuditEventType::parse(&et)
                        .ok_or_else(|| anyhow!("invalid audit event type: {et}"))?,
                    description: row.try_get("description")?,
                    details: row.try_get("details")?,
                    user_id: row.try_get("user_id")?,
                    strategy_id: row.try_get("strategy_id")?,
                    order_id: row.try_get("order_id")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn record_portfolio_snapshot(&self, new: NewPortfolioSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            insert into portfolio_snapshots (
              timestamp, equity, cash, buying_power, market_value,
              unrealized_pnl, realized_pnl_total, open_positions
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(new.timestamp)
        .bind(new.equity)
        .bind(new.cash)
        .bind(new.buying_power)
        .bind(new.market_value)
        .bind(new.unrealized_pnl)
        .bind(new.realized_pnl_total)
        .bind(new.open_positions)
        .execute(&self.pool)
        .await
        .context("record_portfolio_snapshot failed")?;
        Ok(())
    }

    async fn recent_portfolio_snapshots(&self, limit: i64) -> Result<Vec<PortfolioSnapshotRow>> {
        let rows = sqlx::query(
            "select * from portfolio_snapshots order by timestamp desc limit $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_portfolio_snapshots failed")?;

        let mut out: Vec<PortfolioSnapshotRow> = rows
            .iter()
            .map(|row| {
                Ok(PortfolioSnapshotRow {
                    id: row.try_get("id")?,
                    timestamp: row.try_get("timestamp")?,
                    equity: row.try_get("equity")?,
                    cash: row.try_get("cash")?,
                    buying_power: row.try_get("buying_power")?,
                    market_value: row.try_get("market_value")?,
                    unrealized_pnl: row.try_get("unrealized_pnl")?,
                    realized_pnl_total: row.try_get("realized_pnl_total")?,
                    open_positions: row.try_get("open_positions")?,
                })
            })
            .collect::<Result<_>>()?;
        out.reverse();
        Ok(out)
    }

    async fn upsert_optimization_run(&self, row: &OptimizationRunRow) -> Result<()> {
        sqlx::query(
            r#"
            insert into optimization_runs (
              run_id, strategy_id, strategy_name, source, status,
              request_payload, result_payload, error, objective, score,
              total_return, sharpe_ratio, max_drawdown, total_trades, win_rate,
              recommended_symbol_count, created_at, started_at, completed_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
              $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            on conflict (run_id) do update
            set strategy_id = excluded.strategy_id,
                strategy_name = excluded.strategy_name,
                source = excluded.source,
                status = excluded.status,
                request_payload = excluded.request_payload,
                result_payload = excluded.result_payload,
                error = excluded.error,
                objective = excluded.objective,
                score = excluded.score,
                total_return = excluded.total_return,
                sharpe_ratio = excluded.sharpe_ratio,
                max_drawdown = excluded.max_drawdown,
                total_trades = excluded.total_trades,
                win_rate = excluded.win_rate,
                recommended_symbol_count = excluded.recommended_symbol_count,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = now()
            "#,
        )
        .bind(&row.run_id)
        .bind(row.strategy_id)
        .bind(&row.strategy_name)
        .bind(row.source.as_str())
        .bind(row.status.as_str())
        .bind(&row.request_payload)
        .bind(&row.result_payload)
        .bind(&row.error)
        .bind(&row.objective)
        .bind(row.score)
        .bind(row.total_return)
        .bind(row.sharpe_ratio)
        .bind(row.max_drawdown)
        .bind(row.total_trades)
        .bind(row.win_rate)
        .bind(row.recommended_symbol_count)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await
        .context("upsert_optimization_run failed")?;
        Ok(())
    }

    async fn get_optimization_run(&self, run_id: &str) -> Result<Option<OptimizationRunRow>> {
        let row = sqlx::query("select * from optimization_runs where run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_optimization_run failed")?;
        row.as_ref().map(optimization_run_from_row).transpose()
    }

    async fn list_recent_optimization_runs(
        &self,
        strategy_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<OptimizationRunRow>> {
        let limit = limit.clamp(1, 500);
        let rows = match strategy_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    select * from optimization_runs
                    where strategy_id = $1
                    order by created_at desc
                    limit $2
                    "#,
                )
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("select * from optimization_runs order by created_at desc limit $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("list_recent_optimization_runs failed")?;
        rows.iter().map(optimization_run_from_row).collect()
    }

    async fn prune_optimization_runs(&self, strategy_id: i64, keep: i64) -> Result<u64> {
        let keep = keep.clamp(1, 500);
        let result = sqlx::query(
            r#"
            delete from optimization_runs
            where run_id in (
              select run_id from optimization_runs
              where strategy_id = $1
              order by created_at desc
              offset $2
            )
            "#,
        )
        .bind(strategy_id)
        .bind(keep)
        .execute(&self.pool)
        .await
        .context("prune_optimization_runs failed")?;
        Ok(result.rows_affected())
    }

    async fn delete_optimization_run(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("delete from optimization_runs where run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("delete_optimization_run failed")?;
        Ok(result.rows_affected() > 0)
    }
}
