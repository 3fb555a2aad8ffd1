//! Order execution service.
//!
//! Orchestrates the order lifecycle: pre-trade validation, throttling,
//! broker submission, persistence, and fill processing (trade rows,
//! position math, audit and budget events).

mod risk_profiles;
mod throttle;

pub use risk_profiles::{position_size_for, profile_limits, validate_trade, RiskProfile};
pub use throttle::SubmitThrottle;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use sbot_broker::Broker;
use sbot_budget::WeeklyBudgetTracker;
use sbot_db::{NewAuditLog, NewOrder, NewPosition, NewTrade, Storage};
use sbot_risk::RiskManager;
use sbot_schemas::{
    map_broker_status, normalize_symbol, AuditEventType, OrderRow, OrderSide, OrderStatus,
    OrderType, PositionRow, PositionSide, TradeType,
};

// Process-wide execution gates. The kill switch blocks all submissions; the
// trading-enabled flag is the operator settings toggle.
static GLOBAL_KILL_SWITCH: AtomicBool = AtomicBool::new(false);
static GLOBAL_TRADING_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_global_kill_switch(active: bool) {
    GLOBAL_KILL_SWITCH.store(active, Ordering::SeqCst);
}

pub fn global_kill_switch() -> bool {
    GLOBAL_KILL_SWITCH.load(Ordering::SeqCst)
}

pub fn set_global_trading_enabled(enabled: bool) {
    GLOBAL_TRADING_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn global_trading_enabled() -> bool {
    GLOBAL_TRADING_ENABLED.load(Ordering::SeqCst)
}

#[derive(Clone, Debug)]
pub enum ExecutionError {
    /// Client misuse or a pre-trade gate failure; never retried.
    Validation(String),
    /// Transport or vendor-side failure; the order is marked REJECTED.
    Broker(String),
    /// Storage or invariant failure; fatal for the current call.
    Integrity(String),
}

impl ExecutionError {
    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Validation(m)
            | ExecutionError::Broker(m)
            | ExecutionError::Integrity(m) => m,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Validation(m) => write!(f, "validation error: {m}"),
            ExecutionError::Broker(m) => write!(f, "broker error: {m}"),
            ExecutionError::Integrity(m) => write!(f, "integrity error: {m}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    pub max_position_size: f64,
    pub risk_limit_daily: f64,
    pub enable_budget_tracking: bool,
    pub order_throttle_per_minute: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_position_size: 10_000.0,
            risk_limit_daily: 500.0,
            enable_budget_tracking: true,
            order_throttle_per_minute: 60,
        }
    }
}

pub struct OrderExecutionService {
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    config: ExecutionConfig,
    throttle: SubmitThrottle,
    budget: Option<Arc<Mutex<WeeklyBudgetTracker>>>,
    risk_manager: Option<Arc<Mutex<RiskManager>>>,
    risk_profile: Option<RiskProfile>,
}

impl OrderExecutionService {
    pub fn new(broker: Arc<dyn Broker>, storage: Arc<dyn Storage>, config: ExecutionConfig) -> Self {
        let throttle = SubmitThrottle::new(config.order_throttle_per_minute);
        Self {
            broker,
            storage,
            config,
            throttle,
            budget: None,
            risk_manager: None,
            risk_profile: None,
        }
    }

    pub fn with_budget_tracker(mut self, budget: Arc<Mutex<WeeklyBudgetTracker>>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_risk_manager(mut self, risk_manager: Arc<Mutex<RiskManager>>) -> Self {
        self.risk_manager = Some(risk_manager);
        self
    }

    pub fn with_risk_profile(mut self, profile: RiskProfile) -> Self {
        self.risk_profile = Some(profile);
        self
    }

    /// Pre-trade validation. Checks run in a fixed order; the first failure
    /// wins.
    pub async fn validate_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<(), ExecutionError> {
        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(ExecutionError::Validation(
                "Order quantity must be positive".to_string(),
            ));
        }
        if order_type.requires_price() && price.is_none() {
            return Err(ExecutionError::Validation(format!(
                "Price required for {} orders",
                order_type.as_str()
            )));
        }
        if let Some(p) = price {
            if p <= 0.0 || !p.is_finite() {
                return Err(ExecutionError::Validation(
                    "Price must be positive".to_string(),
                ));
            }
        }

        if global_kill_switch() {
            return Err(ExecutionError::Validation(
                "Trading is blocked: kill switch is active".to_string(),
            ));
        }
        if !global_trading_enabled() {
            return Err(ExecutionError::Validation(
                "Trading is disabled in Settings".to_string(),
            ));
        }

        if !self.broker.is_connected().await {
            return Err(ExecutionError::Broker("Broker is not connected".to_string()));
        }
        let symbol = normalize_symbol(symbol)
            .map_err(|e| ExecutionError::Validation(e.to_string()))?;
        let tradable = self
            .broker
            .is_symbol_tradable(&symbol)
            .await
            .map_err(|e| ExecutionError::Broker(e.message))?;
        if !tradable {
            return Err(ExecutionError::Validation(format!(
                "Symbol {symbol} is not tradable"
            )));
        }
        let market_open = self
            .broker
            .is_market_open()
            .await
            .map_err(|e| ExecutionError::Broker(e.message))?;
        if !market_open {
            return Err(ExecutionError::Validation("Market is closed".to_string()));
        }

        let account = self.broker.get_account_info().await.map_err(|e| {
            error!(error = %e, "failed to get account info");
            ExecutionError::Broker(format!("Failed to get account info: {}", e.message))
        })?;

        if side == OrderSide::Buy {
            let estimated_price = match order_type {
                OrderType::Market => match self.broker.get_market_data(&symbol).await {
                    Ok(quote) => quote.price,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "failed to get market data");
                        let fallback = price.unwrap_or(0.0);
                        if fallback <= 0.0 {
                            return Err(ExecutionError::Validation(
                                "Cannot validate market order without price data".to_string(),
                            ));
                        }
                        fallback
                    }
                },
                _ => match price {
                    Some(p) => p,
                    None => {
                        return Err(ExecutionError::Validation(format!(
                            "Price required for {} orders",
                            order_type.as_str()
                        )))
                    }
                },
            };

            let order_value = quantity * estimated_price;
            let equity = if account.equity > 0.0 {
                account.equity
            } else {
                account.portfolio_value
            };
            let buying_power = account.buying_power;

            // Buying power is surfaced as the primary insufficiency reason.
            if order_value > buying_power {
                return Err(ExecutionError::Validation(format!(
                    "Insufficient buying power: need ${order_value:.2}, have ${buying_power:.2}"
                )));
            }

            // Guardrails are clamped to the account equity scale.
            let mut effective_max_position = self.config.max_position_size;
            if equity > 0.0 {
                effective_max_position = effective_max_position.min((equity * 0.25).max(100.0));
            }
            let effective_max_position = effective_max_position.max(1.0);
            if order_value > effective_max_position {
                return Err(ExecutionError::Validation(format!(
                    "Order value ${order_value:.2} exceeds maximum position size \
                     ${effective_max_position:.2} (balance-adjusted)"
                )));
            }

            let mut effective_daily_risk = self.config.risk_limit_daily;
            if equity > 0.0 {
                effective_daily_risk = effective_daily_risk.min((equity * 0.05).max(50.0));
            }
            let effective_daily_risk = effective_daily_risk.max(1.0);
            debug!(
                symbol = %symbol,
                max_position = effective_max_position,
                daily_risk = effective_daily_risk,
                equity,
                buying_power,
                "dynamic limits"
            );

            if self.config.enable_budget_tracking {
                if let Some(budget) = &self.budget {
                    let check = budget.lock().unwrap().can_trade(order_value);
                    if let Err(reason) = check {
                        return Err(ExecutionError::Validation(format!(
                            "Budget check failed: {reason}"
                        )));
                    }
                }
            }

            if let Some(profile) = self.risk_profile {
                let current_positions = self
                    .storage
                    .get_open_positions()
                    .await
                    .map_err(|e| ExecutionError::Integrity(e.to_string()))?
                    .len();
                let (weekly_budget, weekly_loss) = match &self.budget {
                    Some(budget) => {
                        let status = budget.lock().unwrap().budget_status();
                        (status.weekly_budget, (-status.weekly_pnl).max(0.0))
                    }
                    None => (200.0, 0.0),
                };
                validate_trade(profile, order_value, weekly_budget, current_positions, weekly_loss)
                    .map_err(|msg| {
                        ExecutionError::Validation(format!("Risk profile check failed: {msg}"))
                    })?;
            }
        }

        Ok(())
    }

    /// Submit an order: throttle, validate, persist PENDING, send to the
    /// broker, record the acknowledgment and process any immediate fill.
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        strategy_id: Option<i64>,
    ) -> Result<OrderRow, ExecutionError> {
        if !self.throttle.try_acquire() {
            return Err(ExecutionError::Validation(format!(
                "Order throttle exceeded: max {} orders/minute",
                self.throttle.capacity()
            )));
        }

        self.validate_order(symbol, side, order_type, quantity, price)
            .await?;
        let symbol = normalize_symbol(symbol)
            .map_err(|e| ExecutionError::Validation(e.to_string()))?;

        let mut order = self
            .storage
            .create_order(NewOrder {
                symbol: symbol.clone(),
                side,
                order_type,
                quantity,
                price,
                strategy_id,
            })
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        let response = match self
            .broker
            .submit_order(&symbol, side, order_type, quantity, price)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                order.status = OrderStatus::Rejected;
                if let Err(persist_err) = self.storage.update_order(&order).await {
                    error!(order_id = order.id, error = %persist_err, "failed to persist rejection");
                }
                error!(order_id = order.id, error = %e, "failed to submit order");
                return Err(ExecutionError::Broker(format!(
                    "Failed to submit order to broker: {}",
                    e.message
                )));
            }
        };

        order.external_id = Some(response.id.clone());
        order.status = map_broker_status(&response.status);
        if response.filled_quantity > 0.0 {
            order.filled_quantity = response.filled_quantity;
            order.avg_fill_price = response.avg_fill_price;
        }
        if order.status == OrderStatus::Filled {
            order.filled_at = Some(Utc::now());
        }
        self.storage
            .update_order(&order)
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        info!(
            order_id = order.id,
            external_id = order.external_id.as_deref().unwrap_or(""),
            side = side.as_str(),
            quantity,
            symbol = %symbol,
            status = order.status.as_str(),
            "order submitted"
        );

        let filled_now = order.status == OrderStatus::Filled && order.filled_quantity > 0.0;

        // Immediate buy fills consume the weekly budget.
        if filled_now && side == OrderSide::Buy && self.config.enable_budget_tracking {
            if let (Some(budget), Some(fill_price)) = (&self.budget, order.avg_fill_price) {
                let trade_value = order.filled_quantity * fill_price;
                budget.lock().unwrap().record_trade(trade_value, true, None);
                info!(trade_value, "recorded trade in budget tracker");
            }
        }

        self.audit(NewAuditLog {
            event_type: AuditEventType::OrderCreated,
            description: format!("Order created: {} {} {}", side.as_str(), quantity, symbol),
            details: Some(json!({
                "order_id": order.id,
                "external_id": order.external_id,
                "symbol": symbol,
                "side": side.as_str(),
                "type": order_type.as_str(),
                "quantity": quantity,
                "price": price,
                "status": order.status.as_str(),
            })),
            user_id: None,
            strategy_id,
            order_id: Some(order.id),
        })
        .await;

        if filled_now {
            let filled_quantity = order.filled_quantity;
            let fill_price = order.avg_fill_price.unwrap_or_default();
            if let Err(e) = self.process_fill(&order, filled_quantity, fill_price).await {
                // The order row is already terminal; reconciliation converges
                // positions against the broker on the next pass.
                error!(order_id = order.id, error = %e, "fill processing failed");
            }
        }

        Ok(order)
    }

    /// Cancel a working order at the broker and mark the local row.
    pub async fn cancel_order(&self, order: &OrderRow) -> Result<OrderRow, ExecutionError> {
        if order.status.is_terminal() {
            return Err(ExecutionError::Validation(format!(
                "Order {} is already {}",
                order.id,
                order.status.as_str()
            )));
        }
        let Some(external_id) = order.external_id.clone() else {
            return Err(ExecutionError::Validation(format!(
                "Order {} has no external ID",
                order.id
            )));
        };

        let cancelled = self
            .broker
            .cancel_order(&external_id)
            .await
            .map_err(|e| ExecutionError::Broker(e.message))?;
        if !cancelled {
            return Err(ExecutionError::Broker(format!(
                "Broker refused to cancel order {external_id}"
            )));
        }

        let mut updated = order.clone();
        updated.status = OrderStatus::Cancelled;
        self.storage
            .update_order(&updated)
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        self.audit(NewAuditLog {
            event_type: AuditEventType::OrderCancelled,
            description: format!(
                "Order cancelled: {} {} {}",
                updated.side.as_str(),
                updated.quantity,
                updated.symbol
            ),
            details: Some(json!({
                "order_id": updated.id,
                "external_id": external_id,
                "symbol": updated.symbol,
            })),
            user_id: None,
            strategy_id: updated.strategy_id,
            order_id: Some(updated.id),
        })
        .await;

        info!(order_id = updated.id, "order cancelled");
        Ok(updated)
    }

    /// Refresh one order from the broker (reconciliation path). Fill
    /// processing runs before the status transition is persisted, so a
    /// processing failure leaves the order in the reconciliation set.
    pub async fn update_order_status(&self, order: &OrderRow) -> Result<OrderRow, ExecutionError> {
        let Some(external_id) = order.external_id.clone() else {
            warn!(order_id = order.id, "order has no external ID, cannot update status");
            return Ok(order.clone());
        };

        let broker_order = match self.broker.get_order(&external_id).await {
            Ok(b) => b,
            Err(e) => {
                error!(order_id = order.id, error = %e, "failed to fetch order from broker");
                return Ok(order.clone());
            }
        };

        let new_status = map_broker_status(&broker_order.status);
        let filled_quantity = broker_order.filled_quantity;
        let avg_fill_price = broker_order.avg_fill_price;

        if new_status == order.status && (filled_quantity - order.filled_quantity).abs() < 1e-12 {
            return Ok(order.clone());
        }

        let mut updated = order.clone();
        updated.status = new_status;
        updated.filled_quantity = filled_quantity;
        if avg_fill_price.is_some() {
            updated.avg_fill_price = avg_fill_price;
        }
        if new_status == OrderStatus::Filled && updated.filled_at.is_none() {
            updated.filled_at = Some(Utc::now());
        }

        let newly_filled = new_status == OrderStatus::Filled
            && order.status != OrderStatus::Filled
            && filled_quantity > 0.0;
        if newly_filled {
            let fill_price = updated.avg_fill_price.unwrap_or_default();
            if let Err(e) = self.process_fill(&updated, filled_quantity, fill_price).await {
                error!(order_id = order.id, error = %e, "fill processing failed, deferring status update");
                return Ok(order.clone());
            }
        }

        self.storage
            .update_order(&updated)
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        info!(
            order_id = updated.id,
            status = updated.status.as_str(),
            filled = filled_quantity,
            quantity = updated.quantity,
            "order updated"
        );
        Ok(updated)
    }

    /// Apply a fill: append the trade row, open or update the position,
    /// report closes to the risk manager and budget, audit.
    async fn process_fill(
        &self,
        order: &OrderRow,
        filled_quantity: f64,
        fill_price: f64,
    ) -> Result<(), ExecutionError> {
        let position = self
            .storage
            .get_open_position(&order.symbol)
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        let (trade_type, realized_pnl) = match &position {
            None => (TradeType::Open, None),
            Some(pos) => {
                let is_addition = matches!(
                    (pos.side, order.side),
                    (PositionSide::Long, OrderSide::Buy) | (PositionSide::Short, OrderSide::Sell)
                );
                if is_addition {
                    (TradeType::Adjustment, None)
                } else {
                    let reduce_qty = filled_quantity.min(pos.quantity);
                    let pnl = match pos.side {
                        PositionSide::Long => reduce_qty * (fill_price - pos.avg_entry_price),
                        PositionSide::Short => reduce_qty * (pos.avg_entry_price - fill_price),
                    };
                    let closes = pos.quantity - reduce_qty <= 1e-9;
                    (
                        if closes { TradeType::Close } else { TradeType::Adjustment },
                        Some(pnl),
                    )
                }
            }
        };

        let trade = self
            .storage
            .record_trade(NewTrade {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                trade_type,
                quantity: filled_quantity,
                price: fill_price,
                commission: 0.0,
                fees: 0.0,
                realized_pnl,
                strategy_id: order.strategy_id,
                executed_at: Utc::now(),
            })
            .await
            .map_err(|e| ExecutionError::Integrity(e.to_string()))?;

        info!(
            trade_id = trade.id,
            side = order.side.as_str(),
            quantity = filled_quantity,
            symbol = %order.symbol,
            price = fill_price,
            "trade recorded"
        );

        match position {
            None => {
                let side = match order.side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                };
                let created = self
                    .storage
                    .create_position(NewPosition {
                        symbol: order.symbol.clone(),
                        side,
                        quantity: filled_quantity,
                        avg_entry_price: fill_price,
                    })
                    .await
                    .map_err(|e| ExecutionError::Integrity(e.to_string()))?;
                info!(
                    side = side.as_str(),
                    quantity = filled_quantity,
                    symbol = %order.symbol,
                    price = fill_price,
                    "position opened"
                );
                self.audit(NewAuditLog {
                    event_type: AuditEventType::PositionOpened,
                    description: format!(
                        "Position opened: {} {} {}",
                        side.as_str(),
                        filled_quantity,
                        order.symbol
                    ),
                    details: Some(json!({
                        "position_id": created.id,
                        "symbol": order.symbol,
                        "side": side.as_str(),
                        "quantity": filled_quantity,
                        "avg_entry_price": fill_price,
                    })),
                    user_id: None,
                    strategy_id: order.strategy_id,
                    order_id: Some(order.id),
                })
                .await;
            }
            Some(mut pos) => {
                self.apply_position_delta(&mut pos, order, filled_quantity, fill_price, realized_pnl)
                    .await?;
            }
        }

        self.audit(NewAuditLog {
            event_type: AuditEventType::OrderFilled,
            description: format!(
                "Order filled: {} {} {}",
                order.side.as_str(),
                filled_quantity,
                order.symbol
            ),
            details: Some(json!({
                "order_id": order.id,
                "trade_id": trade.id,
                "symbol": order.symbol,
                "side": order.side.as_str(),
                "quantity": filled_quantity,
                "price": fill_price,
            })),
            user_id: None,
            strategy_id: order.strategy_id,
            order_id: Some(order.id),
        })
        .await;

        Ok(())
    }

    async fn apply_position_delta(
        &self,
        pos: &mut PositionRow,
        order: &OrderRow,
        filled_quantity: f64,
        fill_price: f64,
        realized_pnl: Option<f64>,
    ) -> Result<(), ExecutionError> {
        let is_addition = matches!(
            (pos.side, order.side),
            (PositionSide::Long, OrderSide::Buy) | (PositionSide::Short, OrderSide::Sell)
        );

        if is_addition {
            // Weighted-average entry on same-side additions.
            let new_quantity = pos.quantity + filled_quantity;
            let total_cost = pos.cost_basis + filled_quantity * fill_price;
            pos.avg_entry_price = total_cost / new_quantity;
            pos.quantity = new_quantity;
            pos.cost_basis = new_quantity * pos.avg_entry_price;
            self.storage
                .update_position(pos)
                .await
                .map_err(|e| ExecutionError::Integrity(e.to_string()))?;
            info!(
                side = pos.side.as_str(),
                quantity = pos.quantity,
                symbol = %pos.symbol,
                avg_entry = pos.avg_entry_price,
                "position updated"
            );
            return Ok(());
        }

        let reduce_qty = filled_quantity.min(pos.quantity);
        if filled_quantity > pos.quantity + 1e-9 {
            warn!(
                symbol = %pos.symbol,
                position_qty = pos.quantity,
                fill_qty = filled_quantity,
                "reducing fill exceeds open quantity; clamping at zero"
            );
        }
        let pnl = realized_pnl.unwrap_or(0.0);
        pos.quantity -= reduce_qty;
        pos.realized_pnl += pnl;

        if pos.quantity <= 1e-9 {
            pos.quantity = 0.0;
            pos.cost_basis = 0.0;
            pos.is_open = false;
            pos.closed_at = Some(Utc::now());
            self.storage
                .update_position(pos)
                .await
                .map_err(|e| ExecutionError::Integrity(e.to_string()))?;
            info!(symbol = %pos.symbol, pnl, "position closed");

            if let Some(risk_manager) = &self.risk_manager {
                risk_manager.lock().unwrap().record_trade_result(pnl);
            }
            if self.config.enable_budget_tracking {
                if let Some(budget) = &self.budget {
                    budget
                        .lock()
                        .unwrap()
                        .record_trade(reduce_qty * fill_price, false, Some(pnl));
                }
            }

            self.audit(NewAuditLog {
                event_type: AuditEventType::PositionClosed,
                description: format!("Position closed: {} (P&L ${pnl:.2})", pos.symbol),
                details: Some(json!({
                    "position_id": pos.id,
                    "symbol": pos.symbol,
                    "realized_pnl": pnl,
                })),
                user_id: None,
                strategy_id: order.strategy_id,
                order_id: Some(order.id),
            })
            .await;
        } else {
            pos.cost_basis = pos.quantity * pos.avg_entry_price;
            self.storage
                .update_position(pos)
                .await
                .map_err(|e| ExecutionError::Integrity(e.to_string()))?;
            info!(
                side = pos.side.as_str(),
                quantity = pos.quantity,
                symbol = %pos.symbol,
                pnl,
                "position reduced"
            );
        }
        Ok(())
    }

    async fn audit(&self, entry: NewAuditLog) {
        if let Err(e) = self.storage.create_audit_log(entry).await {
            error!(error = %e, "failed to write audit log");
        }
    }
}
