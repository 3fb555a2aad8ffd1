//! Strategy runner: the scheduled control plane.
//!
//! One background tokio task per process drives loaded strategies on a tick
//! interval: quote fetch, strategy dispatch, signal execution, open-order
//! reconciliation every tick, position reconciliation every five minutes,
//! portfolio snapshots and runtime checkpoints. Off hours the loop sleeps
//! and resumes when the broker reports the session open again. Tick sleeps
//! run in half-second slices and wake early on the broker stream event or a
//! stop request.

mod checkpoint;
mod manager;

pub use checkpoint::{RuntimeState, SleepState};
pub use manager::RunnerManager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sbot_broker::{Broker, Quote, TradeUpdateCallback};
use sbot_db::{NewAuditLog, NewPortfolioSnapshot, Storage};
use sbot_execution::OrderExecutionService;
use sbot_schemas::{AuditEventType, RUNNER_RUNTIME_STATE_KEY, RUNNER_SLEEP_STATE_KEY};
use sbot_strategy::{Signal, SignalRequest, Strategy};

const SLEEP_SLICE: Duration = Duration::from_millis(500);
const ERROR_AUDIT_THROTTLE_SECS: i64 = 30;
const POSITION_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
const OPEN_ORDER_RECONCILE_LIMIT: i64 = 500;
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Stopped,
    Running,
    Sleeping,
    Error,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Stopped => "stopped",
            RunnerStatus::Running => "running",
            RunnerStatus::Sleeping => "sleeping",
            RunnerStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub tick_interval: Duration,
    pub streaming_enabled: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            streaming_enabled: false,
        }
    }
}

#[derive(Clone, Debug)]
struct RunnerState {
    status: RunnerStatus,
    poll_success_count: u64,
    poll_error_count: u64,
    last_poll_error: String,
    last_poll_at: Option<DateTime<Utc>>,
    last_successful_poll_at: Option<DateTime<Utc>>,
    last_error_audit_at: Option<DateTime<Utc>>,
    last_reconciliation_at: Option<DateTime<Utc>>,
    last_reconciliation_discrepancies: u64,
    last_position_reconcile: Option<Instant>,
    sleeping: bool,
    sleep_since: Option<DateTime<Utc>>,
    next_market_open_at: Option<DateTime<Utc>>,
    last_resume_at: Option<DateTime<Utc>>,
    last_catchup_at: Option<DateTime<Utc>>,
    resume_count: u64,
    market_session_open: Option<bool>,
    last_state_persisted_at: Option<DateTime<Utc>>,
}

impl Default for RunnerState {
    fn default() -> Self {
        Self {
            status: RunnerStatus::Stopped,
            poll_success_count: 0,
            poll_error_count: 0,
            last_poll_error: String::new(),
            last_poll_at: None,
            last_successful_poll_at: None,
            last_error_audit_at: None,
            last_reconciliation_at: None,
            last_reconciliation_discrepancies: 0,
            last_position_reconcile: None,
            sleeping: false,
            sleep_since: None,
            next_market_open_at: None,
            last_resume_at: None,
            last_catchup_at: None,
            resume_count: 0,
            market_session_open: None,
            last_state_persisted_at: None,
        }
    }
}

/// Operator-facing status snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct RunnerStatusReport {
    pub status: &'static str,
    pub strategies: Vec<String>,
    pub tick_interval_secs: f64,
    pub broker_connected: bool,
    pub runner_thread_alive: bool,
    pub poll_success_count: u64,
    pub poll_error_count: u64,
    pub last_poll_error: String,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    pub last_reconciliation_at: Option<DateTime<Utc>>,
    pub last_reconciliation_discrepancies: u64,
    pub sleeping: bool,
    pub sleep_since: Option<DateTime<Utc>>,
    pub next_market_open_at: Option<DateTime<Utc>>,
    pub last_resume_at: Option<DateTime<Utc>>,
    pub last_catchup_at: Option<DateTime<Utc>>,
    pub resume_count: u64,
    pub market_session_open: Option<bool>,
    pub last_state_persisted_at: Option<DateTime<Utc>>,
}

struct RunnerInner {
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    execution: Arc<OrderExecutionService>,
    tick_interval: StdMutex<Duration>,
    streaming_enabled: AtomicBool,
    strategies: Mutex<HashMap<String, Box<dyn Strategy>>>,
    state: StdMutex<RunnerState>,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    stream_wake: Arc<Notify>,
}

pub struct StrategyRunner {
    inner: Arc<RunnerInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StrategyRunner {
    pub fn new(
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        execution: Arc<OrderExecutionService>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                broker,
                storage,
                execution,
                tick_interval: StdMutex::new(config.tick_interval),
                streaming_enabled: AtomicBool::new(config.streaming_enabled),
                strategies: Mutex::new(HashMap::new()),
                state: StdMutex::new(RunnerState::default()),
                stop_flag: AtomicBool::new(false),
                stop_notify: Notify::new(),
                stream_wake: Arc::new(Notify::new()),
            }),
            loop_handle: Mutex::new(None),
        }
    }

    pub async fn load_strategy(&self, strategy: Box<dyn Strategy>) -> bool {
        let name = strategy.name().to_string();
        self.inner.strategies.lock().await.insert(name.clone(), strategy);
        info!(strategy = %name, "loaded strategy");
        true
    }

    pub async fn remove_strategy_by_name(&self, name: &str) -> bool {
        let removed = self.inner.strategies.lock().await.remove(name).is_some();
        if removed {
            info!(strategy = %name, "removed strategy");
        }
        removed
    }

    pub fn set_tick_interval(&self, interval: Duration) {
        *self.inner.tick_interval.lock().unwrap() = interval.max(Duration::from_secs(1));
    }

    pub fn set_streaming_enabled(&self, enabled: bool) {
        self.inner.streaming_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Wake the loop as a broker stream callback would (also used by tests).
    pub fn notify_stream_wake(&self) {
        self.inner.stream_wake.notify_one();
    }

    pub async fn is_loop_alive(&self) -> bool {
        self.loop_handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start the runner: connect the broker, restore checkpoints, start the
    /// strategies and spawn the loop task. Idempotent: returns false when
    /// already active or when no strategies are loaded.
    pub async fn start(&self) -> bool {
        if self.is_loop_alive().await {
            warn!("runner already active");
            return false;
        }
        if self.inner.strategies.lock().await.is_empty() {
            warn!("no strategies loaded");
            return false;
        }

        if !self.inner.broker.is_connected().await {
            match self.inner.broker.connect().await {
                Ok(true) => {}
                _ => {
                    error!("failed to connect to broker");
                    return false;
                }
            }
        }

        restore_sleep_state(&self.inner).await;
        restore_runtime_state(&self.inner).await;

        // Optional trade-update stream; polling remains the fallback.
        if self.inner.streaming_enabled.load(Ordering::SeqCst) {
            let wake = Arc::clone(&self.inner.stream_wake);
            let callback: TradeUpdateCallback = Arc::new(move |_update| {
                // Only signal the loop; reconciliation happens on the tick.
                wake.notify_one();
            });
            match self.inner.broker.start_trade_update_stream(callback).await {
                Ok(true) => info!("broker trade update stream enabled"),
                Ok(false) => info!("broker trade update stream unavailable, using polling fallback"),
                Err(e) => warn!(error = %e, "failed to start trade update stream"),
            }
        }

        {
            let mut strategies = self.inner.strategies.lock().await;
            for (name, strategy) in strategies.iter_mut() {
                strategy.on_start();
                info!(strategy = %name, "started strategy");
            }
        }
        for (name, strategy_id) in self.strategy_identities().await {
            audit_strategy(
                &self.inner,
                AuditEventType::StrategyStarted,
                &name,
                strategy_id,
            )
            .await;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            // The loop may immediately transition to SLEEPING.
            state.status = RunnerStatus::Running;
        }
        self.inner.stop_flag.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        *self.loop_handle.lock().await = Some(tokio::spawn(run_loop(inner)));

        persist_runtime_state(&self.inner, true).await;
        audit(
            &self.inner,
            AuditEventType::RunnerStarted,
            "Strategy runner started".to_string(),
            None,
        )
        .await;
        info!("runner started");
        true
    }

    /// Stop the runner: signal the loop, join with a bounded wait, stop the
    /// strategies and the stream, disconnect the broker, persist final
    /// checkpoints.
    pub async fn stop(&self) -> bool {
        {
            let state = self.inner.state.lock().unwrap();
            if state.status == RunnerStatus::Stopped {
                debug!("runner already stopped");
                return false;
            }
        }

        self.inner.stop_flag.store(true, Ordering::SeqCst);
        self.inner.stop_notify.notify_waiters();

        if let Some(mut handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("runner loop did not stop within the join timeout");
                handle.abort();
            }
        }

        {
            let mut strategies = self.inner.strategies.lock().await;
            for (name, strategy) in strategies.iter_mut() {
                strategy.on_stop();
                info!(strategy = %name, "stopped strategy");
            }
        }
        for (name, strategy_id) in self.strategy_identities().await {
            audit_strategy(
                &self.inner,
                AuditEventType::StrategyStopped,
                &name,
                strategy_id,
            )
            .await;
        }

        if self.inner.streaming_enabled.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.broker.stop_trade_update_stream().await {
                warn!(error = %e, "error stopping trade update stream");
            }
        }
        if self.inner.broker.is_connected().await {
            let _ = self.inner.broker.disconnect().await;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.sleeping = false;
            state.sleep_since = None;
            state.next_market_open_at = None;
            state.status = RunnerStatus::Stopped;
        }
        persist_sleep_state(&self.inner).await;
        persist_runtime_state(&self.inner, false).await;
        audit(
            &self.inner,
            AuditEventType::RunnerStopped,
            "Strategy runner stopped".to_string(),
            None,
        )
        .await;
        info!("runner stopped");
        true
    }

    pub fn status(&self) -> RunnerStatus {
        self.inner.state.lock().unwrap().status
    }

    async fn strategy_identities(&self) -> Vec<(String, Option<i64>)> {
        self.inner
            .strategies
            .lock()
            .await
            .iter()
            .map(|(name, strategy)| (name.clone(), strategy.strategy_id()))
            .collect()
    }

    pub async fn status_report(&self) -> RunnerStatusReport {
        let strategies: Vec<String> = self.inner.strategies.lock().await.keys().cloned().collect();
        let broker_connected = self.inner.broker.is_connected().await;
        let runner_thread_alive = self.is_loop_alive().await;
        let tick = *self.inner.tick_interval.lock().unwrap();
        let state = self.inner.state.lock().unwrap().clone();
        RunnerStatusReport {
            status: state.status.as_str(),
            strategies,
            tick_interval_secs: tick.as_secs_f64(),
            broker_connected,
            runner_thread_alive,
            poll_success_count: state.poll_success_count,
            poll_error_count: state.poll_error_count,
            last_poll_error: state.last_poll_error,
            last_poll_at: state.last_poll_at,
            last_successful_poll_at: state.last_successful_poll_at,
            last_reconciliation_at: state.last_reconciliation_at,
            last_reconciliation_discrepancies: state.last_reconciliation_discrepancies,
            sleeping: state.sleeping,
            sleep_since: state.sleep_since,
            next_market_open_at: state.next_market_open_at,
            last_resume_at: state.last_resume_at,
            last_catchup_at: state.last_catchup_at,
            resume_count: state.resume_count,
            market_session_open: state.market_session_open,
            last_state_persisted_at: state.last_state_persisted_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run_loop(inner: Arc<RunnerInner>) {
    let tick = *inner.tick_interval.lock().unwrap();
    info!(interval_secs = tick.as_secs_f64(), "scheduler loop started");

    while !inner.stop_flag.load(Ordering::SeqCst) {
        inner.state.lock().unwrap().last_poll_at = Some(Utc::now());

        match run_tick(&inner).await {
            Ok(TickOutcome::Slept) => {
                // Off-hours: the tick already waited on the long interval.
                continue;
            }
            Ok(TickOutcome::Processed) => {
                let mut state = inner.state.lock().unwrap();
                state.poll_success_count += 1;
                state.last_successful_poll_at = Some(Utc::now());
            }
            Err(message) => {
                {
                    let mut state = inner.state.lock().unwrap();
                    state.poll_error_count += 1;
                    state.last_poll_error = message.clone();
                }
                error!(error = %message, "scheduler loop error");
                audit_poll_error(&inner, &message).await;
                // Broker-scope failure: skip reconciliation and the
                // snapshot, wait for the next tick.
                let tick = *inner.tick_interval.lock().unwrap();
                sleep_wait(&inner, tick).await;
                continue;
            }
        }

        // Keep local order/trade/position state synchronized with broker
        // fills, then periodic position reconciliation and the snapshot.
        reconcile_open_orders(&inner).await;
        maybe_reconcile_positions(&inner).await;
        if let Err(e) = record_portfolio_snapshot(&inner).await {
            warn!(error = %e, "error recording portfolio snapshot");
        }
        persist_runtime_state(&inner, true).await;

        let tick = *inner.tick_interval.lock().unwrap();
        sleep_wait(&inner, tick).await;
    }

    info!("scheduler loop exited");
}

enum TickOutcome {
    Processed,
    Slept,
}

async fn run_tick(inner: &Arc<RunnerInner>) -> Result<TickOutcome, String> {
    if !inner.broker.is_connected().await {
        match inner.broker.connect().await {
            Ok(true) => info!("broker reconnected in runner loop"),
            Ok(false) => return Err("Broker reconnect failed".to_string()),
            Err(e) => return Err(format!("Broker reconnect failed: {}", e.message)),
        }
    }

    let market_open = inner
        .broker
        .is_market_open()
        .await
        .map_err(|e| format!("Market clock query failed: {}", e.message))?;
    inner.state.lock().unwrap().market_session_open = Some(market_open);

    if !market_open {
        enter_sleep_mode(inner).await;
        {
            let mut state = inner.state.lock().unwrap();
            state.poll_success_count += 1;
            state.last_successful_poll_at = Some(Utc::now());
        }
        persist_runtime_state(inner, true).await;
        let off_hours = off_hours_poll_interval(inner);
        sleep_wait(inner, off_hours).await;
        return Ok(TickOutcome::Slept);
    }

    if inner.state.lock().unwrap().sleeping {
        resume_from_sleep(inner).await;
    }

    let quotes = fetch_market_data(inner).await;

    let mut strategies = inner.strategies.lock().await;
    for (name, strategy) in strategies.iter_mut() {
        let signals = strategy.on_tick(&quotes).await;
        if signals.is_empty() {
            continue;
        }
        let strategy_id = strategy.strategy_id();
        execute_signals(inner, name, strategy_id, &signals).await;
    }

    Ok(TickOutcome::Processed)
}

/// De-duplicated quote fetch across all loaded strategies.
async fn fetch_market_data(inner: &Arc<RunnerInner>) -> HashMap<String, Quote> {
    let mut symbols: Vec<String> = Vec::new();
    {
        let strategies = inner.strategies.lock().await;
        for strategy in strategies.values() {
            for symbol in strategy.symbols() {
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
        }
    }

    let mut quotes = HashMap::new();
    for symbol in symbols {
        match inner.broker.get_market_data(&symbol).await {
            Ok(quote) => {
                quotes.insert(symbol, quote);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "error fetching market data");
            }
        }
    }
    quotes
}

async fn execute_signals(
    inner: &Arc<RunnerInner>,
    strategy_name: &str,
    strategy_id: Option<i64>,
    signals: &[SignalRequest],
) {
    for request in signals {
        let side = match request.signal {
            Signal::Buy => sbot_schemas::OrderSide::Buy,
            Signal::Sell | Signal::Close => sbot_schemas::OrderSide::Sell,
            Signal::Hold => continue,
        };

        match inner
            .execution
            .submit_order(
                &request.symbol,
                side,
                request.order_type,
                request.quantity,
                request.price,
                strategy_id,
            )
            .await
        {
            Ok(order) => {
                info!(
                    strategy = %strategy_name,
                    symbol = %request.symbol,
                    side = side.as_str(),
                    order_id = order.id,
                    status = order.status.as_str(),
                    reason = %request.reason,
                    "executed signal"
                );
            }
            Err(e) => {
                let message = format!("strategy:{strategy_name} -> {e}");
                {
                    let mut state = inner.state.lock().unwrap();
                    state.poll_error_count += 1;
                    state.last_poll_error = message.clone();
                }
                warn!(strategy = %strategy_name, error = %e, "error executing signal");
                audit_poll_error(inner, &message).await;
            }
        }
    }
}

/// Sleep up to `duration`, in half-second slices, waking early on the
/// stream event or a stop request.
async fn sleep_wait(inner: &Arc<RunnerInner>, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !inner.stop_flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let slice = SLEEP_SLICE.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(slice) => {}
            _ = inner.stream_wake.notified() => break,
            _ = inner.stop_notify.notified() => break,
        }
    }
}

fn off_hours_poll_interval(inner: &Arc<RunnerInner>) -> Duration {
    let tick = *inner.tick_interval.lock().unwrap();
    tick.max(Duration::from_secs(15))
}

async fn enter_sleep_mode(inner: &Arc<RunnerInner>) {
    let already_sleeping = inner.state.lock().unwrap().sleeping;
    let next_open = match inner.broker.get_next_market_open().await {
        Ok(next) => next,
        Err(e) => {
            debug!(error = %e, "failed to fetch next market open");
            None
        }
    };

    if already_sleeping {
        // Keep the next-open forecast fresh for the status report.
        inner.state.lock().unwrap().next_market_open_at = next_open;
        persist_sleep_state(inner).await;
        return;
    }

    let sleep_since = Utc::now();
    {
        let mut state = inner.state.lock().unwrap();
        state.sleeping = true;
        state.sleep_since = Some(sleep_since);
        state.next_market_open_at = next_open;
        state.status = RunnerStatus::Sleeping;
    }
    persist_sleep_state(inner).await;
    audit(
        inner,
        AuditEventType::ConfigUpdated,
        "Runner entered off-hours sleep mode".to_string(),
        Some(json!({
            "sleep_since": sleep_since,
            "next_market_open_at": next_open,
        })),
    )
    .await;
    info!("runner entered off-hours sleep mode");
}

async fn resume_from_sleep(inner: &Arc<RunnerInner>) {
    let resume_at = Utc::now();
    let resume_count = {
        let mut state = inner.state.lock().unwrap();
        state.sleeping = false;
        state.last_resume_at = Some(resume_at);
        state.last_catchup_at = Some(resume_at);
        state.resume_count += 1;
        state.sleep_since = None;
        state.next_market_open_at = None;
        state.status = RunnerStatus::Running;
        state.resume_count
    };

    // Warm the market-data cache so strategies pick up continuity quickly.
    let _ = fetch_market_data(inner).await;

    persist_sleep_state(inner).await;
    audit(
        inner,
        AuditEventType::ConfigUpdated,
        "Runner resumed after market open".to_string(),
        Some(json!({
            "resume_at": resume_at,
            "resume_count": resume_count,
        })),
    )
    .await;
    info!(resume_count, "runner resumed after market open");
}

/// Poll broker status for every non-terminal stored order.
async fn reconcile_open_orders(inner: &Arc<RunnerInner>) {
    let open_orders = match inner.storage.get_open_orders(OPEN_ORDER_RECONCILE_LIMIT).await {
        Ok(orders) => orders,
        Err(e) => {
            warn!(error = %e, "error loading open orders for reconciliation");
            return;
        }
    };
    for order in open_orders {
        if let Err(e) = inner.execution.update_order_status(&order).await {
            warn!(order_id = order.id, error = %e, "failed to reconcile order");
        }
    }
}

/// Every five minutes, diff summed broker quantity against local open
/// positions per symbol and audit when any |diff| exceeds 1e-6.
async fn maybe_reconcile_positions(inner: &Arc<RunnerInner>) {
    {
        let state = inner.state.lock().unwrap();
        if let Some(last) = state.last_position_reconcile {
            if last.elapsed() < POSITION_RECONCILE_INTERVAL {
                return;
            }
        }
    }
    inner.state.lock().unwrap().last_position_reconcile = Some(Instant::now());

    let broker_positions = match inner.broker.get_positions().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "error during position reconciliation");
            return;
        }
    };
    let local_positions = match inner.storage.get_open_positions().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "error loading local positions");
            return;
        }
    };

    let mut broker_qty: HashMap<String, f64> = HashMap::new();
    for row in &broker_positions {
        let symbol = row.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            continue;
        }
        *broker_qty.entry(symbol).or_insert(0.0) += row.quantity;
    }
    let mut local_qty: HashMap<String, f64> = HashMap::new();
    for row in &local_positions {
        *local_qty
            .entry(row.symbol.trim().to_ascii_uppercase())
            .or_insert(0.0) += row.quantity;
    }

    let mut discrepancies = 0u64;
    let mut symbols: Vec<&String> = broker_qty.keys().chain(local_qty.keys()).collect();
    symbols.sort();
    symbols.dedup();
    for symbol in symbols {
        let broker_value = broker_qty.get(symbol).copied().unwrap_or(0.0);
        let local_value = local_qty.get(symbol).copied().unwrap_or(0.0);
        if (broker_value - local_value).abs() > 1e-6 {
            discrepancies += 1;
        }
    }

    {
        let mut state = inner.state.lock().unwrap();
        state.last_reconciliation_at = Some(Utc::now());
        state.last_reconciliation_discrepancies = discrepancies;
    }

    if discrepancies > 0 {
        audit(
            inner,
            AuditEventType::Error,
            format!("Runner reconciliation found {discrepancies} discrepancy(ies)"),
            Some(json!({ "source": "strategy_runner_reconciliation" })),
        )
        .await;
    }
}

/// One portfolio snapshot per successful tick.
async fn record_portfolio_snapshot(inner: &Arc<RunnerInner>) -> Result<(), String> {
    let account = inner
        .broker
        .get_account_info()
        .await
        .map_err(|e| e.to_string())?;
    let positions = inner.broker.get_positions().await.map_err(|e| e.to_string())?;

    let mut market_value = 0.0;
    let mut unrealized_pnl = 0.0;
    for row in &positions {
        let qty = row.quantity.abs();
        let mut row_market_value = row.market_value;
        if row_market_value <= 0.0 && qty > 0.0 {
            let price = if row.current_price > 0.0 {
                row.current_price
            } else {
                row.avg_entry_price
            };
            row_market_value = qty * price;
        }
        market_value += row_market_value.max(0.0);
        unrealized_pnl += row_market_value - qty * row.avg_entry_price;
    }

    let trades = inner
        .storage
        .recent_trades(5000)
        .await
        .map_err(|e| e.to_string())?;
    let realized_pnl_total: f64 = trades.iter().filter_map(|t| t.realized_pnl).sum();

    inner
        .storage
        .record_portfolio_snapshot(NewPortfolioSnapshot {
            timestamp: Utc::now(),
            equity: account.equity.max(0.0),
            cash: account.cash.max(0.0),
            buying_power: account.buying_power.max(0.0),
            market_value: market_value.max(0.0),
            unrealized_pnl,
            realized_pnl_total,
            open_positions: positions.len() as i64,
        })
        .await
        .map_err(|e| e.to_string())
}

/// Write poll errors into the audit trail, at most once per 30 seconds.
async fn audit_poll_error(inner: &Arc<RunnerInner>, message: &str) {
    let now = Utc::now();
    {
        let mut state = inner.state.lock().unwrap();
        if let Some(last) = state.last_error_audit_at {
            if (now - last).num_seconds() < ERROR_AUDIT_THROTTLE_SECS {
                return;
            }
        }
        state.last_error_audit_at = Some(now);
    }
    audit(
        inner,
        AuditEventType::Error,
        format!("Runner poll error: {message}"),
        Some(json!({ "source": "strategy_runner_poll" })),
    )
    .await;
}

async fn audit_strategy(
    inner: &Arc<RunnerInner>,
    event_type: AuditEventType,
    name: &str,
    strategy_id: Option<i64>,
) {
    let verb = if event_type == AuditEventType::StrategyStarted {
        "started"
    } else {
        "stopped"
    };
    let result = inner
        .storage
        .create_audit_log(NewAuditLog {
            event_type,
            description: format!("Strategy {verb}: {name}"),
            details: Some(json!({ "strategy": name })),
            user_id: None,
            strategy_id,
            order_id: None,
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "failed to write strategy audit log");
    }
}

async fn audit(
    inner: &Arc<RunnerInner>,
    event_type: AuditEventType,
    description: String,
    details: Option<serde_json::Value>,
) {
    let result = inner
        .storage
        .create_audit_log(NewAuditLog {
            event_type,
            description,
            details,
            user_id: None,
            strategy_id: None,
            order_id: None,
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "failed to write runner audit log");
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

async fn persist_sleep_state(inner: &Arc<RunnerInner>) {
    let payload = {
        let state = inner.state.lock().unwrap();
        SleepState {
            sleeping: state.sleeping,
            sleep_since: state.sleep_since,
            next_market_open_at: state.next_market_open_at,
            last_resume_at: state.last_resume_at,
            last_catchup_at: state.last_catchup_at,
            resume_count: state.resume_count,
        }
    };
    let value = match serde_json::to_string(&payload) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "failed to serialize sleep-state checkpoint");
            return;
        }
    };
    if let Err(e) = inner
        .storage
        .upsert_config(
            RUNNER_SLEEP_STATE_KEY,
            &value,
            "json",
            Some("Runner sleep/resume continuity checkpoint"),
        )
        .await
    {
        // Checkpoints are best-effort.
        error!(error = %e, "failed to persist runner sleep-state checkpoint");
    }
}

async fn persist_runtime_state(inner: &Arc<RunnerInner>, thread_alive: bool) {
    let broker_connected = inner.broker.is_connected().await;
    let persisted_at = Utc::now();
    let payload = {
        let state = inner.state.lock().unwrap();
        RuntimeState {
            status: state.status.as_str().to_string(),
            poll_success_count: state.poll_success_count,
            poll_error_count: state.poll_error_count,
            last_poll_error: state.last_poll_error.clone(),
            last_poll_at: state.last_poll_at,
            last_successful_poll_at: state.last_successful_poll_at,
            last_reconciliation_at: state.last_reconciliation_at,
            last_reconciliation_discrepancies: state.last_reconciliation_discrepancies,
            sleeping: state.sleeping,
            sleep_since: state.sleep_since,
            next_market_open_at: state.next_market_open_at,
            last_resume_at: state.last_resume_at,
            last_catchup_at: state.last_catchup_at,
            resume_count: state.resume_count,
            market_session_open: state.market_session_open,
            broker_connected,
            runner_thread_alive: thread_alive,
            persisted_at,
        }
    };
    let value = match serde_json::to_string(&payload) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "failed to serialize runtime-state checkpoint");
            return;
        }
    };
    match inner
        .storage
        .upsert_config(
            RUNNER_RUNTIME_STATE_KEY,
            &value,
            "json",
            Some("Runner runtime health/status checkpoint"),
        )
        .await
    {
        Ok(()) => {
            inner.state.lock().unwrap().last_state_persisted_at = Some(persisted_at);
        }
        Err(e) => {
            error!(error = %e, "failed to persist runner runtime-state checkpoint");
        }
    }
}

async fn restore_sleep_state(inner: &Arc<RunnerInner>) {
    let entry = match inner.storage.get_config(RUNNER_SLEEP_STATE_KEY).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "failed to restore runner sleep-state checkpoint");
            return;
        }
    };
    let Ok(payload) = serde_json::from_str::<SleepState>(&entry.value) else {
        warn!("unparsable sleep-state checkpoint; ignoring");
        return;
    };
    let mut state = inner.state.lock().unwrap();
    state.sleeping = payload.sleeping;
    state.sleep_since = payload.sleep_since;
    state.next_market_open_at = payload.next_market_open_at;
    state.last_resume_at = payload.last_resume_at;
    state.last_catchup_at = payload.last_catchup_at;
    state.resume_count = payload.resume_count;
    if state.sleeping {
        state.status = RunnerStatus::Sleeping;
    }
}

async fn restore_runtime_state(inner: &Arc<RunnerInner>) {
    let entry = match inner.storage.get_config(RUNNER_RUNTIME_STATE_KEY).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "failed to restore runner runtime-state checkpoint");
            return;
        }
    };
    let Ok(payload) = serde_json::from_str::<RuntimeState>(&entry.value) else {
        warn!("unparsable runtime-state checkpoint; ignoring");
        return;
    };
    let mut state = inner.state.lock().unwrap();
    state.poll_success_count = payload.poll_success_count;
    state.poll_error_count = payload.poll_error_count;
    if !payload.last_poll_error.is_empty() {
        state.last_poll_error = payload.last_poll_error;
    }
    state.last_poll_at = payload.last_poll_at.or(state.last_poll_at);
    state.last_successful_poll_at = payload
        .last_successful_poll_at
        .or(state.last_successful_poll_at);
    state.last_reconciliation_at = payload.last_reconciliation_at.or(state.last_reconciliation_at);
    state.last_reconciliation_discrepancies = payload.last_reconciliation_discrepancies;
    if payload.market_session_open.is_some() {
        state.market_session_open = payload.market_session_open;
    }
    state.last_state_persisted_at = Some(payload.persisted_at);
}
