//! Deterministic in-memory paper broker.
//!
//! Simulation rules:
//! - Prices derive from the ticker string (stable baseline 25..425) plus a
//!   30-second drift bucket of at most ±0.8%. AAPL is pinned at 100.0 and
//!   MSFT at 300.0; tests can pin any symbol with [`PaperBroker::pin_price`].
//! - Market orders fill immediately at the simulated price and adjust cash.
//! - Limit orders stay PENDING until a quote fetch observes the simulated
//!   price crossing the limit.
//! - The market-session clock is a settable flag (default open) so tests and
//!   the runner's off-hours path can be driven deterministically; the
//!   next-open forecast is the next New York weekday 09:30.
//! - No randomness anywhere.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

use sbot_broker::{
    AccountInfo, Bar, Broker, BrokerError, BrokerOrder, BrokerPosition, BrokerResult, Quote,
    Timeframe,
};
use sbot_schemas::{OrderSide, OrderType};

const HALF_SPREAD_FRACTION: f64 = 0.0005;

struct PaperState {
    connected: bool,
    balance: f64,
    market_open: bool,
    order_counter: u64,
    orders: BTreeMap<u64, BrokerOrder>,
    positions: BTreeMap<String, BrokerPosition>,
    pinned_prices: BTreeMap<String, f64>,
    untradable: BTreeMap<String, bool>,
    non_fractionable: BTreeMap<String, bool>,
}

pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(100_000.0)
    }
}

impl PaperBroker {
    pub fn new(starting_balance: f64) -> Self {
        let mut pinned = BTreeMap::new();
        // Stable anchors for scenario tests.
        pinned.insert("AAPL".to_string(), 100.0);
        pinned.insert("MSFT".to_string(), 300.0);
        Self {
            state: Mutex::new(PaperState {
                connected: false,
                balance: starting_balance,
                market_open: true,
                order_counter: 0,
                orders: BTreeMap::new(),
                positions: BTreeMap::new(),
                pinned_prices: pinned,
                untradable: BTreeMap::new(),
                non_fractionable: BTreeMap::new(),
            }),
        }
    }

    /// Pin a symbol to a fixed price (test setup).
    pub fn pin_price(&self, symbol: &str, price: f64) {
        let mut st = self.state.lock().unwrap();
        st.pinned_prices.insert(symbol.to_ascii_uppercase(), price);
    }

    /// Flip the simulated market-session flag.
    pub fn set_market_open(&self, open: bool) {
        self.state.lock().unwrap().market_open = open;
    }

    /// Mark a symbol untradable (test setup).
    pub fn set_symbol_tradable(&self, symbol: &str, tradable: bool) {
        let mut st = self.state.lock().unwrap();
        st.untradable
            .insert(symbol.to_ascii_uppercase(), !tradable);
    }

    pub fn set_symbol_fractionable(&self, symbol: &str, fractionable: bool) {
        let mut st = self.state.lock().unwrap();
        st.non_fractionable
            .insert(symbol.to_ascii_uppercase(), !fractionable);
    }

    pub fn cash_balance(&self) -> f64 {
        self.state.lock().unwrap().balance
    }

    /// Seed a position directly (test setup / scenario wiring).
    pub fn set_position(&self, symbol: &str, quantity: f64, avg_entry_price: f64) {
        let symbol = symbol.to_ascii_uppercase();
        let mut st = self.state.lock().unwrap();
        let price = simulated_price(&st.pinned_prices, &symbol);
        st.positions
            .insert(symbol.clone(), build_position(&symbol, quantity, avg_entry_price, price));
    }

    fn quote_locked(st: &mut PaperState, symbol: &str) -> Quote {
        let symbol = symbol.to_ascii_uppercase();
        let price = simulated_price(&st.pinned_prices, &symbol);

        fill_pending_limit_orders(st, &symbol, price);
        if let Some(pos) = st.positions.get_mut(&symbol) {
            mark_to_market(pos, price);
        }

        let spread = (price * HALF_SPREAD_FRACTION).max(0.01);
        Quote {
            symbol: symbol.clone(),
            price,
            bid: (price - spread).max(0.01),
            ask: price + spread,
            volume: simulated_volume(&symbol),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn connect(&self) -> BrokerResult<bool> {
        self.state.lock().unwrap().connected = true;
        Ok(true)
    }

    async fn disconnect(&self) -> BrokerResult<bool> {
        self.state.lock().unwrap().connected = false;
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn get_account_info(&self) -> BrokerResult<AccountInfo> {
        let mut st = self.state.lock().unwrap();
        let mut positions_value = 0.0;
        let symbols: Vec<String> = st.positions.keys().cloned().collect();
        for symbol in symbols {
            let price = simulated_price(&st.pinned_prices, &symbol);
            if let Some(pos) = st.positions.get_mut(&symbol) {
                mark_to_market(pos, price);
                positions_value += pos.market_value;
            }
        }
        Ok(AccountInfo {
            cash: st.balance,
            equity: st.balance + positions_value,
            portfolio_value: st.balance + positions_value,
            buying_power: st.balance.max(0.0),
            status: "ACTIVE".to_string(),
        })
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let mut st = self.state.lock().unwrap();
        let symbols: Vec<String> = st.positions.keys().cloned().collect();
        for symbol in symbols {
            let price = simulated_price(&st.pinned_prices, &symbol);
            if let Some(pos) = st.positions.get_mut(&symbol) {
                mark_to_market(pos, price);
            }
        }
        Ok(st.positions.values().cloned().collect())
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> BrokerResult<BrokerOrder> {
        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(BrokerError::new("order quantity must be positive"));
        }
        if order_type.requires_price() && price.is_none() {
            return Err(BrokerError::new(format!(
                "price required for {} orders",
                order_type.as_str()
            )));
        }

        let symbol = symbol.to_ascii_uppercase();
        let now = Utc::now();
        let mut st = self.state.lock().unwrap();
        st.order_counter += 1;
        let seq = st.order_counter;
        let order_id = format!("paper-{seq}");
        let current_price = simulated_price(&st.pinned_prices, &symbol);

        let mut order = BrokerOrder {
            id: order_id,
            symbol: symbol.clone(),
            side,
            order_type,
            quantity,
            filled_quantity: 0.0,
            price,
            avg_fill_price: None,
            status: "pending".to_string(),
            created_at: now,
            updated_at: now,
        };

        if order_type == OrderType::Market {
            order.status = "filled".to_string();
            order.filled_quantity = quantity;
            order.avg_fill_price = Some(current_price);
            match side {
                OrderSide::Buy => st.balance -= quantity * current_price,
                OrderSide::Sell => st.balance += quantity * current_price,
            }
            apply_fill_to_positions(&mut st.positions, &symbol, side, quantity, current_price, current_price);
        }

        st.orders.insert(seq, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
        let mut st = self.state.lock().unwrap();
        for order in st.orders.values_mut() {
            if order.id == order_id {
                order.status = "cancelled".to_string();
                order.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<BrokerOrder> {
        let mut st = self.state.lock().unwrap();
        let symbol = st
            .orders
            .values()
            .find(|o| o.id == order_id)
            .map(|o| o.symbol.clone())
            .ok_or_else(|| BrokerError::new(format!("unknown order id {order_id}")))?;

        // A fetch re-evaluates pending limit orders for the symbol.
        let price = simulated_price(&st.pinned_prices, &symbol);
        fill_pending_limit_orders(&mut st, &symbol, price);

        let order = st
            .orders
            .values()
            .find(|o| o.id == order_id)
            .map(|o| o.clone())
            .ok_or_else(|| BrokerError::new(format!("unknown order id {order_id}")))?;
        Ok(order)
    }

    async fn get_orders(&self, status: Option<&str>) -> BrokerResult<Vec<BrokerOrder>> {
        let mut st = self.state.lock().unwrap();
        let pending_symbols: Vec<String> = st
            .orders
            .values()
            .filter(|o| o.status == "pending" && o.order_type == OrderType::Limit)
            .map(|o| o.symbol.clone())
            .collect();
        for symbol in pending_symbols {
            let price = simulated_price(&st.pinned_prices, &symbol);
            fill_pending_limit_orders(&mut st, &symbol, price);
        }

        let rows = st
            .orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn get_market_data(&self, symbol: &str) -> BrokerResult<Quote> {
        let mut st = self.state.lock().unwrap();
        Ok(Self::quote_locked(&mut st, symbol))
    }

    async fn get_historical_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
        _timeframe: Timeframe,
    ) -> BrokerResult<Vec<Bar>> {
        let symbol = symbol.to_ascii_uppercase();
        let base = {
            let st = self.state.lock().unwrap();
            simulated_baseline(&st.pinned_prices, &symbol)
        };
        let end = end.unwrap_or_else(Utc::now);
        let days = (end - start).num_days().max(0) as usize + 1;
        let mut bars = Vec::with_capacity(days);
        for i in 0..days {
            let ts = end - Duration::days((days - 1 - i) as i64);
            let (close, high, low) = synthetic_ohlc(base, i, days);
            bars.push(Bar {
                timestamp: ts,
                open: close,
                high,
                low,
                close,
                volume: simulated_volume(&symbol),
            });
        }
        if let Some(limit) = limit {
            if bars.len() > limit {
                let start_idx = bars.len() - limit;
                bars = bars.split_off(start_idx);
            }
        }
        Ok(bars)
    }

    async fn is_market_open(&self) -> BrokerResult<bool> {
        Ok(self.state.lock().unwrap().market_open)
    }

    async fn get_next_market_open(&self) -> BrokerResult<Option<DateTime<Utc>>> {
        Ok(Some(next_ny_open(Utc::now())))
    }

    async fn is_symbol_tradable(&self, symbol: &str) -> BrokerResult<bool> {
        let st = self.state.lock().unwrap();
        Ok(!st
            .untradable
            .get(&symbol.to_ascii_uppercase())
            .copied()
            .unwrap_or(false))
    }

    async fn is_symbol_fractionable(&self, symbol: &str) -> BrokerResult<bool> {
        let st = self.state.lock().unwrap();
        Ok(!st
            .non_fractionable
            .get(&symbol.to_ascii_uppercase())
            .copied()
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Simulation helpers
// ---------------------------------------------------------------------------

fn simulated_price(pinned: &BTreeMap<String, f64>, symbol: &str) -> f64 {
    if let Some(price) = pinned.get(symbol) {
        return *price;
    }
    let base = simulated_baseline(pinned, symbol);
    let bucket = Utc::now().timestamp() / 30;
    let char_sum: i64 = symbol.chars().map(|c| c as i64).sum();
    let drift_seed = (char_sum + bucket).rem_euclid(17) - 8;
    let drift_pct = drift_seed as f64 / 1000.0; // at most ±0.8%
    ((base * (1.0 + drift_pct)).max(1.0) * 100.0).round() / 100.0
}

fn simulated_baseline(pinned: &BTreeMap<String, f64>, symbol: &str) -> f64 {
    if let Some(price) = pinned.get(symbol) {
        return *price;
    }
    let seed: i64 = symbol
        .chars()
        .enumerate()
        .map(|(idx, ch)| (idx as i64 + 1) * ch as i64)
        .sum();
    ((seed % 400) + 25) as f64
}

fn simulated_volume(symbol: &str) -> i64 {
    let char_sum: i64 = symbol.chars().map(|c| c as i64).sum();
    200_000 + char_sum % 2_500_000
}

fn synthetic_ohlc(base: f64, i: usize, days: usize) -> (f64, f64, f64) {
    let noise = (i as f64 / 7.0).sin() * 0.8 + (i as f64 / 17.0).cos() * 0.4;
    let trend = (i as f64 / days.max(1) as f64) * 0.05;
    let close = (base * (1.0 + trend + noise / 100.0)).max(1.0);
    let intraday_range_pct = 0.004 + noise.abs() / 300.0;
    let high = close * (1.0 + intraday_range_pct);
    let low = (close * (1.0 - intraday_range_pct)).max(0.01);
    (close, high, low)
}

fn build_position(symbol: &str, quantity: f64, avg_entry_price: f64, current_price: f64) -> BrokerPosition {
    let market_value = quantity * current_price;
    let cost_basis = quantity * avg_entry_price;
    BrokerPosition {
        symbol: symbol.to_string(),
        quantity,
        side: "long".to_string(),
        avg_entry_price,
        current_price,
        market_value,
        cost_basis,
        unrealized_pnl: market_value - cost_basis,
        unrealized_pnl_percent: if avg_entry_price > 0.0 {
            (current_price - avg_entry_price) / avg_entry_price * 100.0
        } else {
            0.0
        },
    }
}

fn mark_to_market(pos: &mut BrokerPosition, current_price: f64) {
    pos.current_price = current_price;
    pos.market_value = pos.quantity * current_price;
    pos.cost_basis = pos.quantity * pos.avg_entry_price;
    pos.unrealized_pnl = pos.market_value - pos.cost_basis;
    pos.unrealized_pnl_percent = if pos.avg_entry_price > 0.0 {
        (current_price - pos.avg_entry_price) / pos.avg_entry_price * 100.0
    } else {
        0.0
    };
}

fn apply_fill_to_positions(
    positions: &mut BTreeMap<String, BrokerPosition>,
    symbol: &str,
    side: OrderSide,
    quantity: f64,
    fill_price: f64,
    current_price: f64,
) {
    let (existing_qty, existing_avg) = positions
        .get(symbol)
        .map(|p| (p.quantity, p.avg_entry_price))
        .unwrap_or((0.0, fill_price));

    match side {
        OrderSide::Buy => {
            let new_qty = existing_qty + quantity;
            let new_avg = if new_qty > 0.0 {
                (existing_qty * existing_avg + quantity * fill_price) / new_qty
            } else {
                fill_price
            };
            positions.insert(symbol.to_string(), build_position(symbol, new_qty, new_avg, current_price));
        }
        OrderSide::Sell => {
            let new_qty = (existing_qty - quantity).max(0.0);
            if new_qty <= 0.0 {
                positions.remove(symbol);
            } else {
                positions.insert(
                    symbol.to_string(),
                    build_position(symbol, new_qty, existing_avg, current_price),
                );
            }
        }
    }
}

fn fill_pending_limit_orders(st: &mut PaperState, symbol: &str, current_price: f64) {
    let mut fills: Vec<(u64, OrderSide, f64, f64)> = Vec::new();
    for (seq, order) in st.orders.iter() {
        if order.symbol != symbol
            || order.status != "pending"
            || order.order_type != OrderType::Limit
        {
            continue;
        }
        let limit_price = order.price.unwrap_or(0.0);
        if limit_price <= 0.0 || order.quantity <= 0.0 {
            continue;
        }
        let fill_price = match order.side {
            OrderSide::Buy if current_price <= limit_price => current_price.min(limit_price),
            OrderSide::Sell if current_price >= limit_price => current_price.max(limit_price),
            _ => continue,
        };
        fills.push((*seq, order.side, order.quantity, fill_price));
    }

    for (seq, side, quantity, fill_price) in fills {
        if let Some(order) = st.orders.get_mut(&seq) {
            order.status = "filled".to_string();
            order.filled_quantity = quantity;
            order.avg_fill_price = Some(fill_price);
            order.updated_at = Utc::now();
        }
        match side {
            OrderSide::Buy => st.balance -= quantity * fill_price,
            OrderSide::Sell => st.balance += quantity * fill_price,
        }
        apply_fill_to_positions(&mut st.positions, symbol, side, quantity, fill_price, current_price);
    }
}

/// Next regular New York session open (weekdays 09:30 ET) strictly after
/// `after`.
fn next_ny_open(after: DateTime<Utc>) -> DateTime<Utc> {
    let ny = after.with_timezone(&New_York);
    let mut date = ny.date_naive();
    loop {
        let is_weekday = !matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        if is_weekday {
            let open_naive = date.and_hms_opt(9, 30, 0).expect("valid session open time");
            if let Some(open) = New_York.from_local_datetime(&open_naive).single() {
                let open_utc = open.with_timezone(&Utc);
                if open_utc > after {
                    return open_utc;
                }
            }
        }
        date = date.succ_opt().expect("calendar does not overflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_buy_fills_immediately_and_debits_cash() {
        let broker = PaperBroker::new(100_000.0);
        broker.connect().await.unwrap();

        let order = broker
            .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 10.0, None)
            .await
            .unwrap();

        assert_eq!(order.status, "filled");
        assert_eq!(order.filled_quantity, 10.0);
        assert_eq!(order.avg_fill_price, Some(100.0));
        assert!((broker.cash_balance() - 99_000.0).abs() < 1e-9);

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "AAPL");
        assert_eq!(positions[0].quantity, 10.0);
        assert_eq!(positions[0].avg_entry_price, 100.0);
    }

    #[tokio::test]
    async fn sell_to_zero_removes_position() {
        let broker = PaperBroker::new(10_000.0);
        broker.connect().await.unwrap();
        broker
            .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 5.0, None)
            .await
            .unwrap();
        broker
            .submit_order("AAPL", OrderSide::Sell, OrderType::Market, 5.0, None)
            .await
            .unwrap();
        assert!(broker.get_positions().await.unwrap().is_empty());
        assert!((broker.cash_balance() - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_buy_fills_when_price_crosses() {
        let broker = PaperBroker::new(10_000.0);
        broker.connect().await.unwrap();
        broker.pin_price("ZZZT", 50.0);

        let order = broker
            .submit_order("ZZZT", OrderSide::Buy, OrderType::Limit, 2.0, Some(40.0))
            .await
            .unwrap();
        assert_eq!(order.status, "pending");

        // Still above the limit: untouched.
        let fetched = broker.get_order(&order.id).await.unwrap();
        assert_eq!(fetched.status, "pending");

        broker.pin_price("ZZZT", 39.0);
        let fetched = broker.get_order(&order.id).await.unwrap();
        assert_eq!(fetched.status, "filled");
        assert_eq!(fetched.avg_fill_price, Some(39.0));
    }

    #[tokio::test]
    async fn limit_order_without_price_is_rejected() {
        let broker = PaperBroker::new(10_000.0);
        broker.connect().await.unwrap();
        let err = broker
            .submit_order("AAPL", OrderSide::Buy, OrderType::Limit, 1.0, None)
            .await
            .unwrap_err();
        assert!(err.message.contains("price required"));
    }

    #[tokio::test]
    async fn quotes_carry_bid_ask_spread() {
        let broker = PaperBroker::new(10_000.0);
        broker.connect().await.unwrap();
        let quote = broker.get_market_data("AAPL").await.unwrap();
        assert_eq!(quote.price, 100.0);
        assert!(quote.bid < quote.price);
        assert!(quote.ask > quote.price);
    }

    #[tokio::test]
    async fn historical_bars_are_deterministic() {
        let broker = PaperBroker::new(10_000.0);
        let start = Utc::now() - Duration::days(30);
        let a = broker
            .get_historical_bars("AAPL", start, None, None, Timeframe::Day)
            .await
            .unwrap();
        let b = broker
            .get_historical_bars("AAPL", start, None, None, Timeframe::Day)
            .await
            .unwrap();
        assert_eq!(a.len(), b.len());
        assert!(a.len() >= 30);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.close, y.close);
            assert!(x.high >= x.close && x.low <= x.close);
        }
    }

    #[test]
    fn next_open_skips_weekends() {
        // Saturday 2026-01-03 12:00 UTC -> Monday 2026-01-05 09:30 ET.
        let after = Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap();
        let open = next_ny_open(after);
        let ny = open.with_timezone(&New_York);
        assert_eq!(ny.weekday(), Weekday::Mon);
        assert_eq!((ny.date_naive().day(), ny.time().format("%H:%M").to_string()), (5, "09:30".to_string()));
    }
}
