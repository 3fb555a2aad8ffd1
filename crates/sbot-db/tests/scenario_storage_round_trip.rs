//! Round-trip coverage for the Postgres storage implementation.
//!
//! Requires SBOT_DATABASE_URL; the test is a no-op when the variable is
//! absent so the suite stays runnable without a database.

use chrono::Utc;

use sbot_db::{NewOrder, NewPosition, NewTrade, PgStorage, Storage};
use sbot_schemas::{OrderSide, OrderStatus, OrderType, PositionSide, TradeType};

async fn storage() -> Option<PgStorage> {
    if std::env::var(sbot_db::ENV_DB_URL).is_err() {
        eprintln!("SBOT_DATABASE_URL not set; skipping db scenario");
        return None;
    }
    let pool = sbot_db::connect_from_env().await.expect("db connect");
    sbot_db::migrate(&pool).await.expect("db migrate");
    Some(PgStorage::new(pool))
}

#[tokio::test]
async fn order_fill_round_trip_persists_all_rows() {
    let Some(storage) = storage().await else {
        return;
    };

    let order = storage
        .create_order(NewOrder {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 10.0,
            price: None,
            strategy_id: None,
        })
        .await
        .expect("create order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.filled_quantity, 0.0);

    let mut filled = order.clone();
    filled.external_id = Some("paper-1".to_string());
    filled.status = OrderStatus::Filled;
    filled.filled_quantity = 10.0;
    filled.avg_fill_price = Some(100.0);
    filled.filled_at = Some(Utc::now());
    storage.update_order(&filled).await.expect("update order");

    let reloaded = storage
        .get_order(order.id)
        .await
        .expect("get order")
        .expect("order exists");
    assert_eq!(reloaded.status, OrderStatus::Filled);
    assert_eq!(reloaded.filled_quantity, 10.0);
    assert!(reloaded.filled_at.is_some());

    let trade = storage
        .record_trade(NewTrade {
            order_id: order.id,
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            trade_type: TradeType::Open,
            quantity: 10.0,
            price: 100.0,
            commission: 0.0,
            fees: 0.0,
            realized_pnl: None,
            strategy_id: None,
            executed_at: Utc::now(),
        })
        .await
        .expect("record trade");

    let trades = storage
        .trades_for_order(order.id)
        .await
        .expect("trades for order");
    assert!(trades.iter().any(|t| t.id == trade.id));
    let filled_sum: f64 = trades.iter().map(|t| t.quantity).sum();
    assert!((filled_sum - reloaded.filled_quantity).abs() < 1e-9);

    let position = storage
        .create_position(NewPosition {
            symbol: "AAPL".to_string(),
            side: PositionSide::Long,
            quantity: 10.0,
            avg_entry_price: 100.0,
        })
        .await
        .expect("create position");
    assert!(position.is_open);
    assert!((position.cost_basis - 1000.0).abs() < 1e-9);

    // Clean up the open position so repeated runs keep a single open row.
    let mut closed = position.clone();
    closed.is_open = false;
    closed.closed_at = Some(Utc::now());
    storage
        .update_position(&closed)
        .await
        .expect("close position");
}

#[tokio::test]
async fn config_upsert_overwrites_value() {
    let Some(storage) = storage().await else {
        return;
    };
    storage
        .upsert_config("test_key", "one", "string", Some("test row"))
        .await
        .expect("first upsert");
    storage
        .upsert_config("test_key", "two", "string", None)
        .await
        .expect("second upsert");
    let entry = storage
        .get_config("test_key")
        .await
        .expect("get config")
        .expect("entry exists");
    assert_eq!(entry.value, "two");
    assert_eq!(entry.description.as_deref(), Some("test row"));
}
