//! Market-order paper buy: the order fills immediately, a trade row is
//! appended, a long position opens and cash decreases by the notional.

use std::sync::Arc;

use sbot_broker::Broker;
use sbot_broker_paper::PaperBroker;
use sbot_db::Storage;
use sbot_execution::{ExecutionConfig, OrderExecutionService};
use sbot_schemas::{AuditEventType, OrderSide, OrderStatus, OrderType, PositionSide};
use sbot_testkit::MemStorage;

#[tokio::test]
async fn market_buy_fills_and_opens_long_position() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    let storage = Arc::new(MemStorage::new());
    let service = OrderExecutionService::new(
        broker.clone(),
        storage.clone(),
        ExecutionConfig {
            enable_budget_tracking: false,
            ..ExecutionConfig::default()
        },
    );

    let order = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 10.0, None, None)
        .await
        .expect("submit succeeds");

    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_quantity, 10.0);
    assert_eq!(order.avg_fill_price, Some(100.0));
    assert!(order.external_id.is_some());
    assert!(order.filled_at.is_some());

    let trades = storage.trades_for_order(order.id).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, 10.0);
    assert_eq!(trades[0].price, 100.0);

    let position = storage
        .get_open_position("AAPL")
        .await
        .unwrap()
        .expect("position open");
    assert_eq!(position.side, PositionSide::Long);
    assert_eq!(position.quantity, 10.0);
    assert_eq!(position.avg_entry_price, 100.0);
    assert!((position.cost_basis - 1000.0).abs() < 1e-9);

    // Cash decreased by the fill notional.
    assert!((broker.cash_balance() - 99_000.0).abs() < 1e-9);

    // Audit trail: order_created and order_filled, in that order.
    assert_eq!(storage.audit_logs_of_type(AuditEventType::OrderCreated).len(), 1);
    assert_eq!(storage.audit_logs_of_type(AuditEventType::OrderFilled).len(), 1);
    assert_eq!(
        storage
            .audit_logs_of_type(AuditEventType::PositionOpened)
            .len(),
        1
    );
}
