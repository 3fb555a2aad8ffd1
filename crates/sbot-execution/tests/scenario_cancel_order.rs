//! Cancelling a working order marks the local row and audits it; terminal
//! orders cannot be cancelled.

use std::sync::Arc;

use sbot_broker::Broker;
use sbot_broker_paper::PaperBroker;
use sbot_db::Storage;
use sbot_execution::{ExecutionConfig, ExecutionError, OrderExecutionService};
use sbot_schemas::{AuditEventType, OrderSide, OrderStatus, OrderType};
use sbot_testkit::MemStorage;

#[tokio::test]
async fn pending_limit_order_cancels_cleanly() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    broker.pin_price("ZZZT", 50.0);
    let storage = Arc::new(MemStorage::new());
    let service = OrderExecutionService::new(
        broker,
        storage.clone(),
        ExecutionConfig {
            enable_budget_tracking: false,
            ..ExecutionConfig::default()
        },
    );

    let order = service
        .submit_order("ZZZT", OrderSide::Buy, OrderType::Limit, 2.0, Some(40.0), None)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);

    let cancelled = service.cancel_order(&order).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let reloaded = storage.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, OrderStatus::Cancelled);
    assert_eq!(
        storage
            .audit_logs_of_type(AuditEventType::OrderCancelled)
            .len(),
        1
    );
    // Cancelled orders leave the reconciliation set.
    assert!(storage.get_open_orders(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn filled_order_cannot_be_cancelled() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    let storage = Arc::new(MemStorage::new());
    let service = OrderExecutionService::new(
        broker,
        storage,
        ExecutionConfig {
            enable_budget_tracking: false,
            ..ExecutionConfig::default()
        },
    );

    let order = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);

    let err = service.cancel_order(&order).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Validation(_)));
    assert!(err.message().contains("already filled"));
}
