//! Rolling-minute submission throttle rejects before validation runs.

use std::sync::Arc;

use sbot_broker::Broker;
use sbot_broker_paper::PaperBroker;
use sbot_execution::{ExecutionConfig, ExecutionError, OrderExecutionService};
use sbot_schemas::{OrderSide, OrderType};
use sbot_testkit::MemStorage;

#[tokio::test]
async fn second_order_in_window_is_throttled() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    let storage = Arc::new(MemStorage::new());
    let service = OrderExecutionService::new(
        broker,
        storage.clone(),
        ExecutionConfig {
            order_throttle_per_minute: 1,
            enable_budget_tracking: false,
            ..ExecutionConfig::default()
        },
    );

    service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect("first order within limit");

    let err = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("second order throttled");
    match err {
        ExecutionError::Validation(msg) => {
            assert_eq!(msg, "Order throttle exceeded: max 1 orders/minute")
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(storage.order_count(), 1);
}
