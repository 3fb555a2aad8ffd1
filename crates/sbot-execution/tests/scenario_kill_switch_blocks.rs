//! Global execution gates: kill switch and the trading-enabled toggle.
//! Kept in its own test binary because the gates are process-wide.

use std::sync::Arc;

use sbot_broker::Broker;
use sbot_broker_paper::PaperBroker;
use sbot_execution::{
    set_global_kill_switch, set_global_trading_enabled, ExecutionConfig, ExecutionError,
    OrderExecutionService,
};
use sbot_schemas::{OrderSide, OrderType};
use sbot_testkit::MemStorage;

#[tokio::test]
async fn kill_switch_and_trading_toggle_block_submissions() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    let storage = Arc::new(MemStorage::new());
    let service =
        OrderExecutionService::new(broker, storage.clone(), ExecutionConfig::default());

    set_global_kill_switch(true);
    let err = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("kill switch active");
    assert!(matches!(err, ExecutionError::Validation(_)));
    assert!(err.message().contains("kill switch"));
    set_global_kill_switch(false);

    set_global_trading_enabled(false);
    let err = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("trading disabled");
    assert!(err.message().contains("Trading is disabled"));
    set_global_trading_enabled(true);

    assert_eq!(storage.order_count(), 0);

    // Gates cleared: the submission goes through.
    service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect("gates cleared");
    assert_eq!(storage.order_count(), 1);
}
