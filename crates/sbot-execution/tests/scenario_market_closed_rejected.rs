//! Validation gate for a closed market: submission fails with a validation
//! error and no order row is persisted.

use std::sync::Arc;

use sbot_broker::Broker;
use sbot_broker_paper::PaperBroker;
use sbot_execution::{ExecutionConfig, ExecutionError, OrderExecutionService};
use sbot_schemas::{OrderSide, OrderType};
use sbot_testkit::MemStorage;

#[tokio::test]
async fn closed_market_rejects_submission_without_persisting() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    broker.set_market_open(false);
    let storage = Arc::new(MemStorage::new());
    let service =
        OrderExecutionService::new(broker, storage.clone(), ExecutionConfig::default());

    let err = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("must fail");

    match err {
        ExecutionError::Validation(msg) => assert_eq!(msg, "Market is closed"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(storage.order_count(), 0);
    assert_eq!(storage.trade_count(), 0);
}

#[tokio::test]
async fn untradable_symbol_is_rejected() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    broker.set_symbol_tradable("AAPL", false);
    let storage = Arc::new(MemStorage::new());
    let service =
        OrderExecutionService::new(broker, storage.clone(), ExecutionConfig::default());

    let err = service
        .submit_order("AAPL", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("must fail");
    match err {
        ExecutionError::Validation(msg) => assert_eq!(msg, "Symbol AAPL is not tradable"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(storage.order_count(), 0);
}

#[tokio::test]
async fn malformed_symbol_is_rejected() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.connect().await.unwrap();
    let storage = Arc::new(MemStorage::new());
    let service =
        OrderExecutionService::new(broker, storage.clone(), ExecutionConfig::default());

    let err = service
        .submit_order("123BAD$", OrderSide::Buy, OrderType::Market, 1.0, None, None)
        .await
        .expect_err("must fail");
    assert!(matches!(err, ExecutionError::Validation(_)));
    assert!(err.message().contains("Invalid symbol format"));
    assert_eq!(storage.order_count(), 0);
}
