//! Off-hours sleep and resume: the runner enters SLEEPING while the market
//! is closed, resumes on the open flag (woken early by the stream event),
//! bumps the resume counter and audits both transitions once.

use std::sync::Arc;
use std::time::Duration;

use sbot_broker_paper::PaperBroker;
use sbot_db::Storage;
use sbot_execution::{ExecutionConfig, OrderExecutionService};
use sbot_runner::{RunnerConfig, RunnerStatus, SleepState, StrategyRunner};
use sbot_schemas::{AuditEventType, RUNNER_SLEEP_STATE_KEY};
use sbot_strategy::BuyAndHoldStrategy;
use sbot_testkit::MemStorage;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn runner_fixture(
    broker: Arc<PaperBroker>,
    storage: Arc<MemStorage>,
) -> StrategyRunner {
    let execution = Arc::new(OrderExecutionService::new(
        broker.clone(),
        storage.clone(),
        ExecutionConfig {
            enable_budget_tracking: false,
            ..ExecutionConfig::default()
        },
    ));
    StrategyRunner::new(
        broker,
        storage,
        execution,
        RunnerConfig {
            tick_interval: Duration::from_millis(50),
            streaming_enabled: false,
        },
    )
}

#[tokio::test]
async fn closed_market_sleeps_then_resumes_on_open() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_market_open(false);
    let storage = Arc::new(MemStorage::new());
    let runner = runner_fixture(broker.clone(), storage.clone());

    runner
        .load_strategy(Box::new(BuyAndHoldStrategy::new(
            "hold",
            None,
            vec!["AAPL".to_string()],
            1.0,
        )))
        .await;
    assert!(runner.start().await);

    wait_for("runner to enter sleep", || {
        runner.status() == RunnerStatus::Sleeping
    })
    .await;

    // One sleep audit, and a persisted sleep checkpoint.
    let sleep_audits = storage.audit_logs_of_type(AuditEventType::ConfigUpdated);
    assert_eq!(
        sleep_audits
            .iter()
            .filter(|a| a.description == "Runner entered off-hours sleep mode")
            .count(),
        1
    );
    let entry = storage
        .get_config(RUNNER_SLEEP_STATE_KEY)
        .await
        .unwrap()
        .expect("sleep checkpoint persisted");
    let checkpoint: SleepState = serde_json::from_str(&entry.value).unwrap();
    assert!(checkpoint.sleeping);
    assert!(checkpoint.sleep_since.is_some());

    // Market opens; the stream wake shortcuts the off-hours wait.
    broker.set_market_open(true);
    runner.notify_stream_wake();

    wait_for("runner to resume", || {
        runner.status() == RunnerStatus::Running
    })
    .await;

    let report = runner.status_report().await;
    assert_eq!(report.resume_count, 1);
    assert!(!report.sleeping);
    let resume_audits = storage.audit_logs_of_type(AuditEventType::ConfigUpdated);
    assert_eq!(
        resume_audits
            .iter()
            .filter(|a| a.description == "Runner resumed after market open")
            .count(),
        1
    );

    assert!(runner.stop().await);
    assert_eq!(runner.status(), RunnerStatus::Stopped);
    assert!(!runner.is_loop_alive().await);
}

#[tokio::test]
async fn restored_checkpoint_carries_resume_count() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_market_open(true);
    let storage = Arc::new(MemStorage::new());

    // Simulate a prior process that went to sleep after three resumes.
    let prior = SleepState {
        sleeping: true,
        resume_count: 3,
        ..SleepState::default()
    };
    storage
        .upsert_config(
            RUNNER_SLEEP_STATE_KEY,
            &serde_json::to_string(&prior).unwrap(),
            "json",
            None,
        )
        .await
        .unwrap();

    let runner = runner_fixture(broker.clone(), storage.clone());
    runner
        .load_strategy(Box::new(BuyAndHoldStrategy::new(
            "hold",
            None,
            vec!["AAPL".to_string()],
            1.0,
        )))
        .await;
    assert!(runner.start().await);

    // The restored sleeping flag resolves into a resume on the first open
    // tick, continuing the persisted counter.
    wait_for("runner to resume from restored sleep", || {
        runner.status() == RunnerStatus::Running
    })
    .await;
    wait_for("resume counter to advance", || {
        storage
            .audit_logs_of_type(AuditEventType::ConfigUpdated)
            .iter()
            .any(|a| a.description == "Runner resumed after market open")
    })
    .await;
    let report = runner.status_report().await;
    assert_eq!(report.resume_count, 4);

    runner.stop().await;
}
