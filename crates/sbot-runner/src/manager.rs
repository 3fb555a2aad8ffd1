//! Process-wide runner manager.
//!
//! Holds at most one [`StrategyRunner`] and serializes every lifecycle
//! operation behind a single lock so start/stop/mutate calls from
//! concurrent request handlers cannot interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::{RunnerStatusReport, StrategyRunner};

#[derive(Default)]
pub struct RunnerManager {
    runner: Mutex<Option<Arc<StrategyRunner>>>,
}

impl RunnerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a runner. Stops and replaces any existing one.
    pub async fn install(&self, runner: Arc<StrategyRunner>) {
        let mut guard = self.runner.lock().await;
        if let Some(existing) = guard.take() {
            existing.stop().await;
            info!("replaced existing runner");
        }
        *guard = Some(runner);
    }

    pub async fn start(&self) -> bool {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => runner.start().await,
            None => false,
        }
    }

    pub async fn stop(&self) -> bool {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => runner.stop().await,
            None => false,
        }
    }

    pub async fn set_tick_interval(&self, interval: Duration) -> bool {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => {
                runner.set_tick_interval(interval);
                true
            }
            None => false,
        }
    }

    pub async fn set_streaming_enabled(&self, enabled: bool) -> bool {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => {
                runner.set_streaming_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub async fn remove_strategy_by_name(&self, name: &str) -> bool {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => runner.remove_strategy_by_name(name).await,
            None => false,
        }
    }

    pub async fn status_report(&self) -> Option<RunnerStatusReport> {
        let guard = self.runner.lock().await;
        match guard.as_ref() {
            Some(runner) => Some(runner.status_report().await),
            None => None,
        }
    }
}
