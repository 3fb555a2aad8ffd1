//! Persisted runner checkpoints.
//!
//! Both blobs live in the config table and are the source of truth for
//! operator-visible counters across process restarts (best-effort: write
//! failures are logged and ignored).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sleep/resume continuity checkpoint (`runner_sleep_state`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SleepState {
    pub sleeping: bool,
    pub sleep_since: Option<DateTime<Utc>>,
    pub next_market_open_at: Option<DateTime<Utc>>,
    pub last_resume_at: Option<DateTime<Utc>>,
    pub last_catchup_at: Option<DateTime<Utc>>,
    pub resume_count: u64,
}

/// Runtime health checkpoint (`runner_runtime_state`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    pub status: String,
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
    pub broker_connected: bool,
    pub runner_thread_alive: bool,
    pub persisted_at: DateTime<Utc>,
}
