//! Rolling-minute submission throttle.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Caps order submissions per rolling 60-second window. Uses a monotonic
/// clock so wall-time changes cannot open the gate.
pub struct SubmitThrottle {
    capacity: usize,
    recent: Mutex<VecDeque<Instant>>,
}

impl SubmitThrottle {
    pub fn new(per_minute: usize) -> Self {
        Self {
            capacity: per_minute.max(1),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a slot; false when the window is exhausted.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap();
        while let Some(front) = recent.front() {
            if now.duration_since(*front) >= WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.len() >= self.capacity {
            return false;
        }
        recent.push_back(now);
        true
    }
}
