//! Auto-hangup timer
//!
//! Each established call may get a randomized lifetime. The timer is a plain
//! deadline; the call actor awaits [`AutoHangupTimer::expired`] as one of its
//! `select!` branches, so dropping the actor cancels the timer.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Duration, Instant};

/// Longest auto-hangup duration accepted for a call
pub const MAX_AUTO_HANGUP_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoHangupConfig {
    pub enabled: bool,
    pub min_seconds: u64,
    pub max_seconds: u64,
}

impl Default for AutoHangupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_seconds: 180,
            max_seconds: 240,
        }
    }
}

impl AutoHangupConfig {
    /// Bounds for one call; per-number overrides win when present
    pub fn bounds_for(&self, min_override: Option<u64>, max_override: Option<u64>) -> (u64, u64) {
        let min = min_override.filter(|&v| v > 0).unwrap_or(self.min_seconds);
        let max = max_override.filter(|&v| v > 0).unwrap_or(self.max_seconds);
        (min.min(max), min.max(max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoHangupTimer {
    duration: Duration,
    deadline: Instant,
}

impl AutoHangupTimer {
    /// Arm with a uniformly random duration in `[min, max]` seconds,
    /// millisecond granularity. Bounds are capped at
    /// [`MAX_AUTO_HANGUP_SECONDS`].
    pub fn schedule(min_seconds: u64, max_seconds: u64) -> Self {
        let min_seconds = min_seconds.min(MAX_AUTO_HANGUP_SECONDS);
        let max_seconds = max_seconds.min(MAX_AUTO_HANGUP_SECONDS);
        let (lo, hi) = (min_seconds.min(max_seconds), min_seconds.max(max_seconds));
        let millis = rand::thread_rng().gen_range(lo.saturating_mul(1000)..=hi.saturating_mul(1000));
        Self::with_duration(Duration::from_millis(millis))
    }

    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration,
            deadline: Instant::now() + duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whole seconds left, rounded down
    pub fn remaining_seconds(&self) -> u64 {
        remaining_seconds_until(self.deadline)
    }

    /// Completes when the deadline passes
    pub async fn expired(&self) {
        sleep_until(self.deadline).await
    }
}

pub fn remaining_seconds_until(deadline: Instant) -> u64 {
    deadline.saturating_duration_since(Instant::now()).as_secs()
}
