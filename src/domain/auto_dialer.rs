//! Auto-dialer
//!
//! Admission-control loop pacing outbound calls:
//! - outside working hours it polls coarsely without dialing
//! - at the concurrency cap it polls finely
//! - otherwise it waits a random integer delay, re-checks both conditions
//!   and dials the pool entry with the fewest historical attempts
//!
//! `stop()` cancels whatever wait is pending; calls already in flight are
//! left alone.

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auto_hangup::MAX_AUTO_HANGUP_SECONDS;
use super::number_registry::NumberRegistry;
use super::shared::{normalize_number, CallAttemptId, DialerError, NumberEntry, Result};

/// Daily dialing window in local time.
/// `start == end` is always open; `start > end` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `HH:MM` bounds
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map_err(|_| DialerError::InvalidSchedule(format!("invalid time {:?}, expected HH:MM", s)))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

/// Source of the local wall-clock time
pub trait Clock: Send + Sync {
    fn local_time(&self) -> NaiveTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// What the scheduler needs from the session
#[async_trait]
pub trait CallLauncher: Send + Sync {
    /// Calls whose dialog is not yet terminal
    async fn active_call_count(&self) -> usize;

    /// Start a call; `duration_override` replaces the number's auto-hangup bounds
    async fn launch(
        &self,
        entry: NumberEntry,
        duration_override: Option<(u64, u64)>,
    ) -> Result<CallAttemptId>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    /// Wait while outside working hours
    pub outside_hours: Duration,
    /// Wait while at the concurrency cap
    pub at_capacity: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            outside_hours: Duration::from_secs(60),
            at_capacity: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pool: Vec<NumberEntry>,
    pub concurrency_cap: usize,
    pub min_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub working_hours: WorkingHours,
    pub duration_override: Option<(u64, u64)>,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.pool.is_empty() {
            return Err(DialerError::InvalidSchedule("number pool is empty".to_string()));
        }
        if self.concurrency_cap < 1 {
            return Err(DialerError::InvalidSchedule(
                "max active calls must be at least 1".to_string(),
            ));
        }
        if self.min_interval_seconds > self.max_interval_seconds {
            return Err(DialerError::InvalidSchedule(format!(
                "min interval {}s exceeds max interval {}s",
                self.min_interval_seconds, self.max_interval_seconds
            )));
        }
        if let Some((min, max)) = self.duration_override {
            if min > max {
                return Err(DialerError::InvalidSchedule(format!(
                    "min duration {}s exceeds max duration {}s",
                    min, max
                )));
            }
            check_duration(max)?;
        }
        for entry in &self.pool {
            if normalize_number(&entry.number).is_empty() {
                return Err(DialerError::InvalidSchedule(format!(
                    "{:?} is not a dialable number",
                    entry.number
                )));
            }
            for seconds in [entry.min_duration_seconds, entry.max_duration_seconds].into_iter().flatten() {
                check_duration(seconds)?;
            }
        }
        Ok(())
    }

    /// Pool numbers in the form calls are placed and counted under
    fn normalize_pool(&mut self) {
        for entry in &mut self.pool {
            entry.number = normalize_number(&entry.number);
        }
    }
}

fn check_duration(seconds: u64) -> Result<()> {
    if seconds > MAX_AUTO_HANGUP_SECONDS {
        return Err(DialerError::InvalidSchedule(format!(
            "call duration {}s exceeds the {}s limit",
            seconds, MAX_AUTO_HANGUP_SECONDS
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DialerStatus {
    Stopped,
    OutsideWorkingHours,
    AtCapacity { active: usize, cap: usize },
    NextCallIn { seconds: u64 },
    Calling { number: String },
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AutoDialer {
    launcher: Arc<dyn CallLauncher>,
    registry: Arc<dyn NumberRegistry>,
    clock: Arc<dyn Clock>,
    polls: PollIntervals,
    running: Mutex<Option<Running>>,
    status: watch::Sender<DialerStatus>,
}

impl AutoDialer {
    pub fn new(
        launcher: Arc<dyn CallLauncher>,
        registry: Arc<dyn NumberRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_polls(launcher, registry, clock, PollIntervals::default())
    }

    pub fn with_polls(
        launcher: Arc<dyn CallLauncher>,
        registry: Arc<dyn NumberRegistry>,
        clock: Arc<dyn Clock>,
        polls: PollIntervals,
    ) -> Self {
        let (status, _) = watch::channel(DialerStatus::Stopped);
        Self {
            launcher,
            registry,
            clock,
            polls,
            running: Mutex::new(None),
            status,
        }
    }

    pub fn start(&self, mut settings: SchedulerSettings) -> Result<()> {
        settings.validate()?;
        settings.normalize_pool();

        let mut running = self
            .running
            .lock()
            .map_err(|_| DialerError::InvalidSchedule("scheduler state poisoned".to_string()))?;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(DialerError::AlreadyRunning);
        }

        info!(
            "Starting auto-dialer: {} numbers, max {} active, interval {}-{}s",
            settings.pool.len(),
            settings.concurrency_cap,
            settings.min_interval_seconds,
            settings.max_interval_seconds
        );

        let cancel = CancellationToken::new();
        let dial_loop = DialLoop {
            launcher: self.launcher.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            polls: self.polls,
            status: self.status.clone(),
            cancel: cancel.clone(),
            settings,
        };
        let task = tokio::spawn(dial_loop.run());
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop dialing. Idempotent; returns once the loop has exited.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(Running { cancel, task }) = running {
            info!("Stopping auto-dialer");
            cancel.cancel();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Auto-dialer loop ended abnormally: {}", e);
                }
            }
        }
        self.status.send_replace(DialerStatus::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.task.is_finished()))
            .unwrap_or(false)
    }

    pub fn status(&self) -> watch::Receiver<DialerStatus> {
        self.status.subscribe()
    }
}

impl Drop for AutoDialer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}

struct DialLoop {
    launcher: Arc<dyn CallLauncher>,
    registry: Arc<dyn NumberRegistry>,
    clock: Arc<dyn Clock>,
    polls: PollIntervals,
    status: watch::Sender<DialerStatus>,
    cancel: CancellationToken,
    settings: SchedulerSettings,
}

impl DialLoop {
    /// Sleep unless cancelled first; `false` means stop
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    fn publish(&self, status: DialerStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// `None` when dialing is allowed right now
    async fn blocked(&self) -> Option<(DialerStatus, Duration)> {
        if !self.settings.working_hours.contains(self.clock.local_time()) {
            return Some((DialerStatus::OutsideWorkingHours, self.polls.outside_hours));
        }
        let active = self.launcher.active_call_count().await;
        if active >= self.settings.concurrency_cap {
            return Some((
                DialerStatus::AtCapacity {
                    active,
                    cap: self.settings.concurrency_cap,
                },
                self.polls.at_capacity,
            ));
        }
        None
    }

    /// Pool entry with the fewest attempts; ties go to pool order
    async fn pick(&self) -> Option<NumberEntry> {
        let mut best: Option<(&NumberEntry, u64)> = None;
        for entry in &self.settings.pool {
            let attempts = self.registry.attempt_count(&entry.number).await;
            if best.map_or(true, |(_, fewest)| attempts < fewest) {
                best = Some((entry, attempts));
            }
        }
        best.map(|(entry, attempts)| {
            debug!("Picked {} with {} previous attempts", entry.number, attempts);
            entry.clone()
        })
    }

    async fn run(self) {
        while !self.cancel.is_cancelled() {
            if let Some((status, poll)) = self.blocked().await {
                debug!("Auto-dialer waiting: {:?}", status);
                self.publish(status);
                if !self.wait(poll).await {
                    break;
                }
                continue;
            }

            let delay = rand::thread_rng()
                .gen_range(self.settings.min_interval_seconds..=self.settings.max_interval_seconds);
            self.publish(DialerStatus::NextCallIn { seconds: delay });
            if !self.wait(Duration::from_secs(delay)).await {
                break;
            }

            // Conditions may have changed during the delay
            if self.blocked().await.is_some() || self.cancel.is_cancelled() {
                continue;
            }

            let Some(entry) = self.pick().await else {
                continue;
            };
            self.publish(DialerStatus::Calling {
                number: entry.number.clone(),
            });
            let number = entry.number.clone();
            match self.launcher.launch(entry, self.settings.duration_override).await {
                Ok(id) => info!("Auto-dialer placed call {} to {}", id, number),
                Err(e) => warn!("Auto-dialer could not call {}: {}", number, e),
            }
        }
        self.publish(DialerStatus::Stopped);
        debug!("Auto-dialer loop exited");
    }
}
