//! Refresh scheduler
//!
//! Owns at most one pending refresh trigger. When it fires, a `Scheduled`
//! reason is sent on the engine's trigger channel; the coordinator re-arms
//! the scheduler after the resulting attempt completes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::cache::write_atomic;
use crate::coordinator::RefreshReason;

/// Timer precision actually used for the pending trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Exact,
    /// Due time rounded up to the next whole minute
    Inexact,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Armed {
        interval_secs: u64,
        due_at: DateTime<Utc>,
        precision: Precision,
    },
    /// Trigger emitted, waiting for the attempt to complete
    Firing { since: DateTime<Utc> },
}

/// What a persisted due time means at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSchedule {
    /// Nothing was persisted
    Missing,
    Overdue,
    /// Still in the future by this much
    Pending(Duration),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSchedule {
    due_at: DateTime<Utc>,
    interval_secs: u64,
}

struct Inner {
    state: SchedulerState,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm/disarm so a stale timer never fires
    generation: u64,
}

pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    triggers: mpsc::UnboundedSender<RefreshReason>,
    /// Where the due time is persisted; `None` keeps it in memory only
    path: Option<PathBuf>,
    /// Orders arm/disarm including their file writes
    op_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(triggers: mpsc::UnboundedSender<RefreshReason>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Idle,
                timer: None,
                generation: 0,
            })),
            triggers,
            path,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state.clone()
    }

    /// Cancel any pending trigger and schedule one at now + `interval`
    pub async fn arm(&self, interval: Duration, exact: bool) -> SchedulerState {
        self.arm_after(interval, interval, exact).await
    }

    /// Arm for `remaining`, reporting `interval` as the refresh period
    ///
    /// Used at boot to honour a due time persisted by a previous run.
    pub async fn resume(&self, remaining: Duration, interval: Duration, exact: bool) -> SchedulerState {
        self.arm_after(remaining, interval, exact).await
    }

    async fn arm_after(&self, delay: Duration, interval: Duration, exact: bool) -> SchedulerState {
        let _op = self.op_lock.lock().await;

        let now = Utc::now();
        let (delay, due_at, precision) = plan(now, delay, exact);
        let state = SchedulerState::Armed {
            interval_secs: interval.as_secs(),
            due_at,
            precision,
        };

        {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            inner.state = state.clone();
            inner.timer = Some(tokio::spawn(fire_after(
                self.inner.clone(),
                self.triggers.clone(),
                delay,
                inner.generation,
            )));
        }

        tracing::info!(
            "Next refresh at {} ({:?}, every {}s)",
            due_at.to_rfc3339(),
            precision,
            interval.as_secs()
        );

        self.persist(&PersistedSchedule {
            due_at,
            interval_secs: interval.as_secs(),
        })
        .await;

        state
    }

    /// Cancel any pending trigger and forget the persisted due time
    pub async fn disarm(&self) {
        let _op = self.op_lock.lock().await;

        let was_idle = {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            std::mem::replace(&mut inner.state, SchedulerState::Idle) == SchedulerState::Idle
        };

        if !was_idle {
            tracing::info!("Refresh scheduler disarmed");
        }

        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// Read the due time persisted by a previous run
    pub async fn restore(&self) -> BootSchedule {
        let Some(path) = &self.path else {
            return BootSchedule::Missing;
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => return BootSchedule::Missing,
        };

        let persisted: PersistedSchedule = match serde_json::from_str(&content) {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!("Ignoring unreadable schedule {}: {}", path.display(), e);
                return BootSchedule::Missing;
            }
        };

        match (persisted.due_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => BootSchedule::Pending(remaining),
            _ => BootSchedule::Overdue,
        }
    }

    async fn persist(&self, schedule: &PersistedSchedule) {
        let Some(path) = &self.path else {
            return;
        };

        let result = match serde_json::to_vec_pretty(schedule) {
            Ok(data) => write_atomic(path, &data).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist schedule to {}: {}", path.display(), e);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }
}

/// Work out the actual delay, due time and precision for a trigger
fn plan(now: DateTime<Utc>, delay: Duration, exact: bool) -> (Duration, DateTime<Utc>, Precision) {
    let exact_due = ChronoDuration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d));

    match exact_due {
        Some(due_at) if exact => (delay, due_at, Precision::Exact),
        Some(due_at) => {
            let rounded = round_up_to_minute(due_at);
            let delay = (rounded - now).to_std().unwrap_or(delay);
            (delay, rounded, Precision::Inexact)
        }
        None => {
            tracing::warn!(
                "Refresh deadline {}s out of range, falling back to inexact scheduling",
                delay.as_secs()
            );
            (delay, DateTime::<Utc>::MAX_UTC, Precision::Inexact)
        }
    }
}

fn round_up_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    let rem = secs.rem_euclid(60);
    if rem == 0 && t.timestamp_subsec_nanos() == 0 {
        return t;
    }
    DateTime::from_timestamp(secs - rem + 60, 0).unwrap_or(t)
}

async fn fire_after(
    inner: Arc<Mutex<Inner>>,
    triggers: mpsc::UnboundedSender<RefreshReason>,
    delay: Duration,
    generation: u64,
) {
    tokio::time::sleep(delay).await;

    {
        let mut inner = inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.state = SchedulerState::Firing { since: Utc::now() };
        inner.timer = None;
    }

    tracing::debug!("Refresh trigger fired");
    if triggers.send(RefreshReason::Scheduled).is_err() {
        tracing::debug!("Trigger channel closed, dropping scheduled refresh");
    }
}
