//! Refresh coordinator
//!
//! Single entry point for every refresh, whatever triggered it. Applies the
//! network policy, performs at most one fetch at a time, commits the result to
//! the cache and notifies consumers. Overlapping requests are coalesced onto
//! the fetch already in flight and receive the same event.
//!
//! The attempt itself runs on its own task, so a caller that goes away (an
//! HTTP client disconnecting, say) never abandons a fetch other requests are
//! waiting on.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use utoipa::ToSchema;

use crate::cache::{CacheEntry, CacheStore};
use crate::datasource::DataSource;
use crate::error::AppError;
use crate::network::{fetch_allowed, ConnectivityProbe};
use crate::scheduler::Scheduler;
use crate::sensors::{extract, Reading, SensorTable};
use crate::settings::SettingsStore;

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 16;

/// Why a refresh was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Scheduled,
    UserInitiated,
    PreferenceChanged,
    ConsumerAttached,
    Boot,
}

/// Why an event carries cached rather than fresh values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Fetch skipped by the network policy
    NoNetwork,
    FetchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Fresh,
    Stale(StaleReason),
}

/// Notification sent to consumers after every refresh attempt
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RefreshEvent {
    pub reason: RefreshReason,
    pub status: RefreshStatus,
    #[schema(value_type = CacheEntry)]
    pub entry: Arc<CacheEntry>,
}

/// Completion listeners of the fetch in flight; `None` when idle
type InFlight = Mutex<Option<Vec<oneshot::Sender<RefreshEvent>>>>;

pub struct Coordinator {
    source: Arc<dyn DataSource>,
    cache: Arc<CacheStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
    settings: Arc<SettingsStore>,
    table: Arc<SensorTable>,
    scheduler: Arc<Scheduler>,
    events: broadcast::Sender<RefreshEvent>,
    in_flight: InFlight,
    /// Attached consumer count published by the registry; the scheduler only
    /// runs while it is non-zero
    attached: watch::Receiver<usize>,
    /// Orders schedule decisions so the last one sees the latest count
    schedule_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn DataSource>,
        cache: Arc<CacheStore>,
        connectivity: Arc<dyn ConnectivityProbe>,
        settings: Arc<SettingsStore>,
        table: Arc<SensorTable>,
        scheduler: Arc<Scheduler>,
        attached: watch::Receiver<usize>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            cache,
            connectivity,
            settings,
            table,
            scheduler,
            events,
            in_flight: Mutex::new(None),
            attached,
            schedule_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn attached(&self) -> usize {
        *self.attached.borrow()
    }

    /// Refresh the cache and notify consumers
    ///
    /// Never fails: errors become stale events carrying the cached values.
    /// When a fetch is already running, waits for it and returns its event.
    pub async fn request_refresh(self: &Arc<Self>, reason: RefreshReason) -> RefreshEvent {
        let (tx, rx) = oneshot::channel();
        let lead = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_mut() {
                Some(listeners) => {
                    listeners.push(tx);
                    false
                }
                None => {
                    *in_flight = Some(vec![tx]);
                    true
                }
            }
        };

        if lead {
            tokio::spawn(self.clone().lead(reason));
        } else {
            tracing::debug!("Refresh in flight, coalescing {:?} request", reason);
        }

        match rx.await {
            Ok(event) => event,
            Err(_) => {
                // Only reachable when the attempt task itself was torn down
                tracing::debug!("Refresh attempt abandoned, answering from cache");
                let event = self.stale_event(reason, StaleReason::FetchFailed).await;
                let _ = self.events.send(event.clone());
                self.reschedule().await;
                event
            }
        }
    }

    /// Run one attempt and hand its event to everyone waiting on it
    async fn lead(self: Arc<Self>, reason: RefreshReason) {
        let guard = InFlightGuard {
            slot: &self.in_flight,
        };

        let event = self.attempt(reason).await;
        self.reschedule().await;

        for listener in guard.finish() {
            // Receiver gone: that caller stopped waiting
            let _ = listener.send(event.clone());
        }
        // No receivers is fine, consumers may not be listening yet
        let _ = self.events.send(event);
    }

    /// Re-arm with the current interval, or disarm when nobody is attached
    pub async fn reschedule(&self) {
        let _schedule = self.schedule_lock.lock().await;
        self.apply_schedule().await;
    }

    /// React to a preference change: restart the schedule then refresh
    pub async fn on_settings_changed(self: &Arc<Self>) -> RefreshEvent {
        {
            let _schedule = self.schedule_lock.lock().await;
            self.scheduler.disarm().await;
            self.apply_schedule().await;
        }
        self.request_refresh(RefreshReason::PreferenceChanged).await
    }

    /// Must be called with the schedule lock held
    async fn apply_schedule(&self) {
        if self.attached() == 0 {
            self.scheduler.disarm().await;
            return;
        }

        let settings = self.settings.current();
        self.scheduler
            .arm(settings.refresh_interval(), settings.exact_timers)
            .await;
    }

    async fn attempt(&self, reason: RefreshReason) -> RefreshEvent {
        let settings = self.settings.current();
        let connectivity = self.connectivity.current();

        if !fetch_allowed(settings.wifi_only, connectivity) {
            tracing::info!(
                "Skipping {:?} refresh: connectivity={:?}, wifi_only={}",
                reason,
                connectivity,
                settings.wifi_only
            );
            return self.stale_event(reason, StaleReason::NoNetwork).await;
        }

        let readings = match self.fetch().await {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!("Refresh ({:?}) failed: {}", reason, e);
                return self.failed_event(reason).await;
            }
        };

        match self.cache.put(&readings).await {
            Ok(entry) => {
                tracing::info!(
                    "Refresh ({:?}) stored {} sensor values",
                    reason,
                    entry.values.len()
                );
                RefreshEvent {
                    reason,
                    status: RefreshStatus::Fresh,
                    entry,
                }
            }
            Err(e) => {
                tracing::warn!("Failed to commit refresh ({:?}) to cache: {}", reason, e);
                self.failed_event(reason).await
            }
        }
    }

    async fn fetch(&self) -> Result<BTreeMap<String, Reading>, AppError> {
        let snapshot = self.source.fetch_snapshot().await?;
        snapshot.validate()?;

        let readings = extract(&snapshot, &self.table);
        if readings.is_empty() {
            return Err(AppError::MalformedSnapshot(
                "no sensor values extracted".to_string(),
            ));
        }
        Ok(readings)
    }

    async fn failed_event(&self, reason: RefreshReason) -> RefreshEvent {
        if let Err(e) = self.cache.record_failure().await {
            tracing::warn!("Failed to record refresh failure: {}", e);
        }
        self.stale_event(reason, StaleReason::FetchFailed).await
    }

    async fn stale_event(&self, reason: RefreshReason, stale: StaleReason) -> RefreshEvent {
        RefreshEvent {
            reason,
            status: RefreshStatus::Stale(stale),
            entry: self.cache.entry().await,
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.in_flight.lock().as_ref().map_or(0, Vec::len)
    }
}

/// Releases the in-flight slot even when the attempt task is dropped
struct InFlightGuard<'a> {
    slot: &'a InFlight,
}

impl InFlightGuard<'_> {
    /// Release the slot, handing back the listeners to notify
    fn finish(self) -> Vec<oneshot::Sender<RefreshEvent>> {
        self.slot.lock().take().unwrap_or_default()
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // Dropped listeners see a closed channel and fall back to the cache
        self.slot.lock().take();
    }
}
