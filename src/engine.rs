//! Engine wiring
//!
//! Builds the coordinator, scheduler and consumer registry, runs the trigger
//! loop and exposes the operations the HTTP layer needs.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::cache::{CacheEntry, CacheStore, CachedValue};
use crate::config::AppConfig;
use crate::consumers::{self, ConsumerRegistry};
use crate::coordinator::{Coordinator, RefreshEvent, RefreshReason};
use crate::datasource::{DataSource, VbusDataSource};
use crate::error::AppError;
use crate::network::{ConnectivityProbe, FixedConnectivity, SysfsConnectivity};
use crate::scheduler::{BootSchedule, Scheduler, SchedulerState};
use crate::sensors::SensorTable;
use crate::settings::{Settings, SettingsStore, SettingsUpdate};
use crate::vbus;
use crate::widget::{CachePolicy, DashboardView, WidgetView};

/// Everything the engine is assembled from
pub struct EngineParts {
    pub source: Arc<dyn DataSource>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub table: SensorTable,
    pub settings_path: PathBuf,
    pub cache_path: PathBuf,
    /// `None` keeps the schedule in memory only
    pub schedule_path: Option<PathBuf>,
    pub consumers_path: PathBuf,
}

pub struct Engine {
    coordinator: Arc<Coordinator>,
    consumers: Arc<ConsumerRegistry>,
    settings: Arc<SettingsStore>,
}

impl Engine {
    /// Assemble the production engine from process configuration
    pub async fn from_config(config: &AppConfig) -> Result<Arc<Self>, AppError> {
        let table = match &config.sensor_table {
            Some(path) => {
                let table = SensorTable::load(path)?;
                tracing::info!("Loaded {} sensors from {}", table.len(), path.display());
                table
            }
            None => SensorTable::default(),
        };

        let connectivity: Arc<dyn ConnectivityProbe> = match config.connectivity {
            Some(pinned) => {
                tracing::info!("Connectivity pinned to {:?}", pinned);
                Arc::new(FixedConnectivity(pinned))
            }
            None => Arc::new(SysfsConnectivity::new()),
        };

        let source = VbusDataSource::new(
            vbus::build_client()?,
            &config.vbus_base_url,
            config.vbus_channel,
        );
        tracing::info!("Live data from {}", source.url());

        Ok(Self::build(EngineParts {
            source: Arc::new(source),
            connectivity,
            table,
            settings_path: config.settings_path(),
            cache_path: config.cache_path(),
            schedule_path: Some(config.schedule_path()),
            consumers_path: config.consumers_path(),
        })
        .await)
    }

    /// Wire the components together and start the background tasks
    pub async fn build(parts: EngineParts) -> Arc<Self> {
        let settings = Arc::new(SettingsStore::open(parts.settings_path).await);
        let cache = Arc::new(CacheStore::open(parts.cache_path).await);
        let table = Arc::new(parts.table);

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(trigger_tx, parts.schedule_path));

        let consumers = Arc::new(
            ConsumerRegistry::open(parts.consumers_path, table.clone(), cache.entry().await).await,
        );

        let coordinator = Arc::new(Coordinator::new(
            parts.source,
            cache,
            parts.connectivity,
            settings.clone(),
            table,
            scheduler,
            consumers.attached(),
        ));

        // Baseline taken before the loop runs, so early updates still count as changes
        let settings_rx = settings.subscribe();
        let initial = settings_rx.borrow().clone();

        tokio::spawn(consumers::listen(consumers.clone(), coordinator.subscribe()));
        tokio::spawn(run_triggers(coordinator.clone(), trigger_rx, settings_rx, initial));

        Arc::new(Self {
            coordinator,
            consumers,
            settings,
        })
    }

    /// Restore the schedule left by the previous run
    pub async fn boot(&self) {
        if let Some((at, outcome)) = self.coordinator.cache().last_outcome().await {
            tracing::info!("Last refresh at {}: {:?}", at.to_rfc3339(), outcome);
        }

        let attached = self.consumers.count().await;
        let scheduler = self.coordinator.scheduler();

        if attached == 0 {
            tracing::info!("No widgets attached, scheduler idle");
            scheduler.disarm().await;
            return;
        }

        let settings = self.settings.current();
        match scheduler.restore().await {
            BootSchedule::Pending(remaining) => {
                tracing::info!(
                    "{} widgets attached, next refresh in {}s",
                    attached,
                    remaining.as_secs()
                );
                scheduler
                    .resume(remaining, settings.refresh_interval(), settings.exact_timers)
                    .await;
            }
            BootSchedule::Overdue | BootSchedule::Missing => {
                tracing::info!("{} widgets attached, refreshing now", attached);
                self.spawn_refresh(RefreshReason::Boot);
            }
        }
    }

    pub async fn refresh(&self) -> RefreshEvent {
        self.coordinator
            .request_refresh(RefreshReason::UserInitiated)
            .await
    }

    pub async fn entry(&self) -> Arc<CacheEntry> {
        self.coordinator.cache().entry().await
    }

    /// Last known value of one sensor by cache key
    pub async fn sensor(&self, key: &str) -> Result<CachedValue, AppError> {
        self.coordinator
            .cache()
            .get(key)
            .await
            .ok_or_else(|| AppError::SensorNotFound(key.to_string()))
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::for_interval(self.settings.current().refresh_interval())
    }

    pub async fn dashboard(&self) -> DashboardView {
        self.consumers.dashboard().await
    }

    pub fn settings(&self) -> Settings {
        self.settings.current()
    }

    /// Apply a preference change; the trigger loop reschedules and refreshes
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<Settings, AppError> {
        self.settings.update(update).await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.coordinator.scheduler().state()
    }

    pub async fn attach_widget(&self, min_width: u32, min_height: u32) -> Result<WidgetView, AppError> {
        let (view, _) = self.consumers.attach(min_width, min_height).await?;
        // The refresh re-arms once it settles
        self.spawn_refresh(RefreshReason::ConsumerAttached);
        Ok(view)
    }

    pub async fn widget(&self, id: u64) -> Result<WidgetView, AppError> {
        self.consumers.view(id).await
    }

    pub async fn resize_widget(&self, id: u64, min_width: u32, min_height: u32) -> Result<WidgetView, AppError> {
        self.consumers.resize(id, min_width, min_height).await
    }

    pub async fn detach_widget(&self, id: u64) -> Result<(), AppError> {
        self.consumers.detach(id).await?;
        // Disarms when that was the last widget
        self.coordinator.reschedule().await;
        Ok(())
    }

    fn spawn_refresh(&self, reason: RefreshReason) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.request_refresh(reason).await;
        });
    }
}

/// Turn scheduler firings and preference changes into refreshes
async fn run_triggers(
    coordinator: Arc<Coordinator>,
    mut triggers: mpsc::UnboundedReceiver<RefreshReason>,
    mut settings: watch::Receiver<Settings>,
    mut last: Settings,
) {
    loop {
        tokio::select! {
            reason = triggers.recv() => {
                let Some(reason) = reason else { break };
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.request_refresh(reason).await;
                });
            }
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = settings.borrow_and_update().clone();
                let coordinator = coordinator.clone();

                if next.refresh_minutes() != last.refresh_minutes() || next.wifi_only != last.wifi_only {
                    tokio::spawn(async move {
                        coordinator.on_settings_changed().await;
                    });
                } else if next.exact_timers != last.exact_timers {
                    tokio::spawn(async move {
                        coordinator.reschedule().await;
                    });
                }
                last = next;
            }
        }
    }

    tracing::debug!("Trigger loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RefreshStatus;
    use crate::datasource::testing::{snapshot, FakeSource};
    use crate::network::Connectivity;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(5);

    async fn engine(dir: &tempfile::TempDir, source: Arc<FakeSource>) -> Arc<Engine> {
        Engine::build(EngineParts {
            source,
            connectivity: Arc::new(FixedConnectivity(Connectivity::Wifi)),
            table: SensorTable::default(),
            settings_path: dir.path().join("settings.json"),
            cache_path: dir.path().join("cache.json"),
            schedule_path: Some(dir.path().join("schedule.json")),
            consumers_path: dir.path().join("consumers.json"),
        })
        .await
    }

    async fn next_event(events: &mut broadcast::Receiver<RefreshEvent>) -> RefreshEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("no refresh event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_refreshes_and_arms() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2"), (0, "61.0")])));
        let engine = engine(&dir, source.clone()).await;
        let mut events = engine.coordinator.subscribe();

        let view = engine.attach_widget(250, 180).await.unwrap();
        assert_eq!(view.tiles[0].value, "N/A");

        let event = next_event(&mut events).await;
        assert_eq!(event.reason, RefreshReason::ConsumerAttached);
        assert_eq!(event.status, RefreshStatus::Fresh);

        // The listener re-renders on the same broadcast
        let mut view = engine.widget(view.id).await.unwrap();
        for _ in 0..100 {
            if view.tiles[0].value != "N/A" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            view = engine.widget(view.id).await.unwrap();
        }
        assert_eq!(view.tiles[0].value, "45.2°C");
        assert_eq!(view.tiles[1].value, "61.0°C");

        for _ in 0..100 {
            if matches!(engine.scheduler_state(), SchedulerState::Armed { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            engine.scheduler_state(),
            SchedulerState::Armed { interval_secs: 600, .. }
        ));

        engine.detach_widget(view.id).await.unwrap();
        assert_eq!(engine.scheduler_state(), SchedulerState::Idle);
        assert!(!dir.path().join("schedule.json").exists());
    }

    #[tokio::test]
    async fn test_settings_change_triggers_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2")])));
        let engine = engine(&dir, source.clone()).await;
        let mut events = engine.coordinator.subscribe();

        engine
            .update_settings(SettingsUpdate {
                refresh_rate: Some("1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.reason, RefreshReason::PreferenceChanged);
        assert_eq!(source.calls(), 1);
        assert_eq!(engine.cache_policy().to_string(), "60");
    }

    #[tokio::test]
    async fn test_settings_change_before_loop_starts() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2")])));
        let engine = engine(&dir, source.clone()).await;
        let mut events = engine.coordinator.subscribe();

        // A second store and loop, so the change lands before the loop is ever polled
        let other = tempfile::tempdir().unwrap();
        let settings = SettingsStore::open(other.path().join("settings.json")).await;
        let settings_rx = settings.subscribe();
        let initial = settings_rx.borrow().clone();
        let (_trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        settings
            .update(SettingsUpdate {
                refresh_rate: Some("1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::spawn(run_triggers(engine.coordinator.clone(), trigger_rx, settings_rx, initial));

        let event = next_event(&mut events).await;
        assert_eq!(event.reason, RefreshReason::PreferenceChanged);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2")])));
        let engine = engine(&dir, source.clone()).await;
        let mut events = engine.coordinator.subscribe();

        engine.attach_widget(100, 100).await.unwrap();

        // Time only moves once everything is idle on the armed timer
        let event = loop {
            let event = events.recv().await.unwrap();
            if event.reason == RefreshReason::Scheduled {
                break event;
            }
            assert_eq!(event.reason, RefreshReason::ConsumerAttached);
        };
        assert_eq!(event.status, RefreshStatus::Fresh);
        assert_eq!(source.calls(), 2);
        assert!(matches!(
            engine.scheduler_state(),
            SchedulerState::Armed { interval_secs: 600, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_attach_and_detach_stay_armed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2")])));
        let engine = engine(&dir, source.clone()).await;

        let first = engine.attach_widget(100, 100).await.unwrap();
        let (detached, second) = tokio::join!(
            engine.detach_widget(first.id),
            engine.attach_widget(250, 180)
        );
        detached.unwrap();
        second.unwrap();

        // Any refresh settling after this point decides on the final count
        engine.refresh().await;

        assert_eq!(engine.coordinator.attached(), 1);
        assert!(matches!(
            engine.scheduler_state(),
            SchedulerState::Armed { interval_secs: 600, .. }
        ));
    }

    #[tokio::test]
    async fn test_boot_refreshes_when_overdue() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::failing());

        {
            let engine = engine(&dir, source.clone()).await;
            let mut events = engine.coordinator.subscribe();
            engine.attach_widget(100, 100).await.unwrap();
            next_event(&mut events).await;
        }

        // Replace the schedule written after that refresh with an overdue one
        let schedule = dir.path().join("schedule.json");
        for _ in 0..100 {
            if schedule.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::write(
            &schedule,
            r#"{"due_at": "2020-01-01T00:00:00Z", "interval_secs": 600}"#,
        )
        .unwrap();

        let engine = engine(&dir, source.clone()).await;
        let mut events = engine.coordinator.subscribe();
        engine.boot().await;

        let event = next_event(&mut events).await;
        assert_eq!(event.reason, RefreshReason::Boot);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_boot_without_widgets_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::serving(snapshot(&[(4, "45.2")])));
        let engine = engine(&dir, source.clone()).await;

        engine.boot().await;
        tokio::task::yield_now().await;

        assert_eq!(engine.scheduler_state(), SchedulerState::Idle);
        assert_eq!(source.calls(), 0);
    }
}
