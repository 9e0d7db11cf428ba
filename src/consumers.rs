//! Registry of attached widgets
//!
//! Registrations are persisted so the schedule can be restored after a
//! restart. Each widget keeps a rendered view that is replaced whenever a
//! refresh event arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};

use crate::cache::{write_atomic, CacheEntry, Outcome};
use crate::coordinator::{RefreshEvent, RefreshStatus, StaleReason};
use crate::error::AppError;
use crate::sensors::SensorTable;
use crate::widget::{DashboardView, WidgetView};

/// Persisted part of an attached widget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub attached_at: DateTime<Utc>,
}

struct Widgets {
    registrations: BTreeMap<u64, Registration>,
    views: BTreeMap<u64, WidgetView>,
    next_id: u64,
    /// Status of the last refresh event seen
    status: Option<RefreshStatus>,
    /// Entry the current views were rendered from
    entry: Arc<CacheEntry>,
}

impl Widgets {
    fn render(&self, registration: &Registration, table: &SensorTable) -> WidgetView {
        WidgetView::render(
            registration.id,
            registration.min_width,
            registration.min_height,
            table,
            &self.entry,
            self.status,
        )
    }
}

pub struct ConsumerRegistry {
    path: PathBuf,
    table: Arc<SensorTable>,
    widgets: RwLock<Widgets>,
    /// Attached count, published while the write lock is held
    attached: watch::Sender<usize>,
}

impl ConsumerRegistry {
    /// Load persisted registrations and render them from `entry`
    pub async fn open(path: impl Into<PathBuf>, table: Arc<SensorTable>, entry: Arc<CacheEntry>) -> Self {
        let path = path.into();

        let registrations: Vec<Registration> = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable widget registrations {}: {}", path.display(), e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        if !registrations.is_empty() {
            tracing::info!("Restored {} widget registrations", registrations.len());
        }

        let mut widgets = Widgets {
            next_id: registrations.iter().map(|r| r.id + 1).max().unwrap_or(1),
            registrations: registrations.into_iter().map(|r| (r.id, r)).collect(),
            views: BTreeMap::new(),
            status: status_from_cache(&entry),
            entry,
        };
        widgets.views = widgets
            .registrations
            .values()
            .map(|r| (r.id, widgets.render(r, &table)))
            .collect();

        let (attached, _) = watch::channel(widgets.registrations.len());
        Self {
            path,
            table,
            widgets: RwLock::new(widgets),
            attached,
        }
    }

    pub async fn count(&self) -> usize {
        self.widgets.read().await.registrations.len()
    }

    /// Receiver always holding the current attached count
    pub fn attached(&self) -> watch::Receiver<usize> {
        self.attached.subscribe()
    }

    /// Register a widget with its measured size
    pub async fn attach(&self, min_width: u32, min_height: u32) -> Result<(WidgetView, usize), AppError> {
        let mut widgets = self.widgets.write().await;

        let registration = Registration {
            id: widgets.next_id,
            min_width,
            min_height,
            attached_at: Utc::now(),
        };

        let mut registrations = widgets.registrations.clone();
        registrations.insert(registration.id, registration.clone());
        self.persist(&registrations).await?;

        widgets.next_id += 1;
        widgets.registrations = registrations;
        self.attached.send_replace(widgets.registrations.len());
        let view = widgets.render(&registration, &self.table);
        widgets.views.insert(registration.id, view.clone());

        tracing::info!(
            "Widget {} attached ({}x{} dp, {} layout)",
            registration.id,
            min_width,
            min_height,
            view.layout
        );

        Ok((view, widgets.registrations.len()))
    }

    /// Record new measured dimensions; the layout follows
    pub async fn resize(&self, id: u64, min_width: u32, min_height: u32) -> Result<WidgetView, AppError> {
        let mut widgets = self.widgets.write().await;

        let mut registrations = widgets.registrations.clone();
        let registration = registrations
            .get_mut(&id)
            .ok_or(AppError::ConsumerNotFound(id))?;
        registration.min_width = min_width;
        registration.min_height = min_height;
        let registration = registration.clone();
        self.persist(&registrations).await?;

        widgets.registrations = registrations;
        let view = widgets.render(&registration, &self.table);
        widgets.views.insert(id, view.clone());

        tracing::debug!("Widget {} resized to {}x{} dp", id, min_width, min_height);
        Ok(view)
    }

    /// Remove a widget, returning how many remain attached
    pub async fn detach(&self, id: u64) -> Result<usize, AppError> {
        let mut widgets = self.widgets.write().await;

        let mut registrations = widgets.registrations.clone();
        if registrations.remove(&id).is_none() {
            return Err(AppError::ConsumerNotFound(id));
        }
        self.persist(&registrations).await?;

        widgets.registrations = registrations;
        widgets.views.remove(&id);
        self.attached.send_replace(widgets.registrations.len());

        tracing::info!("Widget {} detached, {} remaining", id, widgets.registrations.len());
        Ok(widgets.registrations.len())
    }

    pub async fn view(&self, id: u64) -> Result<WidgetView, AppError> {
        self.widgets
            .read()
            .await
            .views
            .get(&id)
            .cloned()
            .ok_or(AppError::ConsumerNotFound(id))
    }

    pub async fn dashboard(&self) -> DashboardView {
        let widgets = self.widgets.read().await;
        DashboardView::render(&self.table, &widgets.entry, widgets.status)
    }

    /// Re-render every widget from a refresh event
    pub async fn apply(&self, event: &RefreshEvent) {
        let mut widgets = self.widgets.write().await;
        widgets.entry = event.entry.clone();
        widgets.status = Some(event.status);

        let views: BTreeMap<u64, WidgetView> = widgets
            .registrations
            .values()
            .map(|r| (r.id, widgets.render(r, &self.table)))
            .collect();
        widgets.views = views;

        tracing::debug!(
            "Updated {} widgets after {:?} refresh ({:?})",
            widgets.views.len(),
            event.reason,
            event.status
        );
    }

    async fn persist(&self, registrations: &BTreeMap<u64, Registration>) -> Result<(), AppError> {
        let list: Vec<&Registration> = registrations.values().collect();
        write_atomic(&self.path, &serde_json::to_vec_pretty(&list)?).await
    }
}

/// Status implied by the cache alone, before any event was seen
fn status_from_cache(entry: &CacheEntry) -> Option<RefreshStatus> {
    match entry.last_outcome? {
        Outcome::Success => Some(RefreshStatus::Fresh),
        Outcome::Failure => Some(RefreshStatus::Stale(StaleReason::FetchFailed)),
    }
}

/// Apply refresh events to the registry until the channel closes
pub async fn listen(registry: Arc<ConsumerRegistry>, mut events: broadcast::Receiver<RefreshEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => registry.apply(&event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Widget listener lagged, skipped {} refresh events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedValue;
    use crate::coordinator::RefreshReason;
    use crate::widget::LayoutVariant;

    fn entry_with_ecs(formatted: &str, numeric: f64) -> Arc<CacheEntry> {
        let mut entry = CacheEntry::default();
        entry.values.insert(
            "ecs-temperature".to_string(),
            CachedValue {
                name: "ECS".to_string(),
                formatted: formatted.to_string(),
                numeric,
                captured_at: None,
                available: true,
            },
        );
        entry.last_fetch_at = Some(Utc::now());
        entry.last_outcome = Some(Outcome::Success);
        Arc::new(entry)
    }

    async fn registry(dir: &tempfile::TempDir) -> ConsumerRegistry {
        ConsumerRegistry::open(
            dir.path().join("consumers.json"),
            Arc::new(SensorTable::default()),
            Arc::new(CacheEntry::default()),
        )
        .await
    }

    #[tokio::test]
    async fn test_attach_resize_detach() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;

        let (view, count) = registry.attach(110, 40).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(view.layout, LayoutVariant::Single);
        assert_eq!(view.tiles[0].value, "N/A");

        let resized = registry.resize(view.id, 250, 180).await.unwrap();
        assert_eq!(resized.layout, LayoutVariant::Horizontal);
        assert_eq!(registry.view(view.id).await.unwrap(), resized);

        assert_eq!(registry.detach(view.id).await.unwrap(), 0);
        assert!(matches!(
            registry.view(view.id).await,
            Err(AppError::ConsumerNotFound(_))
        ));
        assert!(matches!(
            registry.detach(view.id).await,
            Err(AppError::ConsumerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attached_count_published() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        let attached = registry.attached();
        assert_eq!(*attached.borrow(), 0);

        let (a, _) = registry.attach(100, 100).await.unwrap();
        let (b, _) = registry.attach(250, 180).await.unwrap();
        assert_eq!(*attached.borrow(), 2);

        registry.detach(a.id).await.unwrap();
        assert_eq!(*attached.borrow(), 1);
        registry.detach(b.id).await.unwrap();
        assert_eq!(*attached.borrow(), 0);
    }

    #[tokio::test]
    async fn test_registrations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = registry(&dir).await;
        let (a, _) = first.attach(250, 180).await.unwrap();
        let (b, _) = first.attach(100, 100).await.unwrap();
        first.detach(a.id).await.unwrap();

        let reopened = ConsumerRegistry::open(
            dir.path().join("consumers.json"),
            Arc::new(SensorTable::default()),
            entry_with_ecs("42.0°C", 42.0),
        )
        .await;
        assert_eq!(reopened.count().await, 1);

        let view = reopened.view(b.id).await.unwrap();
        assert_eq!(view.tiles[0].value, "42.0°C");

        // Ids are not reused
        let (c, _) = reopened.attach(100, 100).await.unwrap();
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn test_events_rerender_views() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        let (view, _) = registry.attach(100, 100).await.unwrap();

        registry
            .apply(&RefreshEvent {
                reason: RefreshReason::Scheduled,
                status: RefreshStatus::Stale(StaleReason::FetchFailed),
                entry: entry_with_ecs("42.0°C", 42.0),
            })
            .await;

        let view = registry.view(view.id).await.unwrap();
        assert_eq!(view.tiles[0].value, "42.0°C");
        assert_eq!(view.status.as_deref(), Some("refresh failed"));

        let dashboard = registry.dashboard().await;
        assert_eq!(dashboard.right[0].value, "42.0°C");
    }
}
