//! User preferences
//!
//! Stored as JSON in the data directory and editable at runtime. Every
//! accepted change is published on a watch channel so the engine can
//! reschedule immediately.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use utoipa::ToSchema;

use crate::cache::write_atomic;
use crate::error::AppError;

/// Refresh interval used when the stored value is missing or invalid
pub const DEFAULT_REFRESH_MINUTES: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Settings {
    /// Minutes between refreshes, string-encoded (e.g., "10")
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: String,
    /// Only fetch over WiFi (or another unmetered link)
    #[serde(default)]
    pub wifi_only: bool,
    /// Whether precise timers may be used; inexact scheduling otherwise
    #[serde(default = "default_exact_timers")]
    pub exact_timers: bool,
}

fn default_refresh_rate() -> String {
    DEFAULT_REFRESH_MINUTES.to_string()
}

fn default_exact_timers() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_rate: default_refresh_rate(),
            wifi_only: false,
            exact_timers: default_exact_timers(),
        }
    }
}

impl Settings {
    /// Refresh interval in whole minutes, falling back to the default
    pub fn refresh_minutes(&self) -> u64 {
        parse_minutes(&self.refresh_rate).unwrap_or(DEFAULT_REFRESH_MINUTES)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_minutes().saturating_mul(60))
    }
}

fn parse_minutes(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|m| *m > 0)
}

/// Partial update accepted by `PUT /settings`
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SettingsUpdate {
    pub refresh_rate: Option<String>,
    pub wifi_only: Option<bool>,
    pub exact_timers: Option<bool>,
}

pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<Settings>,
    update_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from `path`, using defaults when absent or unreadable
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Invalid settings in {}: {}", path.display(), e);
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };

        tracing::info!(
            "Settings: refresh every {} min, wifi_only={}, exact_timers={}",
            settings.refresh_minutes(),
            settings.wifi_only,
            settings.exact_timers
        );

        let (tx, _) = watch::channel(settings);
        Self {
            path,
            tx,
            update_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every accepted change
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Apply a partial update, persist it and notify subscribers
    ///
    /// Returns the resulting settings. Subscribers are only notified when
    /// something actually changed.
    pub async fn update(&self, update: SettingsUpdate) -> Result<Settings, AppError> {
        let _guard = self.update_lock.lock().await;

        let mut next = self.current();
        if let Some(rate) = update.refresh_rate {
            let minutes = parse_minutes(&rate).ok_or_else(|| {
                AppError::InvalidSetting(format!(
                    "refresh_rate must be a positive number of minutes, got {:?}",
                    rate
                ))
            })?;
            next.refresh_rate = minutes.to_string();
        }
        if let Some(wifi_only) = update.wifi_only {
            next.wifi_only = wifi_only;
        }
        if let Some(exact_timers) = update.exact_timers {
            next.exact_timers = exact_timers;
        }

        if next == self.current() {
            return Ok(next);
        }

        write_atomic(&self.path, &serde_json::to_vec_pretty(&next)?).await?;
        tracing::info!(
            "Settings changed: refresh every {} min, wifi_only={}, exact_timers={}",
            next.refresh_minutes(),
            next.wifi_only,
            next.exact_timers
        );
        self.tx.send_replace(next.clone());

        Ok(next)
    }
}
