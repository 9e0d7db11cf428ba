//! Durable cache of last known-good sensor values
//!
//! The whole entry is stored as one JSON document. Writes go to a temporary
//! sibling file which is then renamed over the cache file, so a reader of the
//! file (or of the in-memory snapshot) sees either the previous or the new
//! entry, never a mix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::sensors::Reading;

/// Result of the last completed fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Last known value of one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CachedValue {
    /// Sensor display name
    pub name: String,
    pub formatted: String,
    pub numeric: f64,
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl From<&Reading> for CachedValue {
    fn from(reading: &Reading) -> Self {
        Self {
            name: reading.name.clone(),
            formatted: reading.formatted.clone(),
            numeric: reading.numeric,
            captured_at: reading.captured_at,
            available: reading.available,
        }
    }
}

/// Everything the cache holds, keyed by sensor cache key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CacheEntry {
    #[serde(default)]
    pub values: BTreeMap<String, CachedValue>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
}

/// File-backed cache store shared by the coordinator and all consumers
pub struct CacheStore {
    path: PathBuf,
    /// Committed entry; swapped whole after each successful write
    current: RwLock<Arc<CacheEntry>>,
    /// Serializes writers
    write_lock: Mutex<()>,
}

impl CacheStore {
    /// Open the cache at `path`, starting empty if the file is missing or unreadable
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let entry = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<CacheEntry>(&content) {
                Ok(entry) => {
                    tracing::info!(
                        "Loaded {} cached sensor values from {}",
                        entry.values.len(),
                        path.display()
                    );
                    entry
                }
                Err(e) => {
                    tracing::warn!("Ignoring unreadable cache {}: {}", path.display(), e);
                    CacheEntry::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No cache at {}, starting empty", path.display());
                CacheEntry::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read cache {}: {}", path.display(), e);
                CacheEntry::default()
            }
        };

        Self {
            path,
            current: RwLock::new(Arc::new(entry)),
            write_lock: Mutex::new(()),
        }
    }

    /// Current committed entry
    pub async fn entry(&self) -> Arc<CacheEntry> {
        self.current.read().await.clone()
    }

    /// Cached value for a sensor key, if one has ever been stored
    pub async fn get(&self, key: &str) -> Option<CachedValue> {
        self.current.read().await.values.get(key).cloned()
    }

    /// Timestamp and result of the last completed fetch attempt
    pub async fn last_outcome(&self) -> Option<(DateTime<Utc>, Outcome)> {
        let entry = self.current.read().await;
        entry.last_fetch_at.zip(entry.last_outcome)
    }

    /// Replace all values with a fresh set of readings and record a success
    pub async fn put(
        &self,
        readings: &BTreeMap<String, Reading>,
    ) -> Result<Arc<CacheEntry>, AppError> {
        let _guard = self.write_lock.lock().await;

        let entry = CacheEntry {
            values: readings
                .values()
                .map(|reading| (reading.key.clone(), CachedValue::from(reading)))
                .collect(),
            last_fetch_at: Some(Utc::now()),
            last_outcome: Some(Outcome::Success),
        };

        self.commit(entry).await
    }

    /// Record a failed attempt, keeping the previous values
    pub async fn record_failure(&self) -> Result<Arc<CacheEntry>, AppError> {
        let _guard = self.write_lock.lock().await;

        let mut entry = (*self.entry().await).clone();
        entry.last_fetch_at = Some(Utc::now());
        entry.last_outcome = Some(Outcome::Failure);

        self.commit(entry).await
    }

    /// Persist then publish. Must be called with the write lock held.
    async fn commit(&self, entry: CacheEntry) -> Result<Arc<CacheEntry>, AppError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(&entry)?).await?;

        let entry = Arc::new(entry);
        *self.current.write().await = entry.clone();
        Ok(entry)
    }
}

/// Write `data` to `path` through a temporary file and rename
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
