//! Data source trait and the VBus implementation
//!
//! A data source performs one read-only fetch of the remote telemetry.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::AppError;
use crate::snapshot::Snapshot;
use crate::vbus;

/// Remote source of telemetry snapshots
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the current snapshot. Called at most once per refresh.
    async fn fetch_snapshot(&self) -> Result<Snapshot, AppError>;
}

/// Live data from a VBus data logger
pub struct VbusDataSource {
    client: Client,
    url: String,
}

impl VbusDataSource {
    pub fn new(client: Client, base_url: &str, channel: u32) -> Self {
        Self {
            client,
            url: vbus::live_url(base_url, channel),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DataSource for VbusDataSource {
    async fn fetch_snapshot(&self) -> Result<Snapshot, AppError> {
        vbus::fetch_live(&self.client, &self.url).await
    }
}
