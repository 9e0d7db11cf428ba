//! VBus data logger integration
//!
//! Fetches the live snapshot of the solar controller from the logger's
//! download API.

use reqwest::Client;
use std::time::Duration;

use crate::error::AppError;
use crate::snapshot::Snapshot;

/// Connect and request timeout. No retry is attempted inside a fetch.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long idle connections are kept for reuse
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POOL_MAX_IDLE: usize = 5;

/// Build the HTTP client used for live fetches
pub fn build_client() -> Result<Client, AppError> {
    let client = Client::builder()
        .connect_timeout(HTTP_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE)
        .build()?;
    Ok(client)
}

/// URL of the live download endpoint for a channel
pub fn live_url(base_url: &str, channel: u32) -> String {
    format!(
        "{}/dlx/download/live?channel={}",
        base_url.trim_end_matches('/'),
        channel
    )
}

/// Fetch the current snapshot
pub async fn fetch_live(client: &Client, url: &str) -> Result<Snapshot, AppError> {
    tracing::debug!("Fetching live data from: {}", url);

    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::UpstreamStatus(status.as_u16()));
    }

    let snapshot: Snapshot = response.json().await?;

    tracing::debug!(
        "Fetched {} headersets from data logger",
        snapshot.headersets.len()
    );

    Ok(snapshot)
}
