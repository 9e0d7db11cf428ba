//! Process configuration read from the environment at startup

use std::path::PathBuf;

use crate::network::Connectivity;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_VBUS_BASE_URL: &str = "https://wierde.vbus.io";
const DEFAULT_VBUS_CHANNEL: u32 = 1;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port
    pub port: u16,
    /// Directory holding settings, cache, schedule and consumer files
    pub data_dir: PathBuf,
    /// Data logger base URL
    pub vbus_base_url: String,
    /// Live data channel on the data logger
    pub vbus_channel: u32,
    /// Optional JSON file replacing the built-in sensor table
    pub sensor_table: Option<PathBuf>,
    /// Pinned connectivity; probed from sysfs when `None`
    pub connectivity: Option<Connectivity>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let connectivity = match lookup("CONNECTIVITY").as_deref() {
            None | Some("") | Some("auto") => None,
            Some(value) => match value.parse() {
                Ok(pinned) => Some(pinned),
                Err(e) => {
                    tracing::warn!("Ignoring CONNECTIVITY: {}", e);
                    None
                }
            },
        };

        Self {
            port,
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            vbus_base_url: lookup("VBUS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_VBUS_BASE_URL.to_string()),
            vbus_channel: lookup("VBUS_CHANNEL")
                .and_then(|c| c.parse().ok())
                .unwrap_or(DEFAULT_VBUS_CHANNEL),
            sensor_table: lookup("SENSOR_TABLE").map(PathBuf::from),
            connectivity,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir.join("schedule.json")
    }

    pub fn consumers_path(&self) -> PathBuf {
        self.data_dir.join("consumers.json")
    }
}
