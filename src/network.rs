//! Connectivity probing and the network policy gate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

/// Kind of link the host currently has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Offline,
    Wifi,
    Ethernet,
    /// Metered mobile data
    Cellular,
}

impl Connectivity {
    /// Links that count as WiFi for the WiFi-only preference
    pub fn is_unmetered(&self) -> bool {
        matches!(self, Connectivity::Wifi | Connectivity::Ethernet)
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, Connectivity::Offline)
    }
}

impl std::str::FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offline" => Ok(Connectivity::Offline),
            "wifi" => Ok(Connectivity::Wifi),
            "ethernet" => Ok(Connectivity::Ethernet),
            "cellular" => Ok(Connectivity::Cellular),
            other => Err(format!("unknown connectivity: {}", other)),
        }
    }
}

/// Source of the current connectivity state
pub trait ConnectivityProbe: Send + Sync {
    fn current(&self) -> Connectivity;
}

/// Always reports the same connectivity
pub struct FixedConnectivity(pub Connectivity);

impl ConnectivityProbe for FixedConnectivity {
    fn current(&self) -> Connectivity {
        self.0
    }
}

/// Reads interface state from sysfs (`/sys/class/net`)
///
/// An interface counts when its `operstate` is `up`. Interfaces with a
/// `wireless` (or `phy80211`) entry are WiFi, `wwan*` / `rmnet*` are
/// cellular, anything else except loopback is ethernet.
pub struct SysfsConnectivity {
    root: PathBuf,
}

impl SysfsConnectivity {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn classify(iface: &Path, name: &str) -> Option<Connectivity> {
        if name == "lo" {
            return None;
        }

        let state = std::fs::read_to_string(iface.join("operstate")).ok()?;
        if state.trim() != "up" {
            return None;
        }

        if iface.join("wireless").exists() || iface.join("phy80211").exists() {
            Some(Connectivity::Wifi)
        } else if name.starts_with("wwan") || name.starts_with("rmnet") {
            Some(Connectivity::Cellular)
        } else {
            Some(Connectivity::Ethernet)
        }
    }
}

impl Default for SysfsConnectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityProbe for SysfsConnectivity {
    fn current(&self) -> Connectivity {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            tracing::debug!("Cannot read {}, assuming offline", self.root.display());
            return Connectivity::Offline;
        };

        let links: Vec<Connectivity> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                Self::classify(&entry.path(), &name)
            })
            .collect();

        // Prefer an unmetered link when several are up
        [Connectivity::Wifi, Connectivity::Ethernet, Connectivity::Cellular]
            .into_iter()
            .find(|kind| links.contains(kind))
            .unwrap_or(Connectivity::Offline)
    }
}

/// Whether a fetch may run under the current preference and connectivity
pub fn fetch_allowed(wifi_only: bool, connectivity: Connectivity) -> bool {
    if wifi_only {
        connectivity.is_unmetered()
    } else {
        connectivity.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_allowed() {
        assert!(fetch_allowed(false, Connectivity::Cellular));
        assert!(fetch_allowed(false, Connectivity::Wifi));
        assert!(!fetch_allowed(false, Connectivity::Offline));

        assert!(fetch_allowed(true, Connectivity::Wifi));
        assert!(fetch_allowed(true, Connectivity::Ethernet));
        assert!(!fetch_allowed(true, Connectivity::Cellular));
        assert!(!fetch_allowed(true, Connectivity::Offline));
    }

    #[test]
    fn test_parse_connectivity() {
        assert_eq!("WiFi".parse::<Connectivity>(), Ok(Connectivity::Wifi));
        assert_eq!("cellular".parse::<Connectivity>(), Ok(Connectivity::Cellular));
        assert!("satellite".parse::<Connectivity>().is_err());
    }

    fn iface(root: &Path, name: &str, state: &str, wireless: bool) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
        if wireless {
            std::fs::create_dir_all(dir.join("wireless")).unwrap();
        }
    }

    #[test]
    fn test_sysfs_prefers_wifi() {
        let root = tempfile::tempdir().unwrap();
        iface(root.path(), "lo", "unknown", false);
        iface(root.path(), "wwan0", "up", false);
        iface(root.path(), "wlan0", "up", true);

        let probe = SysfsConnectivity::with_root(root.path());
        assert_eq!(probe.current(), Connectivity::Wifi);
    }

    #[test]
    fn test_sysfs_cellular_only() {
        let root = tempfile::tempdir().unwrap();
        iface(root.path(), "wlan0", "down", true);
        iface(root.path(), "wwan0", "up", false);

        let probe = SysfsConnectivity::with_root(root.path());
        assert_eq!(probe.current(), Connectivity::Cellular);
    }

    #[test]
    fn test_sysfs_missing_root_is_offline() {
        let probe = SysfsConnectivity::with_root("/nonexistent/sys/class/net");
        assert_eq!(probe.current(), Connectivity::Offline);
    }
}
