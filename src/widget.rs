//! Widget view models
//!
//! Maps a widget's measured size to a layout and renders the tiles it shows
//! from the cache entry. Rendering never fails: missing values become
//! unavailable tiles and stale data carries a status label.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

use crate::cache::CacheEntry;
use crate::coordinator::{RefreshStatus, StaleReason};
use crate::sensors::{ColorBand, Column, SensorSpec, SensorTable, NOT_AVAILABLE};

/// Below this many dp in either dimension a widget only fits one value
pub const COMPACT_THRESHOLD_DP: u32 = 120;

/// Sensors shown on a single-value widget
const SINGLE_TILES: &[&str] = &["ecs-temperature"];

/// Sensors shown on a regular widget
const REGULAR_TILES: &[&str] = &["ecs-temperature", "circuit-temperature"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    Compact,
    Regular,
}

impl SizeCategory {
    pub fn classify(min_width: u32, min_height: u32) -> Self {
        if min_width < COMPACT_THRESHOLD_DP || min_height < COMPACT_THRESHOLD_DP {
            SizeCategory::Compact
        } else {
            SizeCategory::Regular
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LayoutVariant {
    /// One value
    Single,
    /// Tiles side by side
    Horizontal,
    /// Tiles stacked
    Vertical,
}

impl LayoutVariant {
    pub fn for_dimensions(min_width: u32, min_height: u32) -> Self {
        match SizeCategory::classify(min_width, min_height) {
            SizeCategory::Compact => LayoutVariant::Single,
            SizeCategory::Regular if min_width > min_height => LayoutVariant::Horizontal,
            SizeCategory::Regular => LayoutVariant::Vertical,
        }
    }

    /// Cache keys of the sensors this layout shows, in order
    pub fn tile_keys(&self) -> &'static [&'static str] {
        match self {
            LayoutVariant::Single => SINGLE_TILES,
            LayoutVariant::Horizontal | LayoutVariant::Vertical => REGULAR_TILES,
        }
    }
}

impl std::fmt::Display for LayoutVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutVariant::Single => write!(f, "single"),
            LayoutVariant::Horizontal => write!(f, "horizontal"),
            LayoutVariant::Vertical => write!(f, "vertical"),
        }
    }
}

/// One rendered sensor value
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Tile {
    pub label: String,
    pub key: String,
    pub value: String,
    pub band: ColorBand,
}

impl Tile {
    pub fn render(spec: &SensorSpec, entry: &CacheEntry) -> Self {
        let (value, band) = match entry.values.get(&spec.key) {
            Some(cached) => (
                cached.formatted.clone(),
                spec.color.band(cached.numeric, cached.available),
            ),
            None => (NOT_AVAILABLE.to_string(), ColorBand::Unavailable),
        };

        Self {
            label: spec.name.clone(),
            key: spec.key.clone(),
            value,
            band,
        }
    }
}

/// Label shown on a view whose data is not fresh
pub fn status_label(status: Option<RefreshStatus>) -> Option<&'static str> {
    match status? {
        RefreshStatus::Fresh => None,
        RefreshStatus::Stale(StaleReason::NoNetwork) => Some("no network"),
        RefreshStatus::Stale(StaleReason::FetchFailed) => Some("refresh failed"),
    }
}

/// Everything an attached widget displays
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct WidgetView {
    pub id: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub size: SizeCategory,
    pub layout: LayoutVariant,
    pub tiles: Vec<Tile>,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WidgetView {
    pub fn render(
        id: u64,
        min_width: u32,
        min_height: u32,
        table: &SensorTable,
        entry: &CacheEntry,
        status: Option<RefreshStatus>,
    ) -> Self {
        let layout = LayoutVariant::for_dimensions(min_width, min_height);

        // Sensors missing from a custom table are simply not shown
        let tiles = layout
            .tile_keys()
            .iter()
            .filter_map(|key| table.by_key(key))
            .map(|spec| Tile::render(spec, entry))
            .collect();

        Self {
            id,
            min_width,
            min_height,
            size: SizeCategory::classify(min_width, min_height),
            layout,
            tiles,
            status: status_label(status).map(str::to_string),
            updated_at: entry.last_fetch_at,
        }
    }
}

/// All sensors split into the two dashboard columns
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DashboardView {
    pub left: Vec<Tile>,
    pub right: Vec<Tile>,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DashboardView {
    pub fn render(table: &SensorTable, entry: &CacheEntry, status: Option<RefreshStatus>) -> Self {
        let column = |column: Column| {
            table
                .iter()
                .filter(|spec| spec.column == column)
                .map(|spec| Tile::render(spec, entry))
                .collect()
        };

        Self {
            left: column(Column::Left),
            right: column(Column::Right),
            status: status_label(status).map(str::to_string),
            updated_at: entry.last_fetch_at,
        }
    }
}

/// Value of the `x-cache-policy` header: seconds until data may change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CachePolicy(pub u64);

impl CachePolicy {
    pub fn for_interval(interval: Duration) -> Self {
        CachePolicy(interval.as_secs())
    }
}

impl std::fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
