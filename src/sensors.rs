//! Sensor table and extraction
//!
//! Maps the designated packet of a snapshot to named sensor readings using a
//! fixed field index per sensor. The indices are the controller's own
//! numbering and are not discoverable from the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use utoipa::ToSchema;

use crate::error::AppError;
use crate::snapshot::{FieldValue, Snapshot};

/// Substituted when a configured field index is absent from the packet
pub const NOT_AVAILABLE: &str = "N/A";

/// Unit appended to temperature readings
pub const TEMPERATURE_UNIT: &str = "°C";

/// How a sensor's value is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Degrees Celsius, suffixed with the unit
    Temperature,
    /// Raw numeric status (pump, relay), shown as-is
    Status,
}

/// Dashboard column a sensor is listed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    Left,
    Right,
}

/// Background band for a rendered value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ColorBand {
    Green,
    Orange,
    Neutral,
    /// No value to judge (missing field or nothing cached yet)
    Unavailable,
}

/// Threshold rule deriving a colour band from a numeric value
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ColorRule {
    #[default]
    None,
    /// Green above `good_above`, orange from `warn_from`, neutral below
    AboveIsGood { good_above: f64, warn_from: f64 },
    /// Green below `good_below`, neutral otherwise
    BelowIsGood { good_below: f64 },
}

impl ColorRule {
    pub fn band(&self, value: f64, available: bool) -> ColorBand {
        if !available {
            return ColorBand::Unavailable;
        }

        match *self {
            ColorRule::None => ColorBand::Neutral,
            ColorRule::AboveIsGood {
                good_above,
                warn_from,
            } => {
                if value > good_above {
                    ColorBand::Green
                } else if value >= warn_from {
                    ColorBand::Orange
                } else {
                    ColorBand::Neutral
                }
            }
            ColorRule::BelowIsGood { good_below } => {
                if value < good_below {
                    ColorBand::Green
                } else {
                    ColorBand::Neutral
                }
            }
        }
    }
}

/// One tracked sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SensorSpec {
    /// Display name (e.g., "ECS")
    pub name: String,
    /// Cache key (e.g., "ecs-temperature")
    pub key: String,
    /// Field index within the designated packet
    pub field_index: u32,
    pub kind: SensorKind,
    pub column: Column,
    #[serde(default)]
    pub color: ColorRule,
}

/// The set of tracked sensors, in display order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorTable {
    sensors: Vec<SensorSpec>,
}

impl SensorTable {
    pub fn new(sensors: Vec<SensorSpec>) -> Self {
        Self { sensors }
    }

    /// Load a table from a JSON array of sensor specs
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        let table: SensorTable = serde_json::from_str(&content)?;
        Ok(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorSpec> {
        self.sensors.iter()
    }

    pub fn by_key(&self, key: &str) -> Option<&SensorSpec> {
        self.sensors.iter().find(|s| s.key == key)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl Default for SensorTable {
    /// Sensors of the solar / pool controller
    fn default() -> Self {
        let temperature = |name: &str, key: &str, field_index, column, color| SensorSpec {
            name: name.to_string(),
            key: key.to_string(),
            field_index,
            kind: SensorKind::Temperature,
            column,
            color,
        };

        Self::new(vec![
            temperature(
                "ECS",
                "ecs-temperature",
                4,
                Column::Right,
                ColorRule::AboveIsGood {
                    good_above: 41.0,
                    warn_from: 37.0,
                },
            ),
            temperature(
                "Capteurs",
                "circuit-temperature",
                0,
                Column::Left,
                ColorRule::BelowIsGood { good_below: 100.0 },
            ),
            temperature("Tampon", "buffer-temperature", 5, Column::Right, ColorRule::None),
            temperature("Intérieur", "indoor-temperature", 11, Column::Right, ColorRule::None),
            temperature("Extérieur", "outdoor-temperature", 7, Column::Left, ColorRule::None),
            temperature("Piscine", "pool-temperature", 10, Column::Left, ColorRule::None),
        ])
    }
}

/// A sensor value taken from one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    pub name: String,
    pub key: String,
    /// Value as displayed (e.g., "45.2°C")
    pub formatted: String,
    /// Parsed value, 0.0 when the text is not a number
    pub numeric: f64,
    /// Timestamp of the packet the value came from
    pub captured_at: Option<DateTime<Utc>>,
    /// False when the sentinel was substituted for a missing field
    pub available: bool,
}

/// Extract all configured sensors from a snapshot
///
/// Returns an empty map when the designated packet is absent; callers must
/// treat that as "no data".
pub fn extract(snapshot: &Snapshot, table: &SensorTable) -> BTreeMap<String, Reading> {
    let Some(packet) = snapshot.designated_packet() else {
        return BTreeMap::new();
    };

    // Later duplicates of a field index replace earlier ones
    let fields: HashMap<u32, &FieldValue> = packet
        .field_values
        .iter()
        .map(|field| (field.field_index, field))
        .collect();

    let captured_at = epoch_to_datetime(packet.timestamp);

    table
        .iter()
        .map(|spec| {
            let reading = match fields.get(&spec.field_index) {
                Some(field) => Reading {
                    name: spec.name.clone(),
                    key: spec.key.clone(),
                    formatted: format_value(&field.value, spec.kind),
                    // NaN and infinities parse but cannot be stored as JSON numbers
                    numeric: field
                        .value
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .unwrap_or(0.0),
                    captured_at,
                    available: true,
                },
                None => Reading {
                    name: spec.name.clone(),
                    key: spec.key.clone(),
                    formatted: NOT_AVAILABLE.to_string(),
                    numeric: 0.0,
                    captured_at,
                    available: false,
                },
            };
            (spec.name.clone(), reading)
        })
        .collect()
}

fn format_value(value: &str, kind: SensorKind) -> String {
    match kind {
        SensorKind::Temperature => format!("{}{}", value, TEMPERATURE_UNIT),
        SensorKind::Status => value.to_string(),
    }
}

/// Convert fractional epoch seconds to a UTC timestamp
fn epoch_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let nanos = (seconds.fract() * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(seconds.trunc() as i64, nanos)
}
