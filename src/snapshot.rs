//! VBus live snapshot wire model
//!
//! JSON format returned by the data logger:
//! ```json
//! {
//!   "headerset_stats": {"headerset_count": 1, "min_timestamp": 1.7e9, "max_timestamp": 1.7e9},
//!   "headersets": [{
//!     "timestamp": 1.7e9,
//!     "packets": [{
//!       "header_index": 0,
//!       "timestamp": 1.7e9,
//!       "field_values": [{"field_index": 4, "raw_value": 45.2, "value": "45.2"}]
//!     }]
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Position of the packet carrying the controller readings within the first
/// headerset. Fixed by the device, not derived from the data.
pub const DESIGNATED_PACKET_INDEX: usize = 1;

/// One response from the live endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub headerset_stats: HeaderSetStats,
    #[serde(default)]
    pub headersets: Vec<HeaderSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderSetStats {
    #[serde(default)]
    pub headerset_count: u32,
    #[serde(default)]
    pub min_timestamp: f64,
    #[serde(default)]
    pub max_timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSet {
    pub timestamp: f64,
    #[serde(default)]
    pub packets: Vec<Packet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub header_index: u32,
    pub timestamp: f64,
    #[serde(default)]
    pub field_values: Vec<FieldValue>,
}

/// Atomic (index, value) pair of a packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub field_index: u32,
    pub raw_value: f64,
    pub value: String,
}

impl Snapshot {
    /// The packet holding the controller readings, if present
    pub fn designated_packet(&self) -> Option<&Packet> {
        self.headersets
            .first()
            .and_then(|set| set.packets.get(DESIGNATED_PACKET_INDEX))
    }

    /// Check that the snapshot can be handed to the extractor
    pub fn validate(&self) -> Result<(), AppError> {
        let Some(first) = self.headersets.first() else {
            return Err(AppError::MalformedSnapshot("no headersets".to_string()));
        };

        if first.packets.len() <= DESIGNATED_PACKET_INDEX {
            return Err(AppError::MalformedSnapshot(format!(
                "expected packet {} in first headerset, found {} packets",
                DESIGNATED_PACKET_INDEX,
                first.packets.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_JSON: &str = r#"{
        "headerset_stats": {"headerset_count": 1, "min_timestamp": 1718000000.0, "max_timestamp": 1718000000.0},
        "headersets": [{
            "timestamp": 1718000000.0,
            "packets": [
                {"header_index": 0, "timestamp": 1718000000.0, "field_values": []},
                {"header_index": 1, "timestamp": 1718000001.5, "field_values": [
                    {"field_index": 0, "raw_value": 61.3, "value": "61.3"},
                    {"field_index": 4, "raw_value": 45.2, "value": "45.2"}
                ]}
            ]
        }]
    }"#;

    #[test]
    fn test_parse_live_response() {
        let snapshot: Snapshot = serde_json::from_str(LIVE_JSON).unwrap();
        assert_eq!(snapshot.headerset_stats.headerset_count, 1);
        assert_eq!(snapshot.headersets.len(), 1);

        let packet = snapshot.designated_packet().unwrap();
        assert_eq!(packet.header_index, 1);
        assert_eq!(packet.field_values[1].field_index, 4);
        assert_eq!(packet.field_values[1].value, "45.2");
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_missing_stats_defaults() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"headersets": []}"#).unwrap();
        assert_eq!(snapshot.headerset_stats.headerset_count, 0);
        assert!(snapshot.designated_packet().is_none());
    }

    #[test]
    fn test_validate_rejects_incomplete() {
        let empty = Snapshot::default();
        assert!(matches!(empty.validate(), Err(AppError::MalformedSnapshot(_))));

        let one_packet: Snapshot = serde_json::from_str(
            r#"{"headersets": [{"timestamp": 1.0, "packets": [
                {"header_index": 0, "timestamp": 1.0, "field_values": []}
            ]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            one_packet.validate(),
            Err(AppError::MalformedSnapshot(_))
        ));
    }
}
