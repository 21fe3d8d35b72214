// Location data model
// Raw/filtered coordinates and the update delivered for a tracked entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single position fix, either raw from a source or emitted by the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
    /// Altitude in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Heading in degrees clockwise from north
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Ground speed in m/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl Coordinate {
    /// Create a fix with no altitude, heading or speed.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: DateTime<Utc>) -> Self {
        Coordinate {
            latitude,
            longitude,
            accuracy,
            timestamp,
            altitude: None,
            heading: None,
            speed: None,
        }
    }
}

/// A filtered fix for one entity, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub entity_id: String,
    pub coordinate: Coordinate,
    /// Battery level in [0, 1] if the device reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    /// Creation time of the update
    pub timestamp: DateTime<Utc>,
}
