//! Domain data model (§3): the immutable value types that flow between
//! components. Validation happens once, at construction, so that every
//! downstream component can assume well-formed values.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single raw or derived coordinate fix. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl Coords {
    /// Build a coordinate value, rejecting out-of-range fields per §3.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Result<Self> {
        Self::with_extras(latitude, longitude, accuracy, None, None, None)
    }

    /// Full constructor with the optional fields.
    pub fn with_extras(
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        speed: Option<f64>,
        heading: Option<f64>,
        altitude: Option<f64>,
    ) -> Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoreError::InvalidInput(format!(
                "latitude {latitude} out of range [-90,90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoreError::InvalidInput(format!(
                "longitude {longitude} out of range [-180,180]"
            )));
        }
        if accuracy < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "accuracy {accuracy} must be >= 0"
            )));
        }
        if let Some(s) = speed {
            if s < 0.0 {
                return Err(CoreError::InvalidInput(format!("speed {s} must be >= 0")));
            }
        }
        if let Some(h) = heading {
            if !(0.0..360.0).contains(&h) {
                return Err(CoreError::InvalidInput(format!(
                    "heading {h} out of range [0,360)"
                )));
            }
        }
        Ok(Self {
            latitude,
            longitude,
            accuracy,
            speed,
            heading,
            altitude,
        })
    }
}

/// Recognized activity classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    Still,
    Walking,
    Running,
    OnFoot,
    InVehicle,
    OnBicycle,
    Unknown,
}

impl Default for ActivityType {
    fn default() -> Self {
        ActivityType::Unknown
    }
}

/// A classified activity reading. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub confidence: u8,
}

impl Activity {
    /// Build an activity reading, rejecting confidence outside [0,100].
    pub fn new(activity_type: ActivityType, confidence: u8) -> Result<Self> {
        if confidence > 100 {
            return Err(CoreError::InvalidInput(format!(
                "confidence {confidence} out of range [0,100]"
            )));
        }
        Ok(Self {
            activity_type,
            confidence,
        })
    }
}

/// The canonical outbound event-name set (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    Location,
    MotionChange,
    ActivityChange,
    Heartbeat,
    Schedule,
    Geofence,
    GetCurrentPosition,
}

impl EventName {
    /// String form as it appears on the wire and in the persistence policy
    /// table (§4.7); `serde`'s `camelCase` rename already produces these for
    /// every variant except `Geofence`, which matches lowercase.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Location => "location",
            EventName::MotionChange => "motionchange",
            EventName::ActivityChange => "activitychange",
            EventName::Heartbeat => "heartbeat",
            EventName::Schedule => "schedule",
            EventName::Geofence => "geofence",
            EventName::GetCurrentPosition => "getCurrentPosition",
        }
    }
}

/// A single emitted domain event. Immutable once built; copies may be
/// persisted by the `PersistentStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    pub coords: Coords,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    #[serde(rename = "is_moving", skip_serializing_if = "Option::is_none")]
    pub is_moving: Option<bool>,
    pub event: EventName,
    pub odometer: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

/// A named circular geofence (§3). Owned by `GeofenceTracker`; persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub identifier: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius: f64,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub notify_on_dwell: bool,
    pub loitering_delay_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Geofence {
    /// Validate and construct a circular geofence.
    pub fn new(
        identifier: impl Into<String>,
        center_latitude: f64,
        center_longitude: f64,
        radius: f64,
    ) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(CoreError::InvalidInput(
                "geofence identifier must not be empty".into(),
            ));
        }
        if radius <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "geofence radius {radius} must be > 0"
            )));
        }
        Ok(Self {
            identifier,
            center_latitude,
            center_longitude,
            radius,
            notify_on_entry: true,
            notify_on_exit: true,
            notify_on_dwell: false,
            loitering_delay_ms: 0,
            extras: None,
        })
    }
}

/// A named polygon geofence (§3). Inside-state is tracked transiently by
/// `GeofenceTracker`, never persisted as part of this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonGeofence {
    pub identifier: String,
    pub vertices: Vec<(f64, f64)>,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

impl PolygonGeofence {
    /// Validate and construct a polygon geofence; requires at least 3
    /// vertices, each a structurally valid lat/lng pair.
    pub fn new(identifier: impl Into<String>, vertices: Vec<(f64, f64)>) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(CoreError::InvalidInput(
                "geofence identifier must not be empty".into(),
            ));
        }
        if vertices.len() < 3 {
            return Err(CoreError::InvalidInput(format!(
                "polygon geofence needs >= 3 vertices, got {}",
                vertices.len()
            )));
        }
        for (lat, lng) in &vertices {
            if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lng) {
                return Err(CoreError::InvalidInput(format!(
                    "invalid polygon vertex ({lat}, {lng})"
                )));
            }
        }
        Ok(Self {
            identifier,
            vertices,
            notify_on_entry: true,
            notify_on_exit: true,
        })
    }
}

/// An item waiting for delivery in the persistent queue (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    pub idempotency_key: String,
    pub retry_count: u32,
    pub next_retry_at_ms: i64,
    pub created_at_ms: i64,
}

/// A queue item that exceeded `maxRetry` and was moved out of the live
/// queue (§3). Bounded to the most-recent N by `failed_at_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    #[serde(flatten)]
    pub item: QueueItem,
    pub failed_at_ms: i64,
}

/// Log severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

/// A single ring-bounded log record (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Persisted trip snapshot, survives process restarts (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripState {
    pub trip_id: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Location>,
    pub distance_meters: f64,
    pub idle_seconds: i64,
    pub max_speed_kph: f64,
    pub started: bool,
    pub ended: bool,
}

impl TripState {
    /// A fresh, not-yet-started trip record.
    pub fn new(trip_id: impl Into<String>, created_at: i64) -> Self {
        Self {
            trip_id: trip_id.into(),
            created_at,
            started_at: None,
            start_location: None,
            last_location: None,
            distance_meters: 0.0,
            idle_seconds: 0,
            max_speed_kph: 0.0,
            started: false,
            ended: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_rejects_out_of_range_latitude() {
        assert!(Coords::new(90.1, 0.0, 0.0).is_err());
        assert!(Coords::new(-90.0, 0.0, 0.0).is_ok());
    }

    #[test]
    fn coords_rejects_negative_accuracy() {
        assert!(Coords::new(0.0, 0.0, -1.0).is_err());
    }

    #[test]
    fn activity_boundary_confidence() {
        assert!(Activity::new(ActivityType::Walking, 100).is_ok());
        assert!(Activity::new(ActivityType::Walking, 101).is_err());
    }

    #[test]
    fn event_name_wire_strings_match_spec() {
        assert_eq!(EventName::Schedule.as_str(), "schedule");
        assert_eq!(EventName::GetCurrentPosition.as_str(), "getCurrentPosition");
    }

    #[test]
    fn polygon_geofence_requires_three_vertices() {
        assert!(PolygonGeofence::new("p", vec![(0.0, 0.0), (1.0, 1.0)]).is_err());
        assert!(
            PolygonGeofence::new("p", vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0)]).is_ok()
        );
    }

    #[test]
    fn geofence_requires_positive_radius() {
        assert!(Geofence::new("g", 0.0, 0.0, 0.0).is_err());
        assert!(Geofence::new("g", 0.0, 0.0, 1.0).is_ok());
    }

    #[test]
    fn dead_letter_flattens_queue_item_fields() {
        let item = QueueItem {
            id: "q1".into(),
            payload: serde_json::json!({"a": 1}),
            item_type: None,
            idempotency_key: "k1".into(),
            retry_count: 3,
            next_retry_at_ms: 0,
            created_at_ms: 0,
        };
        let dl = DeadLetter {
            item: item.clone(),
            failed_at_ms: 999,
        };
        let json = serde_json::to_value(&dl).unwrap();
        assert_eq!(json["id"], "q1");
        assert_eq!(json["failed_at_ms"], 999);
    }
}
