//! Shared types and OpenAPI schemas.
//!
//! This module contains the value types that flow between the device link,
//! the anomaly detector, the session manager and the backend. Wire names
//! follow the account service's camelCase JSON.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"latitude": 46.8523, "longitude": -121.7603}))]
pub struct GeoPoint {
    /// Latitude in decimal degrees.
    pub latitude: f64,

    /// Longitude in decimal degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Format as the `lat,lng` pair used in directions queries.
    #[must_use]
    pub fn to_query_pair(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

/// One decoded heart rate sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({"bpm": 82, "capturedAt": "2025-06-01T09:15:00.000Z"}))]
pub struct Reading {
    /// Heart rate in beats per minute.
    pub bpm: u16,

    /// When the frame carrying this value was decoded.
    #[serde(with = "iso_millis")]
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading captured at the given instant.
    #[must_use]
    pub const fn new(bpm: u16, captured_at: DateTime<Utc>) -> Self {
        Self { bpm, captured_at }
    }
}

/// An alert previously recorded against a hike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HikeAlert {
    /// Alert category, e.g. `"heartRate"`.
    #[serde(default)]
    pub alert_type: String,

    /// Free-form description.
    #[serde(default)]
    pub information: String,

    /// When the alert was raised. Accepts RFC 3339 text or epoch
    /// milliseconds; always serialized as ISO-8601 UTC with milliseconds.
    #[serde(with = "flexible_time")]
    pub time: DateTime<Utc>,

    /// Where the alert was raised, if known.
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

/// A hike descriptor as delivered by the account service.
///
/// Only the fields the session manager needs are typed. Everything else is
/// kept in `extra` and passed back untouched when the session is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "name": "Skyline Trail",
    "startLocation": {"latitude": 46.7860, "longitude": -121.7355},
    "finishLocation": {"latitude": 46.8052, "longitude": -121.7247},
    "alerts": []
}))]
pub struct Hike {
    /// Display name, unique per account.
    pub name: String,

    /// Trailhead.
    pub start_location: GeoPoint,

    /// Destination.
    pub finish_location: GeoPoint,

    /// Alerts recorded on earlier outings.
    #[serde(default)]
    pub alerts: Vec<HikeAlert>,

    /// Remaining account-service fields.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Hike {
    /// Create a hike with no prior alerts.
    #[must_use]
    pub fn new(name: impl Into<String>, start: GeoPoint, finish: GeoPoint) -> Self {
        Self {
            name: name.into(),
            start_location: start,
            finish_location: finish,
            alerts: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,
}

/// Format a timestamp the way every outbound payload does.
#[must_use]
pub fn to_iso_millis(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `serde` adapter for ISO-8601 UTC timestamps with millisecond precision.
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::to_iso_millis(time))
    }

    /// Deserialize any RFC 3339 timestamp.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

mod flexible_time {
    use super::{DateTime, Deserialize, Deserializer, Serializer, TimeZone, Utc};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        super::iso_millis::serialize(time, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawTime::deserialize(deserializer)? {
            RawTime::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
            RawTime::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_query_pair() {
        let point = GeoPoint::new(46.5, -121.25);
        assert_eq!(point.to_query_pair(), "46.5,-121.25");
    }

    #[test]
    fn test_reading_serialization() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 9, 15, 0).unwrap();
        let json = serde_json::to_string(&Reading::new(82, at)).unwrap();
        assert_eq!(json, r#"{"bpm":82,"capturedAt":"2025-06-01T09:15:00.000Z"}"#);
    }

    #[test]
    fn test_hike_alert_accepts_epoch_millis() {
        let json = r#"{"alertType":"heartRate","information":"high","time":1717233300000,"location":null}"#;
        let alert: HikeAlert = serde_json::from_str(json).unwrap();
        assert_eq!(
            alert.time,
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 15, 0).unwrap()
        );

        let out = serde_json::to_value(&alert).unwrap();
        assert_eq!(out["time"], "2024-06-01T09:15:00.000Z");
    }

    #[test]
    fn test_hike_alert_normalizes_offset_text() {
        let json = r#"{"alertType":"sos","information":"","time":"2024-06-01T11:15:00+02:00"}"#;
        let alert: HikeAlert = serde_json::from_str(json).unwrap();
        let out = serde_json::to_value(&alert).unwrap();
        assert_eq!(out["time"], "2024-06-01T09:15:00.000Z");
        assert!(out["location"].is_null());
    }

    #[test]
    fn test_hike_keeps_unknown_fields() {
        let json = r#"{
            "name": "Skyline Trail",
            "startLocation": {"latitude": 1.0, "longitude": 2.0},
            "finishLocation": {"latitude": 3.0, "longitude": 4.0},
            "distance": 8.9,
            "avgTemp": 14
        }"#;
        let hike: Hike = serde_json::from_str(json).unwrap();
        assert!(hike.alerts.is_empty());
        assert_eq!(hike.extra["distance"], 8.9);

        let out = serde_json::to_value(&hike).unwrap();
        assert_eq!(out["avgTemp"], 14);
        assert_eq!(out["startLocation"]["longitude"], 2.0);
    }
}
