//! Wire-message parsing.
//!
//! Inbound log messages are JSON objects whose field names may be camelCase
//! or snake_case. Unknown fields are ignored; anything missing, mistyped, or
//! outside the closed enum sets is an unparseable message; the consumer
//! treats it as a poison pill.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::model::{
    truncate_to_hour, EventType, GeoPoint, Location, Measurement, MeasurementUnit, Severity,
    StormReport,
};

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unit {got} contradicts event type {event_type} (expected {expected})")]
    UnitMismatch {
        event_type: EventType,
        got: MeasurementUnit,
        expected: MeasurementUnit,
    },
}

#[derive(Debug, Deserialize)]
struct WireGeo {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct WireMeasurement {
    magnitude: f64,
    unit: MeasurementUnit,
    #[serde(default)]
    severity: Option<Severity>,
}

#[derive(Debug, Deserialize)]
struct WireLocation {
    raw: String,
    name: String,
    state: String,
    county: String,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReport {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "event_type")]
    event_type: EventType,
    geo: WireGeo,
    measurement: WireMeasurement,
    #[serde(alias = "event_time")]
    event_time: DateTime<Utc>,
    location: WireLocation,
    comments: String,
    #[serde(alias = "source_office")]
    source_office: String,
    #[serde(alias = "processed_at")]
    processed_at: DateTime<Utc>,
}

/// Parse an inbound log message into a storm report.
///
/// `timeBucket` is always recomputed from `eventTime` so the stored bucket
/// can never disagree with the event time. A missing `id` is derived from
/// the event content, so duplicates collapse either way.
pub fn parse_report(payload: &[u8]) -> Result<StormReport, MessageParseError> {
    let wire: WireReport = serde_json::from_slice(payload)?;

    let expected = wire.event_type.unit();
    if wire.measurement.unit != expected {
        return Err(MessageParseError::UnitMismatch {
            event_type: wire.event_type,
            got: wire.measurement.unit,
            expected,
        });
    }

    let geo = GeoPoint {
        lat: wire.geo.lat,
        lon: wire.geo.lon,
    };
    let id = match wire.id {
        Some(id) if !id.is_empty() => id,
        _ => content_id(
            wire.event_type,
            &wire.location.state,
            geo,
            wire.event_time,
            wire.measurement.magnitude,
        ),
    };

    Ok(StormReport {
        id,
        event_type: wire.event_type,
        geo,
        measurement: Measurement {
            magnitude: wire.measurement.magnitude,
            unit: wire.measurement.unit,
            severity: wire.measurement.severity,
        },
        event_time: wire.event_time,
        location: Location {
            raw: wire.location.raw,
            name: wire.location.name,
            state: wire.location.state,
            county: wire.location.county,
            distance: wire.location.distance,
            direction: wire.location.direction,
        },
        comments: wire.comments,
        source_office: wire.source_office,
        time_bucket: truncate_to_hour(wire.event_time),
        processed_at: wire.processed_at,
    })
}

/// Deterministic content hash: identical observations always produce the
/// same id, which is what makes the upsert path idempotent end-to-end.
pub fn content_id(
    event_type: EventType,
    state: &str,
    geo: GeoPoint,
    event_time: DateTime<Utc>,
    magnitude: f64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}",
        event_type.as_str(),
        state,
        geo.lat,
        geo.lon,
        event_time.to_rfc3339(),
        magnitude
    ));
    hex::encode(hasher.finalize())
}
