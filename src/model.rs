//! Domain model for storm reports.
//!
//! The wire and in-memory representation is nested (`geo`, `measurement`,
//! `location`); flattening to storage columns happens in the `db` module.
//! Enums are closed sets: parsing accepts any casing, the canonical form is
//! lowercase, and unknown values are rejected at the boundary.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error for a value outside one of the closed enum sets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownEnumValue {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Stable lowercase wire/DB value.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownEnumValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($wire => Ok(Self::$variant),)+
                    _ => Err(UnknownEnumValue { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(EventType, "event type", {
    Hail => "hail",
    Wind => "wind",
    Tornado => "tornado",
});

wire_enum!(MeasurementUnit, "measurement unit", {
    Inches => "in",
    Mph => "mph",
    FScale => "f_scale",
});

wire_enum!(Severity, "severity", {
    Minor => "minor",
    Moderate => "moderate",
    Severe => "severe",
    Extreme => "extreme",
});

wire_enum!(SortField, "sort field", {
    EventTime => "event_time",
    Magnitude => "magnitude",
    State => "state",
    EventType => "event_type",
});

wire_enum!(SortOrder, "sort order", {
    Asc => "asc",
    Desc => "desc",
});

impl EventType {
    /// The measurement unit mandated for this event type:
    /// hail is reported in inches, wind in mph, tornadoes on the F-scale.
    pub fn unit(self) -> MeasurementUnit {
        match self {
            EventType::Hail => MeasurementUnit::Inches,
            EventType::Wind => MeasurementUnit::Mph,
            EventType::Tornado => MeasurementUnit::FScale,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// WGS-84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// The numeric reading attached to a report. Units depend on the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Measurement {
    pub magnitude: f64,
    pub unit: MeasurementUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

/// Textual location: the raw report text plus parsed name/state/county and
/// an optional offset from the named place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    pub raw: String,
    pub name: String,
    pub state: String,
    pub county: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// A single severe-weather observation. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StormReport {
    pub id: String,
    pub event_type: EventType,
    pub geo: GeoPoint,
    pub measurement: Measurement,
    pub event_time: DateTime<Utc>,
    pub location: Location,
    pub comments: String,
    pub source_office: String,
    /// `event_time` truncated to the hour; the `byHour` aggregation key.
    pub time_bucket: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Floor a datetime to the start of its hour.
pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

// ---------------------------------------------------------------------------
// Filter input
// ---------------------------------------------------------------------------

/// Required time window; `to` must be after `from`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Point-radius search. A missing radius defaults to
/// [`crate::query::DEFAULT_RADIUS_MILES`] during validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeoRadiusFilter {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_miles: Option<f64>,
}

/// Per-event-type override. Unspecified fields fall back to the global
/// filter values when the SQL conditions are assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeFilter {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub severity: Vec<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_magnitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_miles: Option<f64>,
}

/// Query filter for storm reports. Everything but the time range is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilter {
    pub time_range: TimeRange,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counties: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near: Option<GeoRadiusFilter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub severity: Vec<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_magnitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_type_filters: Vec<EventTypeFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

// ---------------------------------------------------------------------------
// Aggregation groups
// ---------------------------------------------------------------------------

/// The maximum reading within an event-type group. The unit is derived from
/// the event type, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MaxMeasurement {
    pub magnitude: f64,
    pub unit: MeasurementUnit,
}

/// Grouped count per event type.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeGroup {
    pub event_type: EventType,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_measurement: Option<MaxMeasurement>,
}

/// Grouped count per county within a state.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CountyGroup {
    pub county: String,
    pub count: i64,
}

/// Grouped count per state; `count` is the sum over its counties.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StateGroup {
    pub state: String,
    pub count: i64,
    pub counties: Vec<CountyGroup>,
}

/// Grouped count per hourly time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TimeGroup {
    pub bucket: DateTime<Utc>,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
