//! Flat storage row for `storm_reports`.
//!
//! The domain model stays nested in memory; this is the only place the
//! prefixed-column layout of the table appears.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::model::{
    GeoPoint, Location, Measurement, StormReport, UnknownEnumValue,
};

#[derive(Debug, Clone, FromRow)]
pub struct StormReportRow {
    pub id: String,
    pub event_type: String,
    pub geo_lat: f64,
    pub geo_lon: f64,
    pub measurement_magnitude: f64,
    pub measurement_unit: String,
    pub event_time: DateTime<Utc>,
    pub location_raw: String,
    pub location_name: String,
    pub location_distance: Option<f64>,
    pub location_direction: Option<String>,
    pub location_state: String,
    pub location_county: String,
    pub comments: String,
    pub measurement_severity: Option<String>,
    pub source_office: String,
    pub time_bucket: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl TryFrom<StormReportRow> for StormReport {
    type Error = UnknownEnumValue;

    fn try_from(row: StormReportRow) -> Result<Self, Self::Error> {
        Ok(StormReport {
            id: row.id,
            event_type: row.event_type.parse()?,
            geo: GeoPoint {
                lat: row.geo_lat,
                lon: row.geo_lon,
            },
            measurement: Measurement {
                magnitude: row.measurement_magnitude,
                unit: row.measurement_unit.parse()?,
                severity: row
                    .measurement_severity
                    .as_deref()
                    .map(str::parse)
                    .transpose()?,
            },
            event_time: row.event_time,
            location: Location {
                raw: row.location_raw,
                name: row.location_name,
                state: row.location_state,
                county: row.location_county,
                distance: row.location_distance,
                direction: row.location_direction,
            },
            comments: row.comments,
            source_office: row.source_office,
            time_bucket: row.time_bucket,
            processed_at: row.processed_at,
        })
    }
}
