//! Field-aware query execution.
//!
//! The façade inspects the selection set and runs only the storage calls the
//! client actually asked for: the list query for `reports`/`totalCount`/
//! `hasMore`, the aggregation CTE for `aggregations.*`, and the freshness
//! probe for `meta.*`. Selected calls run concurrently; the first failure
//! cancels the siblings and surfaces as the single query error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::{AggResult, Store};
use crate::errors::AppError;
use crate::model::{EventTypeGroup, ReportFilter, StateGroup, StormReport, TimeGroup};
use crate::query::selection::Selection;
use crate::query::validate::validate_filter;

/// One typed query: the filter plus the selection over the envelope.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StormReportsQuery {
    pub filter: ReportFilter,
    /// Selection tree over the envelope fields; leaves are `null` or `{}`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub select: Selection,
}

/// Grouped counts over the filtered set.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Aggregations {
    pub total_count: i64,
    pub by_event_type: Vec<EventTypeGroup>,
    pub by_state: Vec<StateGroup>,
    pub by_hour: Vec<TimeGroup>,
}

/// Data freshness metadata.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_lag_minutes: Option<i64>,
}

/// Query response. Sections whose storage calls did not run are omitted.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports: Option<Vec<StormReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Aggregations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<QueryMeta>,
}

/// Execute the `stormReports` operation.
pub async fn storm_reports(
    store: &Store,
    mut query: StormReportsQuery,
) -> Result<Envelope, AppError> {
    validate_filter(&mut query.filter)?;
    if query.select.is_empty() {
        return Err(AppError::InvalidInput(
            "select must name at least one field".into(),
        ));
    }

    let wants_reports = query.select.any(&["reports", "totalCount", "hasMore"]);
    let wants_aggregations = query.select.contains("aggregations");
    let wants_meta = query.select.contains("meta");

    let filter = &query.filter;
    let list_fut = async {
        if wants_reports {
            store.list(filter).await.map(Some)
        } else {
            Ok(None)
        }
    };
    let agg_fut = async {
        if wants_aggregations {
            store.aggregations(filter).await.map(Some)
        } else {
            Ok(None)
        }
    };
    let meta_fut = async {
        if wants_meta {
            store.last_updated().await.map(Some)
        } else {
            Ok(None)
        }
    };

    let (listed, aggregated, freshness) = tokio::try_join!(list_fut, agg_fut, meta_fut)?;

    let mut envelope = Envelope::default();
    if let Some((reports, total_count)) = listed {
        envelope.has_more = Some(has_more(
            filter.offset.unwrap_or(0),
            reports.len(),
            total_count,
        ));
        envelope.total_count = Some(total_count);
        envelope.reports = Some(reports);
    }
    if let Some(agg) = aggregated {
        envelope.aggregations = Some(build_aggregations(agg));
    }
    if let Some(last_updated) = freshness {
        envelope.meta = Some(QueryMeta {
            last_updated,
            data_lag_minutes: last_updated.map(|t| data_lag_minutes(t, Utc::now())),
        });
    }

    Ok(envelope)
}

fn has_more(offset: i64, page_len: usize, total_count: i64) -> bool {
    offset + (page_len as i64) < total_count
}

fn data_lag_minutes(last_updated: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((now - last_updated).num_seconds() as f64 / 60.0).round() as i64
}

fn build_aggregations(agg: AggResult) -> Aggregations {
    // Every row has exactly one event type, so the per-type counts sum to
    // the cardinality of the filtered base set.
    let total_count = agg.by_event_type.iter().map(|g| g.count).sum();
    Aggregations {
        total_count,
        by_event_type: agg.by_event_type,
        by_state: agg.by_state,
        by_hour: agg.by_hour,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, MaxMeasurement, MeasurementUnit};

    #[test]
    fn test_has_more() {
        assert!(has_more(0, 20, 30));
        assert!(!has_more(0, 30, 30));
        assert!(has_more(5, 5, 11));
        assert!(!has_more(100, 0, 30));
    }

    #[test]
    fn test_data_lag_minutes_rounds() {
        let last: DateTime<Utc> = "2024-04-26T17:00:00Z".parse().unwrap();
        let now = |s: &str| s.parse::<DateTime<Utc>>().unwrap();
        assert_eq!(data_lag_minutes(last, now("2024-04-26T17:10:00Z")), 10);
        assert_eq!(data_lag_minutes(last, now("2024-04-26T17:10:31Z")), 11);
        assert_eq!(data_lag_minutes(last, now("2024-04-26T17:00:10Z")), 0);
    }

    #[test]
    fn test_build_aggregations_total_is_sum_of_type_counts() {
        let agg = AggResult {
            by_event_type: vec![
                EventTypeGroup {
                    event_type: EventType::Hail,
                    count: 10,
                    max_measurement: Some(MaxMeasurement {
                        magnitude: 2.5,
                        unit: MeasurementUnit::Inches,
                    }),
                },
                EventTypeGroup {
                    event_type: EventType::Wind,
                    count: 7,
                    max_measurement: None,
                },
            ],
            by_state: Vec::new(),
            by_hour: Vec::new(),
        };
        assert_eq!(build_aggregations(agg).total_count, 17);
    }

    #[test]
    fn test_envelope_omits_unselected_sections() {
        let envelope = Envelope {
            total_count: Some(4),
            has_more: Some(false),
            reports: Some(Vec::new()),
            aggregations: None,
            meta: None,
        };
        let v = serde_json::to_value(&envelope).unwrap();
        assert_eq!(v["totalCount"], 4);
        assert!(v.get("aggregations").is_none());
        assert!(v.get("meta").is_none());
    }
}
