//! Filter → SQL compiler.
//!
//! Turns a validated [`ReportFilter`] into a conjunction of parameterized
//! WHERE predicates plus the positional argument vector. Pure string/number
//! work with no database handle, so the whole compiler is unit-tested offline.
//!
//! Radius search is two-stage: a coarse lat/lon bounding box that the
//! `(geo_lat, geo_lon)` B-tree index can drive, then the exact haversine
//! great-circle distance on the remaining rows.

use chrono::{DateTime, Utc};

use crate::model::{EventType, GeoRadiusFilter, ReportFilter, Severity, SortField, SortOrder};

/// Earth radius used by the haversine formula for great-circle distance.
const EARTH_RADIUS_MILES: f64 = 3959.0;

/// Approximate miles per degree of latitude (~69 mi). Used by bounding-box
/// pre-filtering; longitude scales by cos(lat).
const MILES_PER_DEGREE_LAT: f64 = 69.0;

/// A positional SQL argument. sqlx has no heterogeneous argument bag, so the
/// compiler emits this enum and `Store` binds each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    TextArray(Vec<String>),
    Float(f64),
    Int(i64),
    Timestamp(DateTime<Utc>),
}

/// Join clauses into a WHERE fragment (empty string if no clauses).
pub fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        return String::new();
    }
    format!(" WHERE {}", clauses.join(" AND "))
}

/// Construct the WHERE clauses and args from a filter.
/// Returns the clauses, args, and the next free positional index.
pub fn build_where_clause(filter: &ReportFilter) -> (Vec<String>, Vec<SqlArg>, usize) {
    let mut where_clauses = Vec::new();
    let mut args = Vec::new();
    let mut idx = 1;

    // Time bounds (always present, required by the filter)
    where_clauses.push(format!("event_time >= ${idx}"));
    args.push(SqlArg::Timestamp(filter.time_range.from));
    idx += 1;

    where_clauses.push(format!("event_time <= ${idx}"));
    args.push(SqlArg::Timestamp(filter.time_range.to));
    idx += 1;

    // Administrative location filters
    if !filter.states.is_empty() {
        where_clauses.push(format!("location_state = ANY(${idx})"));
        args.push(SqlArg::TextArray(filter.states.clone()));
        idx += 1;
    }
    if !filter.counties.is_empty() {
        where_clauses.push(format!("location_county = ANY(${idx})"));
        args.push(SqlArg::TextArray(filter.counties.clone()));
        idx += 1;
    }

    if !filter.event_type_filters.is_empty() {
        // Per-type OR filtering: each event type can have its own
        // severity/magnitude/radius
        let (clauses, type_args, next_idx) = build_event_type_conditions(filter, idx);
        where_clauses.extend(clauses);
        args.extend(type_args);
        idx = next_idx;
    } else {
        // Simple AND filtering: global filters apply uniformly to all event types
        if !filter.event_types.is_empty() {
            where_clauses.push(format!("event_type = ANY(${idx})"));
            args.push(SqlArg::TextArray(event_type_db_values(&filter.event_types)));
            idx += 1;
        }
        if !filter.severity.is_empty() {
            where_clauses.push(format!("measurement_severity = ANY(${idx})"));
            args.push(SqlArg::TextArray(severity_db_values(&filter.severity)));
            idx += 1;
        }
        if let Some(min_mag) = filter.min_magnitude {
            where_clauses.push(format!("measurement_magnitude >= ${idx}"));
            args.push(SqlArg::Float(min_mag));
            idx += 1;
        }
        if let Some(near) = &filter.near {
            let (geo_clauses, geo_args, geo_idx) =
                build_geo_clause(near.lat, near.lon, near.radius_miles, idx);
            where_clauses.extend(geo_clauses);
            args.extend(geo_args);
            idx = geo_idx;
        }
    }

    (where_clauses, args, idx)
}

/// One event type's effective predicate inputs after merging per-type
/// overrides with the global filter values.
#[derive(Debug, Clone)]
struct TypeCondition {
    event_type: EventType,
    severity: Vec<Severity>,
    min_magnitude: Option<f64>,
    radius_miles: Option<f64>,
}

/// Merge explicit per-type overrides with unoverridden `eventTypes`.
/// For example, given eventTypes=[hail, wind], severity=[severe], and
/// eventTypeFilters=[{eventType: hail, severity: [moderate]}], this returns:
///   - hail with severity=[moderate] (overridden)
///   - wind with severity=[severe] (global default, not overridden)
fn collect_type_conditions(filter: &ReportFilter) -> Vec<TypeCondition> {
    let mut conditions =
        Vec::with_capacity(filter.event_type_filters.len() + filter.event_types.len());

    for type_filter in &filter.event_type_filters {
        // Empty per-type severity falls back to the global list.
        let severity = if type_filter.severity.is_empty() {
            filter.severity.clone()
        } else {
            type_filter.severity.clone()
        };
        conditions.push(TypeCondition {
            event_type: type_filter.event_type,
            severity,
            min_magnitude: type_filter.min_magnitude.or(filter.min_magnitude),
            radius_miles: type_filter
                .radius_miles
                .or_else(|| filter.near.as_ref().and_then(|n| n.radius_miles)),
        });
    }

    for &et in &filter.event_types {
        let overridden = filter
            .event_type_filters
            .iter()
            .any(|tf| tf.event_type == et);
        if !overridden {
            conditions.push(TypeCondition {
                event_type: et,
                severity: filter.severity.clone(),
                min_magnitude: filter.min_magnitude,
                radius_miles: filter.near.as_ref().and_then(|n| n.radius_miles),
            });
        }
    }

    conditions
}

/// The largest radius across all type conditions, or 0 if none.
fn max_radius(conditions: &[TypeCondition]) -> f64 {
    conditions
        .iter()
        .filter_map(|tc| tc.radius_miles)
        .fold(0.0, f64::max)
}

/// Build the AND-joined predicate for one event type condition.
/// Returns the parenthesized clause, its args, and the next parameter index.
fn build_single_type_condition(
    tc: &TypeCondition,
    near: Option<&GeoRadiusFilter>,
    mut idx: usize,
) -> (String, Vec<SqlArg>, usize) {
    let mut parts = Vec::new();
    let mut args = Vec::new();

    parts.push(format!("event_type = ${idx}"));
    args.push(SqlArg::Text(tc.event_type.as_str().to_string()));
    idx += 1;

    if !tc.severity.is_empty() {
        parts.push(format!("measurement_severity = ANY(${idx})"));
        args.push(SqlArg::TextArray(severity_db_values(&tc.severity)));
        idx += 1;
    }
    if let Some(min_mag) = tc.min_magnitude {
        parts.push(format!("measurement_magnitude >= ${idx}"));
        args.push(SqlArg::Float(min_mag));
        idx += 1;
    }
    if let (Some(near), Some(radius)) = (near, tc.radius_miles) {
        let (clause, hav_args, next_idx) = build_haversine(near.lat, near.lon, radius, idx);
        parts.push(clause);
        args.extend(hav_args);
        idx = next_idx;
    }

    (format!("({})", parts.join(" AND ")), args, idx)
}

/// Build bounding-box and per-type OR clauses for `eventTypeFilters`.
fn build_event_type_conditions(
    filter: &ReportFilter,
    mut idx: usize,
) -> (Vec<String>, Vec<SqlArg>, usize) {
    let conditions = collect_type_conditions(filter);
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    // One bounding box using the max radius across all conditions, so the
    // planner can use the (geo_lat, geo_lon) index before the OR fan-out.
    if let Some(near) = &filter.near {
        let r = max_radius(&conditions);
        if r > 0.0 {
            let (bb_clause, bb_args, bb_idx) = build_bounding_box(near.lat, near.lon, r, idx);
            clauses.push(bb_clause);
            args.extend(bb_args);
            idx = bb_idx;
        }
    }

    let mut or_parts = Vec::with_capacity(conditions.len());
    for tc in &conditions {
        let (clause, tc_args, next_idx) =
            build_single_type_condition(tc, filter.near.as_ref(), idx);
        or_parts.push(clause);
        args.extend(tc_args);
        idx = next_idx;
    }
    clauses.push(format!("({})", or_parts.join(" OR ")));

    (clauses, args, idx)
}

/// Bounding box + haversine clauses for a single radius filter.
fn build_geo_clause(
    lat: f64,
    lon: f64,
    radius_miles: Option<f64>,
    idx: usize,
) -> (Vec<String>, Vec<SqlArg>, usize) {
    let Some(radius) = radius_miles else {
        return (Vec::new(), Vec::new(), idx);
    };
    let (bb_clause, bb_args, bb_idx) = build_bounding_box(lat, lon, radius, idx);
    let (hav_clause, hav_args, next_idx) = build_haversine(lat, lon, radius, bb_idx);

    let mut args = bb_args;
    args.extend(hav_args);
    (vec![bb_clause, hav_clause], args, next_idx)
}

/// Coarse lat/lon rectangle around the search point, sized so it always
/// contains the radius disc. Four arguments.
fn build_bounding_box(
    lat: f64,
    lon: f64,
    radius_miles: f64,
    idx: usize,
) -> (String, Vec<SqlArg>, usize) {
    let lat_delta = radius_miles / MILES_PER_DEGREE_LAT;
    let lon_delta = radius_miles / (MILES_PER_DEGREE_LAT * (lat * std::f64::consts::PI / 180.0).cos());
    let clause = format!(
        "geo_lat BETWEEN ${} AND ${} AND geo_lon BETWEEN ${} AND ${}",
        idx,
        idx + 1,
        idx + 2,
        idx + 3
    );
    let args = vec![
        SqlArg::Float(lat - lat_delta),
        SqlArg::Float(lat + lat_delta),
        SqlArg::Float(lon - lon_delta),
        SqlArg::Float(lon + lon_delta),
    ];
    (clause, args, idx + 4)
}

/// Exact great-circle distance predicate. Four arguments (lat bound twice).
fn build_haversine(
    lat: f64,
    lon: f64,
    radius_miles: f64,
    idx: usize,
) -> (String, Vec<SqlArg>, usize) {
    let clause = format!(
        "({EARTH_RADIUS_MILES} * acos(\
            cos(radians(${})) * cos(radians(geo_lat)) * \
            cos(radians(geo_lon) - radians(${})) + \
            sin(radians(${})) * sin(radians(geo_lat))\
        )) <= ${}",
        idx,
        idx + 1,
        idx + 2,
        idx + 3
    );
    let args = vec![
        SqlArg::Float(lat),
        SqlArg::Float(lon),
        SqlArg::Float(lat),
        SqlArg::Float(radius_miles),
    ];
    (clause, args, idx + 4)
}

fn event_type_db_values(types: &[EventType]) -> Vec<String> {
    types.iter().map(|t| t.as_str().to_string()).collect()
}

fn severity_db_values(sevs: &[Severity]) -> Vec<String> {
    sevs.iter().map(|s| s.as_str().to_string()).collect()
}

/// Map a validated sort field to its column identifier.
pub fn sort_column(field: SortField) -> &'static str {
    match field {
        SortField::EventTime => "event_time",
        SortField::Magnitude => "measurement_magnitude",
        SortField::State => "location_state",
        SortField::EventType => "event_type",
    }
}

/// ORDER BY fragment. Defaults to `event_time DESC`; ascending only when
/// explicitly requested.
pub fn order_clause(filter: &ReportFilter) -> String {
    let column = filter.sort_by.map(sort_column).unwrap_or("event_time");
    let direction = match filter.sort_order {
        Some(SortOrder::Asc) => "ASC",
        _ => "DESC",
    };
    format!(" ORDER BY {column} {direction}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventTypeFilter, TimeRange};
    use proptest::prelude::*;

    fn base_filter() -> ReportFilter {
        ReportFilter {
            time_range: TimeRange {
                from: "2024-04-26T00:00:00Z".parse().unwrap(),
                to: "2024-04-27T00:00:00Z".parse().unwrap(),
            },
            states: Vec::new(),
            counties: Vec::new(),
            near: None,
            event_types: Vec::new(),
            severity: Vec::new(),
            min_magnitude: None,
            event_type_filters: Vec::new(),
            sort_by: None,
            sort_order: None,
            limit: None,
            offset: None,
        }
    }

    #[test]
    fn test_time_only() {
        let filter = base_filter();
        let (clauses, args, next_idx) = build_where_clause(&filter);

        assert_eq!(clauses.len(), 2);
        assert!(clauses[0].contains("$1"));
        assert!(clauses[1].contains("$2"));
        assert_eq!(args.len(), 2);
        assert_eq!(next_idx, 3);
    }

    #[test]
    fn test_event_types_converted_to_db_values() {
        let mut filter = base_filter();
        filter.event_types = vec![EventType::Hail, EventType::Tornado];

        let (clauses, args, next_idx) = build_where_clause(&filter);

        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[2], "event_type = ANY($3)");
        assert_eq!(
            args[2],
            SqlArg::TextArray(vec!["hail".into(), "tornado".into()])
        );
        assert_eq!(next_idx, 4);
    }

    #[test]
    fn test_all_simple_filters() {
        let mut filter = base_filter();
        filter.event_types = vec![EventType::Hail];
        filter.severity = vec![Severity::Severe];
        filter.states = vec!["TX".into(), "OK".into()];
        filter.counties = vec!["Dallas".into()];
        filter.min_magnitude = Some(1.5);

        let (clauses, args, next_idx) = build_where_clause(&filter);

        // 2 time + states + counties + eventTypes + severity + minMagnitude = 7
        assert_eq!(clauses.len(), 7);
        assert_eq!(args.len(), 7);
        assert_eq!(next_idx, 8);
    }

    #[test]
    fn test_empty_states_omitted() {
        let mut filter = base_filter();
        filter.states = Vec::new();

        let (clauses, _, _) = build_where_clause(&filter);
        assert!(!clauses.iter().any(|c| c.contains("location_state")));
    }

    #[test]
    fn test_near_radius_emits_bounding_box_then_haversine() {
        let mut filter = base_filter();
        filter.near = Some(GeoRadiusFilter {
            lat: 32.7767,
            lon: -96.797,
            radius_miles: Some(50.0),
        });

        let (clauses, args, next_idx) = build_where_clause(&filter);

        // 2 time + bounding box + haversine
        assert_eq!(clauses.len(), 4);
        assert!(clauses[2].contains("geo_lat BETWEEN $3 AND $4"));
        assert!(clauses[2].contains("geo_lon BETWEEN $5 AND $6"));
        assert!(clauses[3].contains("acos"));
        assert!(clauses[3].contains("<= $10"));
        assert_eq!(args.len(), 10);
        assert_eq!(next_idx, 11);

        // Bounding box must contain the radius disc: ±50/69 degrees latitude.
        let lat_delta = 50.0 / 69.0;
        assert_eq!(args[2], SqlArg::Float(32.7767 - lat_delta));
        assert_eq!(args[3], SqlArg::Float(32.7767 + lat_delta));
        // Haversine binds lat, lon, lat, radius.
        assert_eq!(args[6], SqlArg::Float(32.7767));
        assert_eq!(args[7], SqlArg::Float(-96.797));
        assert_eq!(args[8], SqlArg::Float(32.7767));
        assert_eq!(args[9], SqlArg::Float(50.0));
    }

    #[test]
    fn test_per_type_mode_emits_or_disjunction() {
        let mut filter = base_filter();
        filter.near = Some(GeoRadiusFilter {
            lat: 32.75,
            lon: -97.15,
            radius_miles: Some(20.0),
        });
        filter.event_type_filters = vec![
            EventTypeFilter {
                event_type: EventType::Hail,
                severity: Vec::new(),
                min_magnitude: Some(1.0),
                radius_miles: Some(50.0),
            },
            EventTypeFilter {
                event_type: EventType::Tornado,
                severity: Vec::new(),
                min_magnitude: None,
                radius_miles: Some(100.0),
            },
        ];

        let (clauses, args, _) = build_where_clause(&filter);

        // 2 time + bounding box + one OR clause
        assert_eq!(clauses.len(), 4);
        // Bounding box uses the largest per-type radius (100 mi).
        assert_eq!(args[2], SqlArg::Float(32.75 - 100.0 / 69.0));
        let or = &clauses[3];
        assert!(or.starts_with('('));
        assert!(or.contains(" OR "));
        assert_eq!(or.matches("event_type = $").count(), 2);
        assert_eq!(or.matches("acos").count(), 2);
    }

    #[test]
    fn test_per_type_unlisted_type_carries_globals() {
        // wind appears only in eventTypes, so it joins the OR with the
        // global severity and magnitude.
        let mut filter = base_filter();
        filter.event_types = vec![EventType::Hail, EventType::Wind];
        filter.severity = vec![Severity::Severe];
        filter.min_magnitude = Some(2.0);
        filter.event_type_filters = vec![EventTypeFilter {
            event_type: EventType::Hail,
            severity: vec![Severity::Moderate],
            min_magnitude: None,
            radius_miles: None,
        }];

        let conditions = collect_type_conditions(&filter);
        assert_eq!(conditions.len(), 2);

        let hail = &conditions[0];
        assert_eq!(hail.event_type, EventType::Hail);
        assert_eq!(hail.severity, vec![Severity::Moderate]);
        assert_eq!(hail.min_magnitude, Some(2.0)); // global fallback

        let wind = &conditions[1];
        assert_eq!(wind.event_type, EventType::Wind);
        assert_eq!(wind.severity, vec![Severity::Severe]);
        assert_eq!(wind.min_magnitude, Some(2.0));
    }

    #[test]
    fn test_per_type_empty_severity_falls_back_to_global() {
        // A type listed in both eventTypes and eventTypeFilters with no
        // per-type severity still gets the global severity predicate.
        let mut filter = base_filter();
        filter.event_types = vec![EventType::Hail];
        filter.severity = vec![Severity::Severe, Severity::Extreme];
        filter.event_type_filters = vec![EventTypeFilter {
            event_type: EventType::Hail,
            severity: Vec::new(),
            min_magnitude: None,
            radius_miles: None,
        }];

        let conditions = collect_type_conditions(&filter);
        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].severity,
            vec![Severity::Severe, Severity::Extreme]
        );

        let (clauses, _, _) = build_where_clause(&filter);
        assert!(clauses[2].contains("measurement_severity = ANY("));
    }

    #[test]
    fn test_per_type_zero_radius_skips_bounding_box() {
        let mut filter = base_filter();
        filter.near = Some(GeoRadiusFilter {
            lat: 32.75,
            lon: -97.15,
            radius_miles: Some(0.0),
        });
        filter.event_type_filters = vec![EventTypeFilter {
            event_type: EventType::Hail,
            severity: Vec::new(),
            min_magnitude: None,
            radius_miles: Some(0.0),
        }];

        let (clauses, _, _) = build_where_clause(&filter);

        assert!(!clauses.iter().any(|c| c.contains("BETWEEN")));
        // The per-type haversine predicate is still emitted.
        assert!(clauses.iter().any(|c| c.contains("acos")));
    }

    #[test]
    fn test_per_type_radius_falls_back_to_near_radius() {
        let mut filter = base_filter();
        filter.near = Some(GeoRadiusFilter {
            lat: 32.75,
            lon: -97.15,
            radius_miles: Some(20.0),
        });
        filter.event_type_filters = vec![EventTypeFilter {
            event_type: EventType::Wind,
            severity: Vec::new(),
            min_magnitude: None,
            radius_miles: None,
        }];

        let conditions = collect_type_conditions(&filter);
        assert_eq!(conditions[0].radius_miles, Some(20.0));
    }

    #[test]
    fn test_sort_column_mapping() {
        assert_eq!(sort_column(SortField::EventTime), "event_time");
        assert_eq!(sort_column(SortField::Magnitude), "measurement_magnitude");
        assert_eq!(sort_column(SortField::State), "location_state");
        assert_eq!(sort_column(SortField::EventType), "event_type");
    }

    #[test]
    fn test_order_clause_defaults_to_event_time_desc() {
        let filter = base_filter();
        assert_eq!(order_clause(&filter), " ORDER BY event_time DESC");
    }

    #[test]
    fn test_order_clause_asc_only_when_requested() {
        let mut filter = base_filter();
        filter.sort_by = Some(SortField::Magnitude);
        filter.sort_order = Some(SortOrder::Asc);
        assert_eq!(
            order_clause(&filter),
            " ORDER BY measurement_magnitude ASC"
        );
    }

    #[test]
    fn test_where_sql_empty() {
        assert_eq!(where_sql(&[]), "");
        assert_eq!(
            where_sql(&["a = $1".to_string(), "b = $2".to_string()]),
            " WHERE a = $1 AND b = $2"
        );
    }

    // -- Placeholder bookkeeping under arbitrary filters ---------------------

    fn arb_filter() -> impl Strategy<Value = ReportFilter> {
        (
            prop::collection::vec(prop_oneof![Just(EventType::Hail), Just(EventType::Wind), Just(EventType::Tornado)], 0..3),
            prop::collection::vec(prop_oneof![Just(Severity::Minor), Just(Severity::Severe)], 0..2),
            prop::option::of(0.5f64..5.0),
            prop::option::of((25.0f64..48.0, -125.0f64..-67.0, prop::option::of(1.0f64..200.0))),
            prop::collection::vec(prop_oneof![Just(EventType::Hail), Just(EventType::Wind), Just(EventType::Tornado)], 0..3),
            prop::bool::ANY,
        )
            .prop_map(|(event_types, severity, min_mag, near, override_types, with_states)| {
                let mut filter = base_filter();
                filter.event_types = event_types;
                filter.severity = severity;
                filter.min_magnitude = min_mag;
                filter.near = near.map(|(lat, lon, radius_miles)| GeoRadiusFilter {
                    lat,
                    lon,
                    radius_miles,
                });
                let mut seen = std::collections::HashSet::new();
                filter.event_type_filters = override_types
                    .into_iter()
                    .filter(|t| seen.insert(*t))
                    .map(|event_type| EventTypeFilter {
                        event_type,
                        severity: Vec::new(),
                        min_magnitude: None,
                        radius_miles: None,
                    })
                    .collect();
                if with_states {
                    filter.states = vec!["TX".into()];
                }
                filter
            })
    }

    proptest! {
        // Every placeholder is bound exactly once and indices are the
        // contiguous range 1..next_idx.
        #[test]
        fn prop_placeholders_match_args(filter in arb_filter()) {
            let (clauses, args, next_idx) = build_where_clause(&filter);
            let sql = clauses.join(" AND ");

            prop_assert_eq!(sql.matches('$').count(), args.len());
            prop_assert_eq!(next_idx, args.len() + 1);
            for i in 1..next_idx {
                prop_assert!(
                    sql.contains(&format!("${i}")),
                    "missing placeholder ${} in {}", i, sql
                );
            }
        }

        // The latitude band of the bounding box always contains the disc:
        // a point within `r` miles can differ in latitude by at most r/69°.
        #[test]
        fn prop_bounding_box_lat_band_contains_disc(
            lat in 25.0f64..48.0,
            lon in -125.0f64..-67.0,
            r in 1.0f64..200.0,
        ) {
            let (_, args, _) = build_bounding_box(lat, lon, r, 1);
            let (low, high) = match (&args[0], &args[1]) {
                (SqlArg::Float(a), SqlArg::Float(b)) => (*a, *b),
                _ => unreachable!(),
            };
            // 1° latitude is ~69.05 mi, so r/69.0° over-covers slightly.
            let max_lat_displacement_deg = r / 69.05;
            prop_assert!(low <= lat - max_lat_displacement_deg + 1e-9);
            prop_assert!(high >= lat + max_lat_displacement_deg - 1e-9);
        }
    }
}
