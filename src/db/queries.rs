//! Storage operations for storm reports.
//!
//! All SQL lives here. Writes are idempotent (`ON CONFLICT (id) DO NOTHING`),
//! reads share one WHERE compiler so the count, page, and aggregation queries
//! always agree on which rows are in scope. Errors are returned to the caller
//! unchanged; no retries at this layer.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::db::filter::{build_where_clause, order_clause, where_sql, SqlArg};
use crate::db::row::StormReportRow;
use crate::model::{
    CountyGroup, EventTypeGroup, MaxMeasurement, ReportFilter, StateGroup, StormReport, TimeGroup,
};
use crate::observability::observe_db_query;

const COLUMNS: &str = "id, event_type, geo_lat, geo_lon, measurement_magnitude, measurement_unit, \
    event_time, location_raw, location_name, location_distance, location_direction, \
    location_state, location_county, comments, measurement_severity, source_office, \
    time_bucket, processed_at";

const INSERT_SQL: &str = "INSERT INTO storm_reports (id, event_type, geo_lat, geo_lon, \
    measurement_magnitude, measurement_unit, event_time, location_raw, location_name, \
    location_distance, location_direction, location_state, location_county, comments, \
    measurement_severity, source_office, time_bucket, processed_at) \
    VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18) \
    ON CONFLICT (id) DO NOTHING";

/// Single-statement batch upsert: one parallel array per column, expanded
/// server-side with UNNEST. One round-trip and atomic, so a bad row fails the
/// whole batch and the caller retries it (safe, inserts are idempotent).
const BATCH_INSERT_SQL: &str = "INSERT INTO storm_reports (id, event_type, geo_lat, geo_lon, \
    measurement_magnitude, measurement_unit, event_time, location_raw, location_name, \
    location_distance, location_direction, location_state, location_county, comments, \
    measurement_severity, source_office, time_bucket, processed_at) \
    SELECT * FROM UNNEST(\
        $1::text[], $2::text[], $3::float8[], $4::float8[], $5::float8[], $6::text[], \
        $7::timestamptz[], $8::text[], $9::text[], $10::float8[], $11::text[], \
        $12::text[], $13::text[], $14::text[], $15::text[], $16::text[], \
        $17::timestamptz[], $18::timestamptz[]) \
    ON CONFLICT (id) DO NOTHING";

macro_rules! bind_sql_args {
    ($query:expr, $args:expr) => {{
        let mut q = $query;
        for arg in $args {
            q = match arg {
                SqlArg::Text(v) => q.bind(v.clone()),
                SqlArg::TextArray(v) => q.bind(v.clone()),
                SqlArg::Float(v) => q.bind(*v),
                SqlArg::Int(v) => q.bind(*v),
                SqlArg::Timestamp(v) => q.bind(*v),
            };
        }
        q
    }};
}

/// Persistence operations for storm reports backed by PostgreSQL.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

/// Combined aggregation results from the single CTE query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggResult {
    pub by_event_type: Vec<EventTypeGroup>,
    pub by_state: Vec<StateGroup>,
    pub by_hour: Vec<TimeGroup>,
}

/// One row of the UNION ALL aggregation query. The `agg` discriminator
/// routes it to the matching result slice.
#[derive(Debug, Clone, FromRow)]
struct AggRow {
    agg: String,
    key1: Option<String>,
    key2: Option<String>,
    count: i64,
    max_mag: Option<f64>,
    #[allow(dead_code)] // part of the UNION column contract, currently always NULL
    max_sev: Option<String>,
    bucket: Option<DateTime<Utc>>,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert a single storm report. IDs are deterministic content hashes,
    /// so a re-delivered event hits the conflict arm and succeeds as a no-op.
    pub async fn upsert(&self, report: &StormReport) -> Result<(), sqlx::Error> {
        let start = Instant::now();
        sqlx::query(INSERT_SQL)
            .bind(&report.id)
            .bind(report.event_type.as_str())
            .bind(report.geo.lat)
            .bind(report.geo.lon)
            .bind(report.measurement.magnitude)
            .bind(report.measurement.unit.as_str())
            .bind(report.event_time)
            .bind(&report.location.raw)
            .bind(&report.location.name)
            .bind(report.location.distance)
            .bind(&report.location.direction)
            .bind(&report.location.state)
            .bind(&report.location.county)
            .bind(&report.comments)
            .bind(report.measurement.severity.map(|s| s.as_str()))
            .bind(&report.source_office)
            .bind(report.time_bucket)
            .bind(report.processed_at)
            .execute(&self.pool)
            .await?;
        observe_db_query("insert", start);
        Ok(())
    }

    /// Batch-upsert storm reports in a single round-trip.
    pub async fn upsert_batch(&self, reports: &[StormReport]) -> Result<(), sqlx::Error> {
        if reports.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        let n = reports.len();
        let mut ids = Vec::with_capacity(n);
        let mut event_types = Vec::with_capacity(n);
        let mut lats = Vec::with_capacity(n);
        let mut lons = Vec::with_capacity(n);
        let mut magnitudes = Vec::with_capacity(n);
        let mut units = Vec::with_capacity(n);
        let mut event_times = Vec::with_capacity(n);
        let mut raws = Vec::with_capacity(n);
        let mut names = Vec::with_capacity(n);
        let mut distances = Vec::with_capacity(n);
        let mut directions = Vec::with_capacity(n);
        let mut states = Vec::with_capacity(n);
        let mut counties = Vec::with_capacity(n);
        let mut comments = Vec::with_capacity(n);
        let mut severities = Vec::with_capacity(n);
        let mut offices = Vec::with_capacity(n);
        let mut buckets = Vec::with_capacity(n);
        let mut processed = Vec::with_capacity(n);

        for r in reports {
            ids.push(r.id.clone());
            event_types.push(r.event_type.as_str().to_string());
            lats.push(r.geo.lat);
            lons.push(r.geo.lon);
            magnitudes.push(r.measurement.magnitude);
            units.push(r.measurement.unit.as_str().to_string());
            event_times.push(r.event_time);
            raws.push(r.location.raw.clone());
            names.push(r.location.name.clone());
            distances.push(r.location.distance);
            directions.push(r.location.direction.clone());
            states.push(r.location.state.clone());
            counties.push(r.location.county.clone());
            comments.push(r.comments.clone());
            severities.push(r.measurement.severity.map(|s| s.as_str().to_string()));
            offices.push(r.source_office.clone());
            buckets.push(r.time_bucket);
            processed.push(r.processed_at);
        }

        sqlx::query(BATCH_INSERT_SQL)
            .bind(ids)
            .bind(event_types)
            .bind(lats)
            .bind(lons)
            .bind(magnitudes)
            .bind(units)
            .bind(event_times)
            .bind(raws)
            .bind(names)
            .bind(distances)
            .bind(directions)
            .bind(states)
            .bind(counties)
            .bind(comments)
            .bind(severities)
            .bind(offices)
            .bind(buckets)
            .bind(processed)
            .execute(&self.pool)
            .await?;
        observe_db_query("batch_insert", start);
        Ok(())
    }

    /// Filtered, sorted, paginated reports plus the total matching count.
    pub async fn list(
        &self,
        filter: &ReportFilter,
    ) -> Result<(Vec<StormReport>, i64), sqlx::Error> {
        let start = Instant::now();
        let (count_sql, data_sql, base_args, page_args) = build_list_sql(filter);

        let total_count: i64 = bind_sql_args!(sqlx::query_scalar(&count_sql), &base_args)
            .fetch_one(&self.pool)
            .await?;

        let mut data_query = bind_sql_args!(
            sqlx::query_as::<_, StormReportRow>(&data_sql),
            &base_args
        );
        data_query = bind_sql_args!(data_query, &page_args);

        let rows = data_query.fetch_all(&self.pool).await?;
        let reports = rows
            .into_iter()
            .map(|row| StormReport::try_from(row).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .collect::<Result<Vec<_>, _>>()?;

        observe_db_query("list", start);
        Ok((reports, total_count))
    }

    /// Event type, state, and hourly aggregations in a single query.
    ///
    /// A CTE materializes the filtered base set once; three UNION ALL arms
    /// group it by event type, state/county, and hourly bucket. The `agg`
    /// discriminator column routes each row while scanning.
    pub async fn aggregations(&self, filter: &ReportFilter) -> Result<AggResult, sqlx::Error> {
        let start = Instant::now();
        let (clauses, args, _) = build_where_clause(filter);

        let query = format!(
            "WITH base AS (\
                SELECT event_type, location_state, location_county, \
                       measurement_magnitude, measurement_severity, time_bucket \
                FROM storm_reports{}\
            ) \
            SELECT 'type' AS agg, event_type AS key1, NULL AS key2, \
                   COUNT(*) AS count, MAX(measurement_magnitude) AS max_mag, \
                   NULL AS max_sev, NULL::timestamptz AS bucket \
            FROM base GROUP BY event_type \
            UNION ALL \
            SELECT 'state', location_state, location_county, COUNT(*), NULL, NULL, NULL \
            FROM base GROUP BY location_state, location_county \
            UNION ALL \
            SELECT 'hour', NULL, NULL, COUNT(*), NULL, NULL, time_bucket \
            FROM base GROUP BY time_bucket",
            where_sql(&clauses)
        );

        let rows: Vec<AggRow> = bind_sql_args!(sqlx::query_as(&query), &args)
            .fetch_all(&self.pool)
            .await?;

        let result =
            fold_aggregation_rows(rows).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        observe_db_query("aggregations", start);
        Ok(result)
    }

    /// The most recent `processed_at` across all rows, if any.
    pub async fn last_updated(&self) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let start = Instant::now();
        let t: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(processed_at) FROM storm_reports")
                .fetch_one(&self.pool)
                .await?;
        observe_db_query("last_updated", start);
        Ok(t)
    }
}

/// Assemble the count and page queries. Both share the WHERE argument
/// prefix; pagination args are appended to the page query only.
fn build_list_sql(filter: &ReportFilter) -> (String, String, Vec<SqlArg>, Vec<SqlArg>) {
    let (clauses, base_args, mut idx) = build_where_clause(filter);
    let where_fragment = where_sql(&clauses);

    let count_sql = format!("SELECT COUNT(*) FROM storm_reports{where_fragment}");

    let mut data_sql = format!(
        "SELECT {COLUMNS} FROM storm_reports{where_fragment}{}",
        order_clause(filter)
    );
    let mut page_args = Vec::new();
    if let Some(limit) = filter.limit {
        data_sql.push_str(&format!(" LIMIT ${idx}"));
        page_args.push(SqlArg::Int(limit));
        idx += 1;
    }
    if let Some(offset) = filter.offset {
        data_sql.push_str(&format!(" OFFSET ${idx}"));
        page_args.push(SqlArg::Int(offset));
    }

    (count_sql, data_sql, base_args, page_args)
}

/// Route UNION ALL rows into the three result slices. State rows fold into
/// per-state groups (count summed over counties) preserving first-seen order.
fn fold_aggregation_rows(
    rows: Vec<AggRow>,
) -> Result<AggResult, crate::model::UnknownEnumValue> {
    let mut result = AggResult::default();

    for row in rows {
        match row.agg.as_str() {
            "type" => {
                let event_type = row.key1.as_deref().unwrap_or_default().parse()?;
                result.by_event_type.push(EventTypeGroup {
                    event_type,
                    count: row.count,
                    max_measurement: row.max_mag.map(|magnitude| MaxMeasurement {
                        magnitude,
                        unit: event_type.unit(),
                    }),
                });
            }
            "state" => {
                let state = row.key1.unwrap_or_default();
                let county = row.key2.unwrap_or_default();
                // Fold counties into their state, first-seen state order.
                let idx = match result.by_state.iter().position(|g| g.state == state) {
                    Some(idx) => idx,
                    None => {
                        result.by_state.push(StateGroup {
                            state,
                            count: 0,
                            counties: Vec::new(),
                        });
                        result.by_state.len() - 1
                    }
                };
                let group = &mut result.by_state[idx];
                group.count += row.count;
                group.counties.push(CountyGroup {
                    county,
                    count: row.count,
                });
            }
            "hour" => {
                if let Some(bucket) = row.bucket {
                    result.by_hour.push(TimeGroup {
                        bucket,
                        count: row.count,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(result)
}
