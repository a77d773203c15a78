//! Filter validation: defaults and query-protection limits.

use std::collections::HashSet;

use crate::errors::AppError;
use crate::model::ReportFilter;

/// Maximum number of per-type filter entries.
pub const MAX_EVENT_TYPE_FILTERS: usize = 3;

/// Maximum (and default) page size.
pub const MAX_PAGE_SIZE: i64 = 20;

/// Maximum radius for point-radius search.
pub const MAX_RADIUS_MILES: f64 = 200.0;

/// Radius applied when `near` is given without one.
pub const DEFAULT_RADIUS_MILES: f64 = 20.0;

/// Validate a filter in place, enforcing limits and applying defaults.
pub fn validate_filter(filter: &mut ReportFilter) -> Result<(), AppError> {
    if filter.time_range.to <= filter.time_range.from {
        return Err(AppError::InvalidInput(
            "timeRange.to must be after timeRange.from".into(),
        ));
    }

    if let Some(near) = &mut filter.near {
        let radius = near.radius_miles.get_or_insert(DEFAULT_RADIUS_MILES);
        if *radius > MAX_RADIUS_MILES {
            return Err(AppError::InvalidInput(format!(
                "near.radiusMiles exceeds maximum of {MAX_RADIUS_MILES:.0}"
            )));
        }
    }

    if filter.event_type_filters.len() > MAX_EVENT_TYPE_FILTERS {
        return Err(AppError::InvalidInput(format!(
            "at most {MAX_EVENT_TYPE_FILTERS} eventTypeFilters allowed"
        )));
    }
    let mut seen = HashSet::new();
    for (i, type_filter) in filter.event_type_filters.iter().enumerate() {
        if !seen.insert(type_filter.event_type) {
            return Err(AppError::InvalidInput(format!(
                "eventTypeFilters[{i}]: duplicate eventType {}",
                type_filter.event_type
            )));
        }
        if let Some(radius) = type_filter.radius_miles {
            if radius > MAX_RADIUS_MILES {
                return Err(AppError::InvalidInput(format!(
                    "eventTypeFilters[{i}]: radiusMiles exceeds maximum of {MAX_RADIUS_MILES:.0}"
                )));
            }
        }
    }

    match filter.limit {
        None => filter.limit = Some(MAX_PAGE_SIZE),
        Some(limit) if limit > MAX_PAGE_SIZE => {
            return Err(AppError::InvalidInput(format!(
                "limit exceeds maximum of {MAX_PAGE_SIZE}"
            )));
        }
        Some(_) => {}
    }

    Ok(())
}
