//! Typed query façade: selection sets, budgets, validation, and field-aware
//! execution against the store.

pub mod execute;
pub mod selection;
pub mod validate;

pub use execute::{storm_reports, Aggregations, Envelope, QueryMeta, StormReportsQuery};
pub use selection::{
    operation_complexity, operation_depth, Selection, COMPLEXITY_BUDGET, MAX_DEPTH,
};
pub use validate::{
    validate_filter, DEFAULT_RADIUS_MILES, MAX_EVENT_TYPE_FILTERS, MAX_PAGE_SIZE,
    MAX_RADIUS_MILES,
};
