//! Selection sets and pre-execution query budgets.
//!
//! A selection is a tree of field names; leaves are `null` or `{}` in the
//! request JSON. Depth and complexity are computed over the tree before any
//! storage call, so pathological queries are rejected while they are still
//! cheap.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::query::validate::MAX_PAGE_SIZE;

/// Maximum selection-set nesting (the operation counts as level 1).
pub const MAX_DEPTH: usize = 7;

/// Maximum operation complexity.
pub const COMPLEXITY_BUDGET: i64 = 600;

/// A selection set: field name → child selection. An empty map is a leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection(pub BTreeMap<String, Selection>);

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Is `field` selected at this level?
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Is any of `fields` selected at this level?
    pub fn any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.contains(f))
    }

    /// Deepest nesting level below this node; an empty selection is 0.
    pub fn depth(&self) -> usize {
        self.0.values().map(|child| 1 + child.depth()).max().unwrap_or(0)
    }

    /// Introspection selections access schema metadata through fields
    /// starting with "__"; they bypass the depth budget.
    pub fn has_introspection(&self) -> bool {
        self.0.keys().any(|name| name.starts_with("__"))
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SelectionVisitor;

        impl<'de> Visitor<'de> for SelectionVisitor {
            type Value = Selection;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("null, a bool, or an object of selected fields")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Selection::default())
            }

            fn visit_bool<E>(self, _: bool) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Selection::default())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut fields = BTreeMap::new();
                while let Some((name, child)) = map.next_entry::<String, Selection>()? {
                    fields.insert(name, child);
                }
                Ok(Selection(fields))
            }
        }

        deserializer.deserialize_any(SelectionVisitor)
    }
}

/// Operation depth: the operation itself is level 1, its selection's fields
/// level 2, and so on.
pub fn operation_depth(select: &Selection) -> usize {
    1 + select.depth()
}

/// Operation complexity, computed bottom-up. Leaf fields cost 1; object
/// fields cost 1 plus their children; list fields multiply their children by
/// the most items they can return:
///   - `reports`: up to MAX_PAGE_SIZE (20) items per query
///   - `byEventType`/`byState`/`byHour`: up to 10 groups each
///   - `counties`: up to 5 per state
/// The operation itself contributes 1.
pub fn operation_complexity(select: &Selection) -> i64 {
    1 + selection_cost(select)
}

fn selection_cost(selection: &Selection) -> i64 {
    selection
        .0
        .iter()
        .map(|(name, child)| field_cost(name, child))
        .sum()
}

fn field_cost(name: &str, child: &Selection) -> i64 {
    let child_cost = if child.is_empty() {
        1
    } else {
        selection_cost(child)
    };
    match name {
        "reports" => MAX_PAGE_SIZE * child_cost,
        "byEventType" | "byState" | "byHour" => 10 * child_cost,
        "counties" => 5 * child_cost,
        _ if child.is_empty() => 1,
        _ => 1 + child_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(json: serde_json::Value) -> Selection {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_deserialize_accepts_null_and_empty_object_leaves() {
        let s = select(serde_json::json!({
            "totalCount": null,
            "hasMore": {},
            "reports": {"id": null}
        }));
        assert!(s.contains("totalCount"));
        assert!(s.contains("hasMore"));
        assert!(s.0["reports"].contains("id"));
    }

    #[test]
    fn test_depth_counts_nesting() {
        assert_eq!(select(serde_json::json!({})).depth(), 0);
        assert_eq!(select(serde_json::json!({"totalCount": null})).depth(), 1);
        assert_eq!(
            select(serde_json::json!({"reports": {"geo": {"lat": null}}})).depth(),
            3
        );
    }

    #[test]
    fn test_operation_depth_counts_operation_as_level_one() {
        let s = select(serde_json::json!({"reports": {"geo": {"lat": null}}}));
        assert_eq!(operation_depth(&s), 4);
    }

    #[test]
    fn test_depth_takes_deepest_branch() {
        let s = select(serde_json::json!({
            "totalCount": null,
            "aggregations": {"byState": {"counties": {"county": null}}}
        }));
        assert_eq!(s.depth(), 4);
    }

    #[test]
    fn test_introspection_detection() {
        assert!(select(serde_json::json!({"__schema": null})).has_introspection());
        assert!(!select(serde_json::json!({"reports": null})).has_introspection());
        // Only top-level fields mark an introspection operation.
        assert!(!select(serde_json::json!({"reports": {"__typename": null}})).has_introspection());
    }

    #[test]
    fn test_complexity_of_leaves() {
        // 1 (operation) + two leaf fields
        let s = select(serde_json::json!({"totalCount": null, "hasMore": null}));
        assert_eq!(operation_complexity(&s), 3);
    }

    #[test]
    fn test_complexity_multiplies_reports_by_page_size() {
        let s = select(serde_json::json!({"reports": {"id": null, "comments": null}}));
        assert_eq!(operation_complexity(&s), 1 + 20 * 2);
    }

    #[test]
    fn test_complexity_multiplies_aggregation_lists() {
        let s = select(serde_json::json!({
            "aggregations": {"byState": {"state": null, "count": null, "counties": {"county": null, "count": null}}}
        }));
        // counties: 5×2=10; byState children: 1+1+10=12 → ×10=120;
        // aggregations: 1+120=121; operation: +1
        assert_eq!(operation_complexity(&s), 122);
    }

    // The worked budget examples: a typical dashboard query fits, selecting
    // every field of every type does not.
    #[test]
    fn test_complexity_dashboard_query_within_budget() {
        let s = select(serde_json::json!({
            "reports": {
                "id": null, "eventType": null, "magnitude": null, "eventTime": null,
                "state": null, "county": null, "lat": null, "lon": null,
                "severity": null, "comments": null, "sourceOffice": null,
                "unit": null, "timeBucket": null, "processedAt": null
            },
            "totalCount": null,
            "hasMore": null,
            "aggregations": {
                "totalCount": null,
                "byEventType": {"eventType": null, "count": null, "maxMeasurement": {"magnitude": null, "unit": null}},
                "byState": {"state": null, "count": null, "counties": {"county": null, "count": null}},
                "byHour": {"bucket": null, "count": null}
            },
            "meta": {"lastUpdated": null, "dataLagMinutes": null}
        }));
        // reports 20×14=280, aggregations 1+(1+50+120+20)=192, meta 3,
        // totalCount 1, hasMore 1, operation 1 → 478
        let c = operation_complexity(&s);
        assert_eq!(c, 478);
        assert!(c <= COMPLEXITY_BUDGET);
    }

    #[test]
    fn test_complexity_full_nested_selection_exceeds_budget() {
        let s = select(serde_json::json!({
            "reports": {
                "id": null, "eventType": null, "eventTime": null,
                "comments": null, "sourceOffice": null, "timeBucket": null, "processedAt": null,
                "geo": {"lat": null, "lon": null},
                "measurement": {"magnitude": null, "unit": null, "severity": null},
                "location": {"raw": null, "name": null, "state": null, "county": null, "distance": null, "direction": null}
            },
            "totalCount": null,
            "hasMore": null,
            "aggregations": {
                "totalCount": null,
                "byEventType": {"eventType": null, "count": null, "maxMeasurement": {"magnitude": null, "unit": null}},
                "byState": {"state": null, "count": null, "counties": {"county": null, "count": null}},
                "byHour": {"bucket": null, "count": null}
            },
            "meta": {"lastUpdated": null, "dataLagMinutes": null}
        }));
        // reports 20×21=420 pushes the total past the budget (618).
        let c = operation_complexity(&s);
        assert_eq!(c, 618);
        assert!(c > COMPLEXITY_BUDGET);
    }
}
