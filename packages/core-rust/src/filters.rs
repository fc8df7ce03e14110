//! Link-search filters derived from the current value snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{FieldKind, FieldSpec};
use crate::value::{is_empty, ValueAccessor};

/// Resolved filter set sent with a link search: target-doctype field -> value.
pub type Filters = BTreeMap<String, Value>;

/// Callback producing filters from the snapshot.
#[derive(Clone)]
pub struct FilterFn(pub Arc<dyn Fn(&dyn ValueAccessor) -> Filters + Send + Sync>);

impl fmt::Debug for FilterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterFn(..)")
    }
}

/// One constraint on a Link field's candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkFilter {
    /// Fixed constraint, e.g. `{ "is_group": 0 }`.
    Literal {
        /// Field on the target doctype.
        field: String,
        /// Required value.
        value: Value,
    },
    /// `filterMapping`: copy this form's `source_field` into `target_field`.
    Mapped {
        /// Field on this form whose current value constrains the search.
        source_field: String,
        /// Field on the target doctype.
        target_field: String,
    },
    /// Computed from the snapshot by an in-process callback. `depends_on` names
    /// the fields it reads so the engine can announce filter changes.
    #[serde(skip)]
    Dynamic {
        /// Fields read by `resolve`.
        depends_on: Vec<String>,
        /// The callback.
        resolve: FilterFn,
    },
}

impl LinkFilter {
    /// Shorthand for [`LinkFilter::Mapped`].
    #[must_use]
    pub fn mapped(source_field: &str, target_field: &str) -> Self {
        Self::Mapped {
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
        }
    }

    /// Shorthand for [`LinkFilter::Dynamic`].
    pub fn dynamic<F>(depends_on: &[&str], f: F) -> Self
    where
        F: Fn(&dyn ValueAccessor) -> Filters + Send + Sync + 'static,
    {
        Self::Dynamic {
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            resolve: FilterFn(Arc::new(f)),
        }
    }

    /// Form fields whose values feed this filter.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        match self {
            LinkFilter::Literal { .. } => Vec::new(),
            LinkFilter::Mapped { source_field, .. } => vec![source_field.as_str()],
            LinkFilter::Dynamic { depends_on, .. } => {
                depends_on.iter().map(String::as_str).collect()
            }
        }
    }
}

/// Resolves the filter set for a Link field from the present snapshot.
///
/// Mapped sources that are currently empty add no constraint. Non-link fields
/// resolve to an empty set.
#[must_use]
pub fn resolve_filters(field: &FieldSpec, values: &dyn ValueAccessor) -> Filters {
    let FieldKind::Link { filters, .. } = &field.kind else {
        return Filters::new();
    };
    let mut out = Filters::new();
    for filter in filters {
        match filter {
            LinkFilter::Literal { field, value } => {
                out.insert(field.clone(), value.clone());
            }
            LinkFilter::Mapped {
                source_field,
                target_field,
            } => {
                if let Some(v) = values.get(source_field).filter(|v| !is_empty(v)) {
                    out.insert(target_field.clone(), v.clone());
                }
            }
            LinkFilter::Dynamic { resolve, .. } => out.extend((resolve.0)(values)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::Values;

    fn stage_field() -> FieldSpec {
        FieldSpec::new(
            "stage",
            FieldKind::Link {
                doctype: "Stage No".into(),
                filters: vec![
                    LinkFilter::mapped("lis_name", "lis_name"),
                    LinkFilter::Literal {
                        field: "disabled".into(),
                        value: json!(0),
                    },
                ],
            },
        )
    }

    #[test]
    fn mapped_filter_tracks_current_value() {
        let field = stage_field();
        let mut values = Values::new();
        values.insert("lis_name".into(), json!("A"));
        assert_eq!(resolve_filters(&field, &values)["lis_name"], json!("A"));
        values.insert("lis_name".into(), json!("B"));
        let filters = resolve_filters(&field, &values);
        assert_eq!(filters["lis_name"], json!("B"));
        assert_eq!(filters["disabled"], json!(0));
    }

    #[test]
    fn empty_source_adds_no_constraint() {
        let filters = resolve_filters(&stage_field(), &Values::new());
        assert!(!filters.contains_key("lis_name"));
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn dynamic_filter_uses_snapshot() {
        let field = FieldSpec::new(
            "asset",
            FieldKind::Link {
                doctype: "Asset".into(),
                filters: vec![LinkFilter::dynamic(&["asset_category"], |v| {
                    let mut f = Filters::new();
                    if let Some(cat) = v.get("asset_category") {
                        f.insert("asset_category".into(), cat.clone());
                    }
                    f
                })],
            },
        );
        let mut values = Values::new();
        values.insert("asset_category".into(), json!("Pump"));
        assert_eq!(resolve_filters(&field, &values)["asset_category"], json!("Pump"));
    }
}
