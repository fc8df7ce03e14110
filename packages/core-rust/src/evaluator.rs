//! Dependency evaluator: visibility, requiredness, and read-only state per field.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::schema::{FieldSpec, Schema};
use crate::value::ValueAccessor;

/// Resolved display rules of one field for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldState {
    /// Shown for this snapshot: not `hidden` and `display_depends_on` holds.
    pub visible: bool,
    /// Must be non-empty before submit. Always `false` while hidden.
    pub required: bool,
    /// Rendered but not editable.
    pub read_only: bool,
}

impl FieldState {
    /// State of a field nobody can see.
    pub const HIDDEN: Self = Self {
        visible: false,
        required: false,
        read_only: false,
    };
}

/// Field name -> state, for every field of a schema.
pub type FieldStates = BTreeMap<String, FieldState>;

/// Evaluates one field against a snapshot.
///
/// A hidden field is never required. `required_depends_on`, when present,
/// replaces the static `required` flag; `read_only_depends_on` can only add
/// read-only-ness on top of the static flag.
#[must_use]
pub fn evaluate(field: &FieldSpec, values: &dyn ValueAccessor) -> FieldState {
    let visible = !field.hidden
        && field
            .display_depends_on
            .as_ref()
            .map_or(true, |c| c.holds(values));
    if !visible {
        return FieldState::HIDDEN;
    }
    let required = field
        .required_depends_on
        .as_ref()
        .map_or(field.required, |c| c.holds(values));
    let read_only = field.read_only
        || field
            .read_only_depends_on
            .as_ref()
            .is_some_and(|c| c.holds(values));
    FieldState {
        visible,
        required: required && !field.kind.is_layout(),
        read_only,
    }
}

/// Evaluates every field of a schema in one pass.
#[must_use]
pub fn evaluate_all(schema: &Schema, values: &dyn ValueAccessor) -> FieldStates {
    schema
        .fields()
        .map(|field| (field.name.clone(), evaluate(field, values)))
        .collect()
}
