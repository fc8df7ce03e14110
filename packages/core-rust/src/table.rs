//! User-editable child tables and derived selection tables.
//!
//! A table value is a JSON array of row objects. Every row carries the child
//! `doctype` the remote API requires and a generated identity under
//! [`ROW_KEY`] that survives reordering and is stripped before submit.

use serde_json::Value;

use crate::condition::Condition;
use crate::schema::{FieldSpec, SyncRule, TableSpec};
use crate::value::{coerce_number, number_value, Row, RowScope, ValueAccessor};

/// Column holding the generated row identity.
pub const ROW_KEY: &str = "__key";
/// Column holding the child doctype tag.
pub const DOCTYPE_KEY: &str = "doctype";
/// Column holding the 1-based row position on submit.
pub const IDX_KEY: &str = "idx";

/// Rows of a table value; anything that is not an array of objects reads as empty.
#[must_use]
pub fn rows(value: Option<&Value>) -> Vec<Row> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Packs rows back into a table value.
#[must_use]
pub fn to_value(rows: Vec<Row>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

/// Generates a fresh row identity.
#[must_use]
pub fn new_row_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Ensures `row` has a key and the doctype tag.
pub fn tag_row(row: &mut Row, child_doctype: &str) {
    if !row.get(ROW_KEY).is_some_and(Value::is_string) {
        row.insert(ROW_KEY.to_string(), Value::String(new_row_key()));
    }
    row.insert(DOCTYPE_KEY.to_string(), Value::String(child_doctype.to_string()));
}

/// A new row seeded with column defaults, then `init` on top.
#[must_use]
pub fn new_row(spec: &TableSpec, init: Row) -> Row {
    let mut row = Row::new();
    for column in spec.columns.iter().filter(|c| c.kind.carries_data()) {
        let value = column
            .default
            .clone()
            .unwrap_or_else(|| column.kind.empty_value());
        row.insert(column.name.clone(), value);
    }
    row.extend(init);
    tag_row(&mut row, &spec.child_doctype);
    row
}

/// Rows in submit form: keys stripped, doctype and `idx` set, numeric
/// columns coerced (unparseable values become 0), layout columns dropped.
#[must_use]
pub fn submit_rows(rows: &[Row], child_doctype: &str, columns: &[FieldSpec]) -> Value {
    let packed = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut out = Row::new();
            for (key, value) in row {
                if key == ROW_KEY {
                    continue;
                }
                let column = columns.iter().find(|c| &c.name == key);
                match column {
                    Some(c) if !c.kind.carries_data() => {}
                    Some(c) if c.kind.is_numeric() => {
                        out.insert(key.clone(), number_value(coerce_number(value)));
                    }
                    _ => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            out.insert(DOCTYPE_KEY.to_string(), Value::String(child_doctype.to_string()));
            out.insert(IDX_KEY.to_string(), Value::from(i + 1));
            Value::Object(out)
        })
        .collect();
    Value::Array(packed)
}

/// Structural row equality ignoring generated keys and `idx`.
#[must_use]
pub fn rows_equivalent(a: &[Row], b: &[Row]) -> bool {
    let strip = |row: &Row| -> Row {
        row.iter()
            .filter(|(k, _)| k.as_str() != ROW_KEY && k.as_str() != IDX_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| strip(x) == strip(y))
}

/// Rows of the selection table derived by `rule` from `source_rows`.
///
/// Existing target rows are reused (keeping their keys) when they project to
/// the same values, so recomputation is stable.
#[must_use]
pub fn derive_selection(
    rule: &SyncRule,
    source_rows: &[Row],
    existing_target: &[Row],
    target_doctype: &str,
    parent: &dyn ValueAccessor,
) -> Vec<Row> {
    source_rows
        .iter()
        .filter(|row| row_matches(&rule.predicate, row, parent))
        .map(|row| {
            let mut derived = Row::new();
            for (from, to) in &rule.columns {
                derived.insert(to.clone(), row.get(from).cloned().unwrap_or(Value::Null));
            }
            if let Some(prev) = existing_target.iter().find(|prev| {
                rule.columns
                    .iter()
                    .all(|(_, to)| prev.get(to) == derived.get(to))
            }) {
                if let Some(key) = prev.get(ROW_KEY) {
                    derived.insert(ROW_KEY.to_string(), key.clone());
                }
            }
            tag_row(&mut derived, target_doctype);
            derived
        })
        .collect()
}

fn row_matches(predicate: &Condition, row: &Row, parent: &dyn ValueAccessor) -> bool {
    predicate.holds(&RowScope { row, parent })
}
