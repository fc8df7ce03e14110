//! Pre-submit field validation.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::evaluator::{evaluate, FieldStates};
use crate::schema::{FieldKind, FieldSpec, Schema};
use crate::table;
use crate::value::{is_empty, RowScope, ValueAccessor};

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Required,
    Pattern,
    NotANumber,
    NotAnInteger,
    BelowMin { min: f64 },
    AboveMax { max: f64 },
    NotAnOption { value: String },
}

/// One rejected value: a top-level field, or a cell of a table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub label: String,
    /// 0-based row index for table cells.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub violation: Violation,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.violation {
            Violation::Required => "is required".to_string(),
            Violation::Pattern => "has an invalid format".to_string(),
            Violation::NotANumber => "must be a number".to_string(),
            Violation::NotAnInteger => "must be a whole number".to_string(),
            Violation::BelowMin { min } => format!("must be at least {min}"),
            Violation::AboveMax { max } => format!("must be at most {max}"),
            Violation::NotAnOption { value } => format!("cannot be {value:?}"),
        };
        match self.row {
            Some(row) => write!(f, "{} {what} (row {} of {})", self.label, row + 1, self.field),
            None => write!(f, "{} {what}", self.label),
        }
    }
}

impl std::error::Error for FieldError {}

/// Validates every visible data field of `schema` against `values`.
///
/// Hidden fields are skipped entirely. Rows of visible tables are checked
/// cell by cell, each column evaluated against its row layered over the form.
#[must_use]
pub fn validate(schema: &Schema, states: &FieldStates, values: &dyn ValueAccessor) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for field in schema.data_fields() {
        let Some(state) = states.get(&field.name).filter(|s| s.visible) else {
            continue;
        };
        let value = values.get(&field.name).unwrap_or(&Value::Null);
        if let Some(violation) = check_value(schema, &field.name, field, value, state.required) {
            errors.push(FieldError {
                field: field.name.clone(),
                label: field.label.clone(),
                row: None,
                column: None,
                violation,
            });
        }
        if let FieldKind::Table(spec) = &field.kind {
            for (index, row) in table::rows(Some(value)).iter().enumerate() {
                let scope = RowScope { row, parent: values };
                for column in spec.columns.iter().filter(|c| c.kind.carries_data()) {
                    let column_state = evaluate(column, &scope);
                    if !column_state.visible {
                        continue;
                    }
                    let cell = row.get(&column.name).unwrap_or(&Value::Null);
                    let key = format!("{}.{}", field.name, column.name);
                    if let Some(violation) = check_value(schema, &key, column, cell, column_state.required) {
                        errors.push(FieldError {
                            field: field.name.clone(),
                            label: column.label.clone(),
                            row: Some(index),
                            column: Some(column.name.clone()),
                            violation,
                        });
                    }
                }
            }
        }
    }
    errors
}

/// Checks one value against its field's rules. `key` locates the compiled
/// pattern (`field` or `table.column`).
#[must_use]
pub fn check_value(
    schema: &Schema,
    key: &str,
    field: &FieldSpec,
    value: &Value,
    required: bool,
) -> Option<Violation> {
    if is_empty(value) {
        return required.then_some(Violation::Required);
    }
    match &field.kind {
        FieldKind::Data { .. } => {
            let pattern = schema.pattern(key)?;
            let text = value.as_str()?;
            (!pattern.is_match(text)).then_some(Violation::Pattern)
        }
        FieldKind::Int { min, max } => check_number(value, *min, *max, true),
        FieldKind::Float { min, max, .. } => check_number(value, *min, *max, false),
        FieldKind::Currency | FieldKind::Percent => check_number(value, None, None, false),
        FieldKind::Select { options } => {
            let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            (!options.contains(&text)).then_some(Violation::NotAnOption { value: text })
        }
        _ => None,
    }
}

fn check_number(value: &Value, min: Option<f64>, max: Option<f64>, integer: bool) -> Option<Violation> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number else {
        return Some(Violation::NotANumber);
    };
    if integer && number.fract() != 0.0 {
        return Some(Violation::NotAnInteger);
    }
    if let Some(min) = min.filter(|m| number < *m) {
        return Some(Violation::BelowMin { min });
    }
    max.filter(|m| number > *m).map(|max| Violation::AboveMax { max })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::condition::Condition;
    use crate::evaluator::evaluate_all;
    use crate::schema::{Naming, SchemaDef, TabbedLayout, TableSpec};
    use crate::value::Values;

    fn schema() -> Schema {
        Schema::new(SchemaDef {
            doctype: "Tender".into(),
            tabs: vec![TabbedLayout::new(
                "Main",
                vec![
                    FieldSpec::new("tender_no", FieldKind::Data { pattern: Some(r"TN-\d{4}".into()) })
                        .with_label("Tender No")
                        .required(),
                    FieldSpec::select("status", &["Open", "Closed"]),
                    FieldSpec::new("bidders", FieldKind::Int { min: Some(1.0), max: Some(50.0) }),
                    FieldSpec::data("remarks")
                        .required()
                        .display_depends_on(Condition::expr("status == 'Closed'")),
                    FieldSpec::new(
                        "items",
                        FieldKind::Table(TableSpec {
                            child_doctype: "Tender Item".into(),
                            columns: vec![
                                FieldSpec::link("item_code", "Item").with_label("Item").required(),
                                FieldSpec::new("qty", FieldKind::Float { min: Some(0.0), max: None, precision: None }),
                            ],
                        }),
                    ),
                ],
            )],
            naming: Naming::Autoname,
            sync_rules: Vec::new(),
        })
        .unwrap()
    }

    fn run(values: &Values) -> Vec<FieldError> {
        let schema = schema();
        let states = evaluate_all(&schema, values);
        validate(&schema, &states, values)
    }

    fn valid() -> Values {
        let mut values = Values::new();
        values.insert("tender_no".into(), json!("TN-0042"));
        values.insert("status".into(), json!("Open"));
        values.insert("bidders".into(), json!(3));
        values.insert("items".into(), json!([{"item_code": "PIPE", "qty": 2}]));
        values
    }

    #[test]
    fn valid_document_has_no_errors() {
        assert!(run(&valid()).is_empty());
    }

    #[test]
    fn required_pattern_bounds_and_options() {
        let mut values = valid();
        values.insert("tender_no".into(), json!("TN-42"));
        values.insert("bidders".into(), json!(0));
        values.insert("status".into(), json!("Pending"));
        let errors = run(&values);
        let kinds: Vec<_> = errors.iter().map(|e| (e.field.as_str(), &e.violation)).collect();
        assert!(kinds.contains(&("tender_no", &Violation::Pattern)));
        assert!(kinds.contains(&("bidders", &Violation::BelowMin { min: 1.0 })));
        assert!(kinds.contains(&(
            "status",
            &Violation::NotAnOption { value: "Pending".into() }
        )));

        values.remove("tender_no");
        assert_eq!(run(&values)[0].to_string(), "Tender No is required");
    }

    #[test]
    fn hidden_required_field_is_skipped() {
        let mut values = valid();
        assert!(run(&values).is_empty());
        values.insert("status".into(), json!("Closed"));
        let errors = run(&values);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "remarks");
    }

    #[test]
    fn table_cells_are_checked_per_row() {
        let mut values = valid();
        values.insert(
            "items".into(),
            json!([{"item_code": "PIPE", "qty": 1}, {"item_code": "", "qty": "many"}]),
        );
        let errors = run(&values);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].row, Some(1));
        assert_eq!(errors[0].to_string(), "Item is required (row 2 of items)");
        assert_eq!(errors[1].violation, Violation::NotANumber);
    }

    #[test]
    fn integers_reject_fractions() {
        assert_eq!(check_number(&json!(2.5), None, None, true), Some(Violation::NotAnInteger));
        assert_eq!(check_number(&json!("7"), None, Some(5.0), true), Some(Violation::AboveMax { max: 5.0 }));
    }
}
