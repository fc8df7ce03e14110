//! Value snapshot type and the comparison/coercion rules shared by the engine.
//!
//! Documents travel as JSON, so every field value is a [`serde_json::Value`].
//! A form's values are kept in a [`Values`] map keyed by field name; `BTreeMap`
//! keeps payloads and snapshots in a deterministic order.

use std::collections::BTreeMap;

pub use serde_json::{Map, Value};

/// Field name -> current value.
pub type Values = BTreeMap<String, Value>;

/// One child-table row as it travels inside the parent's table value.
pub type Row = Map<String, Value>;

/// Read access to a value snapshot.
///
/// Callback conditions, dynamic link filters, and custom widgets receive a
/// `&dyn ValueAccessor` instead of the concrete map so that row-scoped views
/// (a table row layered over its parent form) can be passed the same way.
pub trait ValueAccessor {
    /// Current value of `name`, or `None` when the field holds no value.
    fn get(&self, name: &str) -> Option<&Value>;

    /// Convenience: the value as a string slice, if it is a JSON string.
    fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Truthiness of the field's current value (missing counts as falsy).
    fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some_and(is_truthy)
    }
}

impl ValueAccessor for Values {
    fn get(&self, name: &str) -> Option<&Value> {
        BTreeMap::get(self, name)
    }
}

impl ValueAccessor for Row {
    fn get(&self, name: &str) -> Option<&Value> {
        Map::get(self, name)
    }
}

/// A table row viewed on top of its parent form: row columns shadow parent fields.
pub struct RowScope<'a> {
    /// Values of the row being evaluated.
    pub row: &'a Row,
    /// Snapshot of the enclosing form.
    pub parent: &'a dyn ValueAccessor,
}

impl ValueAccessor for RowScope<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.row.get(name).or_else(|| self.parent.get(name))
    }
}

/// Truthiness as the condition language understands it.
///
/// Falsy: `null`, `false`, `0`, `""`, empty arrays and empty objects.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Whether a value counts as "no value" for required-field and fetch purposes.
///
/// Unlike [`is_truthy`], `0` and `false` are real values here.
#[must_use]
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Equality used by `==` in condition expressions.
///
/// Numbers compare numerically, a number matches a string that parses to the
/// same number, and booleans match `1`/`0`. Everything else is strict.
#[must_use]
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .zip(n.as_f64())
            .is_some_and(|(parsed, num)| parsed == num),
        (Value::Bool(flag), Value::Number(n)) | (Value::Number(n), Value::Bool(flag)) => {
            n.as_f64() == Some(if *flag { 1.0 } else { 0.0 })
        }
        _ => a == b,
    }
}

/// Numeric coercion applied to numeric table columns on submit.
///
/// Anything that does not parse as a number (including `null`) becomes `0`.
#[must_use]
pub fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

/// Converts an `f64` back to JSON, keeping integral values as integers.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::from(0), Value::Number)
    }
}

/// String form of a scalar value, used for ids and link values.
#[must_use]
pub fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(2.5)));
        assert!(is_truthy(&json!(true)));
    }

    #[test]
    fn emptiness_keeps_zero_and_false() {
        assert!(is_empty(&json!("  ")));
        assert!(is_empty(&Value::Null));
        assert!(!is_empty(&json!(0)));
        assert!(!is_empty(&json!(false)));
    }

    #[test]
    fn loose_equality() {
        assert!(loose_eq(&json!(1), &json!("1")));
        assert!(loose_eq(&json!("2.50"), &json!(2.5)));
        assert!(loose_eq(&json!(true), &json!(1)));
        assert!(!loose_eq(&json!("Motor"), &json!("Pump")));
        assert!(!loose_eq(&json!(1), &json!("one")));
    }

    #[test]
    fn numeric_coercion_defaults_to_zero() {
        assert!((coerce_number(&json!("12.5")) - 12.5).abs() < f64::EPSILON);
        assert!(coerce_number(&json!("abc")).abs() < f64::EPSILON);
        assert!(coerce_number(&Value::Null).abs() < f64::EPSILON);
        assert_eq!(number_value(3.0), json!(3));
        assert_eq!(number_value(2.5), json!(2.5));
    }

    #[test]
    fn row_scope_shadows_parent() {
        let mut parent = Values::new();
        parent.insert("lis_name".into(), json!("A"));
        parent.insert("qty".into(), json!(1));
        let mut row = Row::new();
        row.insert("qty".into(), json!(5));
        let scope = RowScope {
            row: &row,
            parent: &parent,
        };
        assert_eq!(scope.get("qty"), Some(&json!(5)));
        assert_eq!(scope.get_str("lis_name"), Some("A"));
        assert!(scope.get("missing").is_none());
    }
}
