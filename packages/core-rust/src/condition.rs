//! `depends_on` conditions and their evaluation against a value snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::{self, Expr, ParseError};
use crate::value::{is_truthy, ValueAccessor};

/// In-process condition callback. Must be pure: the evaluator may call it any
/// number of times per change.
#[derive(Clone)]
pub struct ConditionFn(pub Arc<dyn Fn(&dyn ValueAccessor) -> bool + Send + Sync>);

impl fmt::Debug for ConditionFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConditionFn(..)")
    }
}

/// An expression string, parsed once when it is constructed or deserialized.
///
/// Malformed sources are kept (so schemas still load) and evaluate to `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Expression {
    source: String,
    parsed: Result<Expr, ParseError>,
}

impl Expression {
    /// Parses `source`. Never fails; check [`Expression::error`].
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let parsed = expr::parse(&source);
        Self { source, parsed }
    }

    /// The expression as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parse error, if the source is outside the grammar.
    #[must_use]
    pub fn error(&self) -> Option<&ParseError> {
        self.parsed.as_ref().err()
    }

    /// Field names referenced by the expression (empty when malformed).
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.parsed.as_ref().map(Expr::fields).unwrap_or_default()
    }

    fn eval(&self, values: &dyn ValueAccessor) -> bool {
        match &self.parsed {
            Ok(expr) => expr.eval(values),
            Err(_) => false,
        }
    }
}

impl From<String> for Expression {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl From<Expression> for String {
    fn from(expr: Expression) -> Self {
        expr.source
    }
}

/// Condition attached to `display_depends_on` / `required_depends_on` /
/// `read_only_depends_on`.
///
/// Serialized form: a JSON string is an [`Expression`], a JSON object is a
/// field map. Callbacks exist only for schemas built in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Restricted boolean expression, e.g. `"status=='Open' || priority=='High'"`.
    Expression(Expression),
    /// `{ field: expected }` entries AND-ed together. `true` means "truthy",
    /// any other value means "equal to".
    Map(BTreeMap<String, Value>),
    /// Pure callback over a value accessor.
    #[serde(skip)]
    Callback(ConditionFn),
}

impl Condition {
    /// Builds an expression condition.
    #[must_use]
    pub fn expr(source: &str) -> Self {
        Self::Expression(Expression::new(source))
    }

    /// Builds a field-map condition from `(field, expected)` pairs.
    #[must_use]
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds a callback condition.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&dyn ValueAccessor) -> bool + Send + Sync + 'static,
    {
        Self::Callback(ConditionFn(Arc::new(f)))
    }

    /// Resolves the condition against a snapshot. Pure; malformed expressions
    /// resolve to `false`.
    #[must_use]
    pub fn holds(&self, values: &dyn ValueAccessor) -> bool {
        match self {
            Condition::Expression(expr) => expr.eval(values),
            Condition::Map(entries) => entries
                .iter()
                .all(|(field, expected)| entry_satisfied(values.get(field), expected)),
            Condition::Callback(f) => (f.0)(values),
        }
    }

    /// Field names this condition reads. Callbacks are opaque and report none.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Condition::Expression(expr) => expr.fields(),
            Condition::Map(entries) => entries.keys().map(String::as_str).collect(),
            Condition::Callback(_) => Vec::new(),
        }
    }
}

fn entry_satisfied(actual: Option<&Value>, expected: &Value) -> bool {
    if *expected == Value::Bool(true) {
        return actual.is_some_and(is_truthy);
    }
    match (actual, expected) {
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
        (None, b) => b.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::value::Values;

    #[test]
    fn deserializes_string_and_map_forms() {
        let expr: Condition = serde_json::from_value(json!("lis_name=='A'")).unwrap();
        assert!(matches!(expr, Condition::Expression(_)));
        let map: Condition = serde_json::from_value(json!({"is_active": true})).unwrap();
        assert!(matches!(map, Condition::Map(_)));
    }

    #[test]
    fn malformed_expression_fails_closed() {
        let cond = Condition::expr("status = 'Open'");
        let Condition::Expression(expr) = &cond else {
            unreachable!()
        };
        assert!(expr.error().is_some());
        let mut values = Values::new();
        values.insert("status".into(), json!("Open"));
        assert!(!cond.holds(&values));
    }

    #[test]
    fn deeply_nested_expression_fails_closed() {
        let cond = Condition::expr(&format!("{}a=='1'", "!".repeat(200_000)));
        let Condition::Expression(expr) = &cond else {
            unreachable!()
        };
        assert!(expr.error().is_some());
        let mut values = Values::new();
        values.insert("a".into(), json!("1"));
        assert!(!cond.holds(&values));
    }

    #[test]
    fn callback_reads_through_accessor() {
        let cond = Condition::callback(|v| v.get_str("kind") == Some("Pump"));
        let mut values = Values::new();
        values.insert("kind".into(), json!("Pump"));
        assert!(cond.holds(&values));
        values.insert("kind".into(), json!("Motor"));
        assert!(!cond.holds(&values));
    }

    #[test]
    fn serialized_expression_round_trips_source() {
        let cond = Condition::expr("a == 'b'");
        assert_eq!(serde_json::to_value(&cond).unwrap(), json!("a == 'b'"));
    }

    fn arb_value() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            Just(Some(Value::Null)),
            Just(Some(json!(""))),
            Just(Some(json!(0))),
            Just(Some(json!("Motor"))),
            Just(Some(json!("Pump"))),
            Just(Some(json!(7))),
        ]
    }

    proptest! {
        // Visibility from a map condition is exactly the AND of each entry's rule.
        #[test]
        fn map_condition_is_and_of_entries(
            a in arb_value(),
            b in arb_value(),
            c in arb_value(),
        ) {
            let cond = Condition::map([
                ("a", json!(true)),
                ("b", json!("Motor")),
                ("c", json!(7)),
            ]);
            let mut values = Values::new();
            for (name, v) in [("a", &a), ("b", &b), ("c", &c)] {
                if let Some(v) = v {
                    values.insert(name.to_string(), v.clone());
                }
            }
            let a_ok = a.as_ref().is_some_and(is_truthy);
            let b_ok = b.as_ref() == Some(&json!("Motor"));
            let c_ok = c.as_ref() == Some(&json!(7));
            prop_assert_eq!(cond.holds(&values), a_ok && b_ok && c_ok);
        }
    }
}
