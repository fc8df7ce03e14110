//! Per-field on-change hooks.
//!
//! Clearing stale values when a driver field switches sections is declared by
//! the schema, never inferred: a hidden field keeps its value unless a hook
//! on the field that hid it says otherwise.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::value::{Values, ValueAccessor};

/// Restricted write access handed to custom hooks.
///
/// Writes are collected and applied by the form after the hook returns.
pub struct HookWriter<'a> {
    snapshot: &'a Values,
    writes: Vec<(String, Value)>,
}

impl<'a> HookWriter<'a> {
    pub(crate) fn new(snapshot: &'a Values) -> Self {
        Self {
            snapshot,
            writes: Vec::new(),
        }
    }

    /// Current value of a field (before this hook's writes).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        ValueAccessor::get(self.snapshot, name)
    }

    /// Queues a write.
    pub fn set(&mut self, name: &str, value: Value) {
        self.writes.push((name.to_string(), value));
    }

    /// Queues a clear.
    pub fn clear(&mut self, name: &str) {
        self.set(name, Value::Null);
    }

    pub(crate) fn into_writes(self) -> Vec<(String, Value)> {
        self.writes
    }
}

/// Callback hook: receives the new value and a writer.
#[derive(Clone)]
pub struct HookFn(pub Arc<dyn Fn(&Value, &mut HookWriter<'_>) + Send + Sync>);

impl fmt::Debug for HookFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HookFn(..)")
    }
}

/// Declared reaction to a user change of the owning field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeHook {
    /// Reset `fields` to null, optionally only when `when` holds after the change.
    Clear {
        /// Fields to clear.
        fields: Vec<String>,
        /// Guard evaluated on the post-change snapshot.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Condition>,
    },
    /// Arbitrary in-process reaction.
    #[serde(skip)]
    Custom(HookFn),
}

impl ChangeHook {
    /// Clear `fields` whenever `when` holds.
    #[must_use]
    pub fn clear_when(when: Condition, fields: &[&str]) -> Self {
        Self::Clear {
            fields: fields.iter().map(|s| (*s).to_string()).collect(),
            when: Some(when),
        }
    }

    /// Wraps a callback.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &mut HookWriter<'_>) + Send + Sync + 'static,
    {
        Self::Custom(HookFn(Arc::new(f)))
    }

    /// Runs the hook, returning the writes it wants applied.
    #[must_use]
    pub fn run(&self, new_value: &Value, snapshot: &Values) -> Vec<(String, Value)> {
        match self {
            ChangeHook::Clear { fields, when } => {
                if when.as_ref().map_or(true, |c| c.holds(snapshot)) {
                    fields.iter().map(|f| (f.clone(), Value::Null)).collect()
                } else {
                    Vec::new()
                }
            }
            ChangeHook::Custom(f) => {
                let mut writer = HookWriter::new(snapshot);
                (f.0)(new_value, &mut writer);
                writer.into_writes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn clear_respects_guard() {
        let hook = ChangeHook::clear_when(
            Condition::expr("which_asset_to_interchange=='Motor'"),
            &["pump_asset", "pump_no"],
        );
        let mut values = Values::new();
        values.insert("which_asset_to_interchange".into(), json!("Motor"));
        let writes = hook.run(&json!("Motor"), &values);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(_, v)| v.is_null()));

        values.insert("which_asset_to_interchange".into(), json!("Pump"));
        assert!(hook.run(&json!("Pump"), &values).is_empty());
    }

    #[test]
    fn custom_hook_queues_writes() {
        let hook = ChangeHook::custom(|value, w| {
            if value == &json!("Closed") {
                w.set("closed_by", json!("operator@example.com"));
            }
        });
        let writes = hook.run(&json!("Closed"), &Values::new());
        assert_eq!(writes, vec![("closed_by".to_string(), json!("operator@example.com"))]);
    }
}
