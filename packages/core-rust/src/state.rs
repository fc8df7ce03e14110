//! Canonical value store with dirty tracking and payload diffing.
//!
//! Two notions of "changed" are tracked separately:
//! - **net change**: current value differs from the initial snapshot. Drives
//!   [`FormState::is_dirty`] and the submit diff.
//! - **user dirty**: the user touched the field and left it different from the
//!   initial snapshot. Engine-driven writes (fetch resolution, matrix
//!   regeneration) opt out so "unsaved edits" prompts stay accurate.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::value::{Values, ValueAccessor};

/// Options for [`FormState::set_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Record the write as a user edit.
    pub mark_dirty: bool,
}

impl SetOptions {
    /// User edit (the default).
    pub const USER: Self = Self { mark_dirty: true };
    /// Engine-driven write that must not flag the field as user-dirty.
    pub const ENGINE: Self = Self { mark_dirty: false };
}

impl Default for SetOptions {
    fn default() -> Self {
        Self::USER
    }
}

/// Values of one document edit session.
#[derive(Debug, Clone, Default)]
pub struct FormState {
    values: Values,
    initial: Values,
    user_dirty: BTreeSet<String>,
}

impl FormState {
    /// Creates a state whose initial snapshot equals `values`.
    #[must_use]
    pub fn new(values: Values) -> Self {
        Self {
            initial: values.clone(),
            values,
            user_dirty: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn values(&self) -> &Values {
        &self.values
    }

    #[must_use]
    pub fn initial(&self) -> &Values {
        &self.initial
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Writes a value. Returns `true` when the stored value actually changed.
    pub fn set_value(&mut self, name: &str, value: Value, opts: SetOptions) -> bool {
        let changed = self.values.get(name) != Some(&value);
        let back_to_initial = same(self.initial_of(name), &value);
        self.values.insert(name.to_string(), value);
        if back_to_initial {
            self.user_dirty.remove(name);
        } else if opts.mark_dirty && changed {
            self.user_dirty.insert(name.to_string());
        }
        changed
    }

    fn initial_of(&self, name: &str) -> &Value {
        self.initial.get(name).unwrap_or(&Value::Null)
    }

    /// True iff any field's value differs from the initial snapshot.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.values
            .iter()
            .any(|(name, value)| !same(self.initial_of(name), value))
            || self.initial.keys().any(|k| !self.values.contains_key(k))
    }

    /// Whether the user has a net edit on `name`.
    #[must_use]
    pub fn is_user_dirty(&self, name: &str) -> bool {
        self.user_dirty.contains(name)
    }

    /// Whether the user has any net edit.
    #[must_use]
    pub fn has_user_edits(&self) -> bool {
        !self.user_dirty.is_empty()
    }

    /// Names of fields whose value differs from the initial snapshot.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(name, value)| !same(self.initial_of(name), value))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// All current values of the fields accepted by `include`.
    #[must_use]
    pub fn build_submit_payload(&self, include: impl Fn(&str) -> bool) -> Values {
        self.values
            .iter()
            .filter(|(name, _)| include(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Net changes only, filtered by `include`.
    #[must_use]
    pub fn diff_payload(&self, include: impl Fn(&str) -> bool) -> Values {
        self.values
            .iter()
            .filter(|(name, value)| include(name) && !same(self.initial_of(name), value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Adopts a saved server record as the new baseline.
    pub fn commit(&mut self, record: Values) {
        self.initial = record.clone();
        self.values = record;
        self.user_dirty.clear();
    }

    /// Writes `value` into both the current and the initial snapshot, so the
    /// field is clean afterwards. Used once the server has accepted a value
    /// through a side channel (a rename).
    pub fn set_baseline(&mut self, name: &str, value: Value) {
        self.initial.insert(name.to_string(), value.clone());
        self.values.insert(name.to_string(), value);
        self.user_dirty.remove(name);
    }

    /// Discards edits, returning to the initial snapshot.
    pub fn reset(&mut self) {
        self.values = self.initial.clone();
        self.user_dirty.clear();
    }
}

impl ValueAccessor for FormState {
    fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Null and absent compare equal; so do `""` and null, which the server
/// round-trips interchangeably for empty text fields.
fn same(a: &Value, b: &Value) -> bool {
    let blank = |v: &Value| v.is_null() || v.as_str() == Some("");
    a == b || (blank(a) && blank(b))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn loaded() -> FormState {
        let mut record = Values::new();
        record.insert("status".into(), json!("Open"));
        record.insert("qty".into(), json!(2));
        record.insert("remarks".into(), Value::Null);
        FormState::new(record)
    }

    #[test]
    fn clean_after_load_and_after_revert() {
        let mut state = loaded();
        assert!(!state.is_dirty());
        state.set_value("status", json!("Closed"), SetOptions::USER);
        assert!(state.is_dirty());
        assert!(state.is_user_dirty("status"));
        state.set_value("status", json!("Open"), SetOptions::USER);
        assert!(!state.is_dirty());
        assert!(!state.is_user_dirty("status"));
    }

    #[test]
    fn engine_writes_are_net_changes_but_not_user_dirty() {
        let mut state = loaded();
        state.set_value("remarks", json!("fetched"), SetOptions::ENGINE);
        assert!(state.is_dirty());
        assert!(!state.has_user_edits());
        assert_eq!(state.diff_payload(|_| true).len(), 1);
    }

    #[test]
    fn blank_string_equals_null() {
        let mut state = loaded();
        state.set_value("remarks", json!(""), SetOptions::USER);
        assert!(!state.is_dirty());
        assert!(state.diff_payload(|_| true).is_empty());
    }

    #[test]
    fn diff_and_full_payload() {
        let mut state = loaded();
        state.set_value("qty", json!(5), SetOptions::USER);
        let diff = state.diff_payload(|_| true);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["qty"], json!(5));
        assert_eq!(state.changed_fields(), vec!["qty"]);
        let full = state.build_submit_payload(|name| name != "remarks");
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn commit_moves_baseline() {
        let mut state = loaded();
        state.set_value("qty", json!(9), SetOptions::USER);
        let saved = state.values().clone();
        state.commit(saved);
        assert!(!state.is_dirty());
        assert!(!state.has_user_edits());
    }

    #[test]
    fn baseline_write_is_clean() {
        let mut state = loaded();
        state.set_value("status", json!("Renamed"), SetOptions::USER);
        state.set_baseline("status", json!("Renamed"));
        assert!(!state.is_dirty());
        assert!(!state.is_user_dirty("status"));
    }

    #[test]
    fn reset_discards_edits() {
        let mut state = loaded();
        state.set_value("qty", json!(9), SetOptions::USER);
        state.reset();
        assert_eq!(state.get("qty"), Some(&json!(2)));
        assert!(!state.is_dirty());
    }
}
