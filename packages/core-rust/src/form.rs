//! `FormCore`: a schema bound to one document's values.
//!
//! Every mutation goes through here, so a write is always followed by its
//! hooks, then the sync rules, then re-evaluation. Remote work is not done
//! here; callers use the returned [`ChangeSet`] to decide what to schedule.

use std::sync::Arc;

use serde_json::Value;

use crate::dispatch::{render, TabDescriptor};
use crate::error::FormError;
use crate::evaluator::{evaluate, evaluate_all, FieldState, FieldStates};
use crate::filters::{resolve_filters, Filters};
use crate::matrix::{CellState, MatrixGrid};
use crate::schema::{FieldKind, FieldSpec, MatrixSpec, Naming, Schema, TableSpec};
use crate::state::{FormState, SetOptions};
use crate::table::{self, ROW_KEY};
use crate::validate::{validate, FieldError};
use crate::value::{as_id, is_empty, is_truthy, Row, RowScope, Values};

/// Record property holding the document id.
pub const NAME_KEY: &str = "name";
/// Record property holding the optimistic-concurrency token.
pub const MODIFIED_KEY: &str = "modified";

/// Fields whose stored value changed during one mutation, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changed: Vec<String>,
}

impl ChangeSet {
    fn push(&mut self, name: &str) {
        if !self.contains(name) {
            self.changed.push(name.to_string());
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.changed.iter().any(|c| c == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(String::as_str)
    }

    /// Appends the fields of `other` not already present.
    pub fn merge(&mut self, other: ChangeSet) {
        for name in other.changed {
            self.push(&name);
        }
    }
}

/// A pending rename of a document named by one of its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// Schema + values + evaluated field states of one document.
#[derive(Debug, Clone)]
pub struct FormCore {
    schema: Arc<Schema>,
    state: FormState,
    states: FieldStates,
}

impl FormCore {
    /// A form for a document not yet saved. Fields start at their defaults.
    #[must_use]
    pub fn new_document(schema: Arc<Schema>) -> Self {
        let values = seed(&schema, Values::new(), true);
        Self::with_values(schema, values)
    }

    /// A form over a record loaded from the server.
    ///
    /// Properties the schema does not name (`name`, `modified`, `docstatus`)
    /// are kept so conditions can read them, but are never submitted.
    #[must_use]
    pub fn load(schema: Arc<Schema>, record: Values) -> Self {
        let values = seed(&schema, record, false);
        Self::with_values(schema, values)
    }

    fn with_values(schema: Arc<Schema>, values: Values) -> Self {
        let state = FormState::new(values);
        let states = evaluate_all(&schema, &state);
        Self {
            schema,
            state,
            states,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn state(&self) -> &FormState {
        &self.state
    }

    #[must_use]
    pub fn values(&self) -> &Values {
        self.state.values()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.state.get(name)
    }

    #[must_use]
    pub fn field_states(&self) -> &FieldStates {
        &self.states
    }

    #[must_use]
    pub fn field_state(&self, name: &str) -> FieldState {
        self.states.get(name).copied().unwrap_or(FieldState::HIDDEN)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    #[must_use]
    pub fn has_user_edits(&self) -> bool {
        self.state.has_user_edits()
    }

    /// Server id, `None` for a document that was never saved.
    #[must_use]
    pub fn document_name(&self) -> Option<String> {
        self.state.get(NAME_KEY).and_then(as_id)
    }

    #[must_use]
    pub fn modified(&self) -> Option<&Value> {
        self.state.get(MODIFIED_KEY).filter(|v| !v.is_null())
    }

    /// Writes one field and runs everything that follows from it.
    ///
    /// User writes (`mark_dirty`) run the field's on-change hooks; engine
    /// writes do not, and hook writes never trigger further hooks.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownField`] or [`FormError::NotData`] when `name` is not
    /// a data field of the schema.
    pub fn set_value(&mut self, name: &str, value: Value, opts: SetOptions) -> Result<ChangeSet, FormError> {
        let schema = Arc::clone(&self.schema);
        let field = data_field(&schema, name)?;
        let mut changes = ChangeSet::default();
        if !self.write(field, value, opts) {
            return Ok(changes);
        }
        changes.push(name);

        if opts.mark_dirty {
            let new_value = self.state.get(name).cloned().unwrap_or(Value::Null);
            for hook in &field.on_change {
                for (target, value) in hook.run(&new_value, self.state.values()) {
                    match data_field(&schema, &target) {
                        Ok(target_field) => {
                            if self.write(target_field, value, opts) {
                                changes.push(&target);
                            }
                        }
                        Err(error) => {
                            tracing::warn!(field = %name, target = %target, %error, "on-change hook write ignored");
                        }
                    }
                }
            }
        }

        self.apply_sync_rules(&mut changes);
        self.states = evaluate_all(&schema, &self.state);
        Ok(changes)
    }

    fn write(&mut self, field: &FieldSpec, value: Value, opts: SetOptions) -> bool {
        let value = normalize(field, value);
        self.state.set_value(&field.name, value, opts)
    }

    fn apply_sync_rules(&mut self, changes: &mut ChangeSet) {
        for target in sync_selections(&self.schema, &mut self.state) {
            changes.push(&target);
        }
    }

    /// Filters a search for link field `name` must carry right now.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownField`] or [`FormError::WrongKind`] for non-link fields.
    pub fn link_filters(&self, name: &str) -> Result<Filters, FormError> {
        let field = self.field(name)?;
        match &field.kind {
            FieldKind::Link { .. } => Ok(resolve_filters(field, &self.state)),
            _ => Err(wrong_kind(name, "link")),
        }
    }

    /// Target doctype of link field `name`.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] for non-link fields.
    pub fn link_doctype(&self, name: &str) -> Result<&str, FormError> {
        match &self.field(name)?.kind {
            FieldKind::Link { doctype, .. } => Ok(doctype),
            _ => Err(wrong_kind(name, "link")),
        }
    }

    fn field(&self, name: &str) -> Result<&FieldSpec, FormError> {
        self.schema.field(name).ok_or_else(|| FormError::UnknownField {
            name: name.to_string(),
        })
    }

    // -- child tables -----------------------------------------------------

    /// Current rows of table `name`.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a user-editable table.
    pub fn rows(&self, name: &str) -> Result<Vec<Row>, FormError> {
        table_spec(&self.schema, name)?;
        Ok(table::rows(self.state.get(name)))
    }

    /// Appends a row seeded with column defaults, then `init`.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a user-editable table.
    pub fn add_row(&mut self, name: &str, init: Row) -> Result<ChangeSet, FormError> {
        let schema = Arc::clone(&self.schema);
        let spec = table_spec(&schema, name)?;
        let mut rows = table::rows(self.state.get(name));
        rows.push(table::new_row(spec, init));
        self.set_value(name, table::to_value(rows), SetOptions::USER)
    }

    /// Removes the row at `index`.
    ///
    /// # Errors
    ///
    /// [`FormError::RowOutOfRange`] for a bad index.
    pub fn remove_row(&mut self, name: &str, index: usize) -> Result<ChangeSet, FormError> {
        table_spec(&self.schema, name)?;
        let mut rows = table::rows(self.state.get(name));
        check_index(name, index, rows.len())?;
        rows.remove(index);
        self.set_value(name, table::to_value(rows), SetOptions::USER)
    }

    /// Writes one cell.
    ///
    /// # Errors
    ///
    /// [`FormError::RowOutOfRange`] or [`FormError::UnknownColumn`].
    pub fn set_cell(&mut self, name: &str, index: usize, column: &str, value: Value) -> Result<ChangeSet, FormError> {
        let schema = Arc::clone(&self.schema);
        let spec = table_spec(&schema, name)?;
        let Some(column_spec) = spec
            .columns
            .iter()
            .find(|c| c.name == column && c.kind.carries_data())
        else {
            return Err(FormError::UnknownColumn {
                table: name.to_string(),
                column: column.to_string(),
            });
        };
        let mut rows = table::rows(self.state.get(name));
        check_index(name, index, rows.len())?;
        rows[index].insert(column.to_string(), normalize(column_spec, value));
        self.set_value(name, table::to_value(rows), SetOptions::USER)
    }

    /// Field states of the columns of one row, evaluated against the row
    /// layered over the form.
    ///
    /// # Errors
    ///
    /// [`FormError::RowOutOfRange`] for a bad index.
    pub fn row_field_states(&self, name: &str, index: usize) -> Result<FieldStates, FormError> {
        let spec = table_spec(&self.schema, name)?;
        let rows = table::rows(self.state.get(name));
        check_index(name, index, rows.len())?;
        let scope = RowScope {
            row: &rows[index],
            parent: &self.state,
        };
        Ok(spec
            .columns
            .iter()
            .map(|c| (c.name.clone(), evaluate(c, &scope)))
            .collect())
    }

    /// Replaces the links of a multi-select table, keeping rows that survive.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a multi-select table.
    pub fn set_links(&mut self, name: &str, ids: &[&str]) -> Result<ChangeSet, FormError> {
        let FieldKind::TableMultiSelect {
            child_doctype,
            link_field,
            ..
        } = &self.field(name)?.kind
        else {
            return Err(wrong_kind(name, "multi-select table"));
        };
        let existing = table::rows(self.state.get(name));
        let rows: Vec<Row> = ids
            .iter()
            .map(|id| {
                existing
                    .iter()
                    .find(|r| r.get(link_field).and_then(Value::as_str) == Some(*id))
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut row = Row::new();
                        row.insert(link_field.clone(), Value::String((*id).to_string()));
                        table::tag_row(&mut row, child_doctype);
                        row
                    })
            })
            .collect();
        self.set_value(name, table::to_value(rows), SetOptions::USER)
    }

    // -- matrices ---------------------------------------------------------

    /// Spec and current grid of matrix `name`.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a matrix.
    pub fn matrix(&self, name: &str) -> Result<(&MatrixSpec, MatrixGrid), FormError> {
        let spec = matrix_spec(&self.schema, name)?;
        Ok((spec, MatrixGrid::from_value(spec, self.state.get(name))))
    }

    /// Current values of the matrix's trigger fields, or `None` while any is empty.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a matrix.
    pub fn matrix_triggers(&self, name: &str) -> Result<Option<Values>, FormError> {
        let spec = matrix_spec(&self.schema, name)?;
        let mut triggers = Values::new();
        for trigger in &spec.trigger_fields {
            match self.state.get(trigger) {
                Some(value) if !is_empty(value) => {
                    triggers.insert(trigger.clone(), value.clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(triggers))
    }

    /// User edit of one matrix cell.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownCell`] when the pair is not in the grid.
    pub fn set_matrix_cell(
        &mut self,
        name: &str,
        row: &str,
        column: &str,
        state: CellState,
        note: Option<String>,
    ) -> Result<ChangeSet, FormError> {
        let schema = Arc::clone(&self.schema);
        let spec = matrix_spec(&schema, name)?;
        let mut grid = MatrixGrid::from_value(spec, self.state.get(name));
        grid.set_cell(name, row, column, state, note)?;
        self.set_value(name, grid.to_value(spec), SetOptions::USER)
    }

    /// Regenerates the grid over new axes, preserving surviving cells.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a matrix.
    pub fn apply_matrix_axes(
        &mut self,
        name: &str,
        rows: Vec<String>,
        columns: Vec<String>,
    ) -> Result<ChangeSet, FormError> {
        let schema = Arc::clone(&self.schema);
        let spec = matrix_spec(&schema, name)?;
        let grid = MatrixGrid::from_value(spec, self.state.get(name)).regenerate(rows, columns);
        self.set_value(name, grid.to_value(spec), SetOptions::ENGINE)
    }

    /// Empties the grid (a trigger became empty).
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a matrix.
    pub fn clear_matrix(&mut self, name: &str) -> Result<ChangeSet, FormError> {
        matrix_spec(&self.schema, name)?;
        self.set_value(name, Value::Array(Vec::new()), SetOptions::ENGINE)
    }

    // -- validation, rendering, payloads ----------------------------------

    #[must_use]
    pub fn validate(&self) -> Vec<FieldError> {
        validate(&self.schema, &self.states, &self.state)
    }

    #[must_use]
    pub fn render(&self) -> Vec<TabDescriptor> {
        render(&self.schema, self.state.values(), &self.states)
    }

    /// Every data field except `exclude`, in submit form.
    #[must_use]
    pub fn submit_payload(&self, exclude: &[&str]) -> Values {
        let payload = self.state.build_submit_payload(|name| self.submittable(name, exclude));
        self.pack(payload)
    }

    /// Net changes only, in submit form. Empty when nothing changed.
    #[must_use]
    pub fn diff_payload(&self, exclude: &[&str]) -> Values {
        let payload = self.state.diff_payload(|name| self.submittable(name, exclude));
        self.pack(payload)
    }

    fn submittable(&self, name: &str, exclude: &[&str]) -> bool {
        !exclude.contains(&name) && self.schema.field(name).is_some_and(|f| f.kind.carries_data())
    }

    fn pack(&self, payload: Values) -> Values {
        payload
            .into_iter()
            .map(|(name, value)| {
                let packed = match self.schema.field(&name).map(|f| &f.kind) {
                    Some(FieldKind::Table(spec)) => {
                        table::submit_rows(&table::rows(Some(&value)), &spec.child_doctype, &spec.columns)
                    }
                    Some(FieldKind::TableMultiSelect { child_doctype, .. }) => {
                        table::submit_rows(&table::rows(Some(&value)), child_doctype, &[])
                    }
                    Some(FieldKind::Matrix(spec)) => crate::matrix::submit_rows(spec, Some(&value)),
                    _ => value,
                };
                (name, packed)
            })
            .collect()
    }

    /// Rename implied by an edit of the naming field, if any.
    #[must_use]
    pub fn pending_rename(&self) -> Option<Rename> {
        let Naming::ByField { field } = self.schema.naming() else {
            return None;
        };
        let from = self.document_name()?;
        let to = self.state.get(field).and_then(as_id)?;
        (from != to).then_some(Rename { from, to })
    }

    /// Adopts a new server id after a successful rename.
    pub fn adopt_name(&mut self, name: &str) {
        let id = Value::String(name.to_string());
        self.state.set_baseline(NAME_KEY, id.clone());
        if let Naming::ByField { field } = self.schema.naming() {
            let field = field.clone();
            self.state.set_baseline(&field, id);
        }
    }

    /// Adopts the record returned by a save as the new baseline.
    pub fn commit(&mut self, record: Values) {
        let keyed = rekey(&self.state, seed(&self.schema, record, false));
        self.state.commit(keyed);
        self.states = evaluate_all(&self.schema, &self.state);
    }

    /// Discards all edits.
    pub fn reset(&mut self) {
        self.state.reset();
        self.states = evaluate_all(&self.schema, &self.state);
    }
}

fn data_field<'a>(schema: &'a Schema, name: &str) -> Result<&'a FieldSpec, FormError> {
    let field = schema.field(name).ok_or_else(|| FormError::UnknownField {
        name: name.to_string(),
    })?;
    if field.kind.carries_data() {
        Ok(field)
    } else {
        Err(FormError::NotData {
            name: name.to_string(),
        })
    }
}

fn table_spec<'a>(schema: &'a Schema, name: &str) -> Result<&'a TableSpec, FormError> {
    match schema.field(name).map(|f| &f.kind) {
        Some(FieldKind::Table(spec)) => Ok(spec),
        Some(_) => Err(wrong_kind(name, "table")),
        None => Err(FormError::UnknownField {
            name: name.to_string(),
        }),
    }
}

fn matrix_spec<'a>(schema: &'a Schema, name: &str) -> Result<&'a MatrixSpec, FormError> {
    match schema.field(name).map(|f| &f.kind) {
        Some(FieldKind::Matrix(spec)) => Ok(spec),
        Some(_) => Err(wrong_kind(name, "matrix")),
        None => Err(FormError::UnknownField {
            name: name.to_string(),
        }),
    }
}

fn wrong_kind(name: &str, expected: &'static str) -> FormError {
    FormError::WrongKind {
        name: name.to_string(),
        expected,
    }
}

fn check_index(table: &str, index: usize, len: usize) -> Result<(), FormError> {
    if index < len {
        Ok(())
    } else {
        Err(FormError::RowOutOfRange {
            table: table.to_string(),
            index,
            len,
        })
    }
}

/// Table-like values are always arrays of tagged rows; null becomes the
/// kind's empty value.
fn normalize(field: &FieldSpec, value: Value) -> Value {
    if value.is_null() {
        return field.kind.empty_value();
    }
    match &field.kind {
        FieldKind::Table(TableSpec { child_doctype, .. }) | FieldKind::TableMultiSelect { child_doctype, .. } => {
            let rows = table::rows(Some(&value))
                .into_iter()
                .map(|mut row| {
                    table::tag_row(&mut row, child_doctype);
                    row
                })
                .collect();
            table::to_value(rows)
        }
        FieldKind::Check => Value::from(u8::from(is_truthy(&value))),
        _ => value,
    }
}

/// Initial values: the record as given, every data field present, derived
/// selection tables computed. `defaults` applies field defaults (new
/// documents only).
fn seed(schema: &Schema, mut values: Values, defaults: bool) -> Values {
    for field in schema.data_fields() {
        let current = values.remove(&field.name).filter(|v| !v.is_null());
        let value = match current {
            Some(value) => normalize(field, value),
            None if defaults => field
                .default
                .clone()
                .map_or_else(|| field.kind.empty_value(), |d| normalize(field, d)),
            None => field.kind.empty_value(),
        };
        values.insert(field.name.clone(), value);
    }
    let mut state = FormState::new(values);
    sync_selections(schema, &mut state);
    state.values().clone()
}

/// Recomputes every derived selection table, writing only those whose rows
/// differ structurally. Returns the tables written.
fn sync_selections(schema: &Schema, state: &mut FormState) -> Vec<String> {
    let mut written = Vec::new();
    for rule in schema.sync_rules() {
        let Some(doctype) = schema.field(&rule.target_table).and_then(|f| f.kind.child_doctype()) else {
            continue;
        };
        let source = table::rows(state.get(&rule.source_table));
        let existing = table::rows(state.get(&rule.target_table));
        let derived = table::derive_selection(rule, &source, &existing, doctype, &*state);
        if !table::rows_equivalent(&derived, &existing) {
            state.set_value(&rule.target_table, table::to_value(derived), SetOptions::ENGINE);
            written.push(rule.target_table.clone());
        }
    }
    written
}

/// Carries row keys over from the previous state where the saved rows line
/// up, so a commit does not churn row identities.
fn rekey(previous: &FormState, mut record: Values) -> Values {
    for (name, value) in &mut record {
        let Value::Array(rows) = value else {
            continue;
        };
        let Some(Value::Array(old)) = previous.get(name) else {
            continue;
        };
        if rows.len() != old.len() {
            continue;
        }
        for (row, old_row) in rows.iter_mut().zip(old) {
            if let (Some(row), Some(key)) = (row.as_object_mut(), old_row.get(ROW_KEY)) {
                row.insert(ROW_KEY.to_string(), key.clone());
            }
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::condition::Condition;
    use crate::filters::LinkFilter;
    use crate::hooks::ChangeHook;
    use crate::schema::{SchemaDef, SyncRule, TabbedLayout};

    fn interchange() -> Arc<Schema> {
        let motor = Condition::expr("which_asset_to_interchange == 'Motor'");
        let pump = Condition::expr("which_asset_to_interchange == 'Pump'");
        Arc::new(
            Schema::new(SchemaDef {
                doctype: "Asset Interchange".into(),
                tabs: vec![TabbedLayout::new(
                    "Details",
                    vec![
                        FieldSpec::select("which_asset_to_interchange", &["Motor", "Pump"])
                            .on_change(ChangeHook::clear_when(motor.clone(), &["pump_asset"]))
                            .on_change(ChangeHook::clear_when(pump.clone(), &["motor_asset"])),
                        FieldSpec::link("lis_name", "Lift Irrigation Scheme"),
                        FieldSpec::new(
                            "stage",
                            FieldKind::Link {
                                doctype: "Stage No".into(),
                                filters: vec![LinkFilter::mapped("lis_name", "lis_name")],
                            },
                        ),
                        FieldSpec::section("motor_section").display_depends_on(motor.clone()),
                        FieldSpec::link("motor_asset", "Asset").display_depends_on(motor),
                        FieldSpec::section("pump_section").display_depends_on(pump.clone()),
                        FieldSpec::link("pump_asset", "Asset").display_depends_on(pump),
                        FieldSpec::data("pump_no").fetch_from("pump_asset", "Asset", "asset_name"),
                        FieldSpec::new("remarks", FieldKind::SmallText).with_default(json!("none")),
                    ],
                )],
                naming: Naming::Autoname,
                sync_rules: Vec::new(),
            })
            .unwrap(),
        )
    }

    fn items_schema() -> Arc<Schema> {
        let columns = vec![
            FieldSpec::link("item_code", "Item").required(),
            FieldSpec::new("qty", FieldKind::Float { min: Some(0.0), max: None, precision: None }),
            FieldSpec::new("checked", FieldKind::Check),
        ];
        Arc::new(
            Schema::new(SchemaDef {
                doctype: "Material Request".into(),
                tabs: vec![TabbedLayout::new(
                    "Items",
                    vec![
                        FieldSpec::data("code"),
                        FieldSpec::new(
                            "items",
                            FieldKind::Table(TableSpec {
                                child_doctype: "Material Item".into(),
                                columns,
                            }),
                        ),
                        FieldSpec::new(
                            "selected",
                            FieldKind::Table(TableSpec {
                                child_doctype: "Selected Item".into(),
                                columns: vec![FieldSpec::link("item", "Item")],
                            }),
                        ),
                    ],
                )],
                naming: Naming::ByField { field: "code".into() },
                sync_rules: vec![SyncRule {
                    source_table: "items".into(),
                    target_table: "selected".into(),
                    predicate: Condition::map([("checked", json!(true))]),
                    columns: vec![("item_code".into(), "item".into())],
                }],
            })
            .unwrap(),
        )
    }

    #[test]
    fn new_document_seeds_defaults_and_is_clean() {
        let form = FormCore::new_document(interchange());
        assert_eq!(form.get("remarks"), Some(&json!("none")));
        assert_eq!(form.get("pump_asset"), Some(&Value::Null));
        assert!(!form.is_dirty());
        assert!(form.document_name().is_none());
    }

    #[test]
    fn switching_driver_clears_other_section_and_reevaluates() {
        let mut form = FormCore::new_document(interchange());
        form.set_value("which_asset_to_interchange", json!("Pump"), SetOptions::USER)
            .unwrap();
        form.set_value("pump_asset", json!("AST-001"), SetOptions::USER).unwrap();
        assert!(form.field_state("pump_asset").visible);

        let changes = form
            .set_value("which_asset_to_interchange", json!("Motor"), SetOptions::USER)
            .unwrap();
        assert!(changes.contains("pump_asset"));
        assert_eq!(form.get("pump_asset"), Some(&Value::Null));
        assert!(form.field_state("motor_asset").visible);
        assert!(!form.field_state("pump_asset").visible);
    }

    #[test]
    fn engine_writes_skip_hooks() {
        let mut form = FormCore::new_document(interchange());
        form.set_value("pump_asset", json!("AST-001"), SetOptions::USER).unwrap();
        let changes = form
            .set_value("which_asset_to_interchange", json!("Motor"), SetOptions::ENGINE)
            .unwrap();
        assert!(!changes.contains("pump_asset"));
        assert_eq!(form.get("pump_asset"), Some(&json!("AST-001")));
    }

    #[test]
    fn rejects_layout_and_unknown_fields() {
        let mut form = FormCore::new_document(interchange());
        assert_eq!(
            form.set_value("motor_section", json!(1), SetOptions::USER),
            Err(FormError::NotData { name: "motor_section".into() })
        );
        assert!(matches!(
            form.set_value("nope", json!(1), SetOptions::USER),
            Err(FormError::UnknownField { .. })
        ));
    }

    #[test]
    fn link_filters_follow_source() {
        let mut form = FormCore::new_document(interchange());
        assert!(form.link_filters("stage").unwrap().is_empty());
        form.set_value("lis_name", json!("A"), SetOptions::USER).unwrap();
        form.set_value("lis_name", json!("B"), SetOptions::USER).unwrap();
        assert_eq!(form.link_filters("stage").unwrap().get("lis_name"), Some(&json!("B")));
        assert!(matches!(form.link_filters("remarks"), Err(FormError::WrongKind { .. })));
    }

    #[test]
    fn payload_never_contains_layout_fields() {
        let mut form = FormCore::new_document(interchange());
        form.set_value("which_asset_to_interchange", json!("Motor"), SetOptions::USER)
            .unwrap();
        let payload = form.submit_payload(&[]);
        assert!(!payload.contains_key("motor_section"));
        assert!(!payload.contains_key("pump_section"));
        assert!(payload.contains_key("remarks"));
        assert!(!form.submit_payload(&["remarks"]).contains_key("remarks"));
    }

    #[test]
    fn untouched_record_has_empty_diff() {
        let mut record = Values::new();
        record.insert("name".into(), json!("AI-0001"));
        record.insert("modified".into(), json!("2024-01-01 10:00:00"));
        record.insert("which_asset_to_interchange".into(), json!("Pump"));
        let mut form = FormCore::load(interchange(), record);
        assert!(form.diff_payload(&[]).is_empty());
        form.set_value("lis_name", json!("A"), SetOptions::USER).unwrap();
        let diff = form.diff_payload(&[]);
        assert_eq!(diff.len(), 1);
        assert!(!diff.contains_key("name") && !diff.contains_key("modified"));
    }

    #[test]
    fn table_rows_sync_into_selection() {
        let mut form = FormCore::new_document(items_schema());
        let mut init = Row::new();
        init.insert("item_code".into(), json!("PIPE"));
        form.add_row("items", init).unwrap();
        let mut init = Row::new();
        init.insert("item_code".into(), json!("VALVE"));
        form.add_row("items", init).unwrap();
        assert!(form.rows("selected").unwrap().is_empty());

        let changes = form.set_cell("items", 1, "checked", json!(true)).unwrap();
        assert!(changes.contains("selected"));
        let selected = form.rows("selected").unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["item"], json!("VALVE"));

        let changes = form.set_cell("items", 0, "qty", json!("2")).unwrap();
        assert!(!changes.contains("selected"));

        form.remove_row("items", 1).unwrap();
        assert!(form.rows("selected").unwrap().is_empty());
        assert!(matches!(form.remove_row("items", 5), Err(FormError::RowOutOfRange { .. })));
        assert!(matches!(
            form.set_cell("items", 0, "colour", json!(1)),
            Err(FormError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn table_payload_is_coerced_and_unkeyed() {
        let mut form = FormCore::new_document(items_schema());
        let mut init = Row::new();
        init.insert("item_code".into(), json!("PIPE"));
        init.insert("qty".into(), json!("abc"));
        form.add_row("items", init).unwrap();
        let payload = form.submit_payload(&[]);
        let row = &payload["items"][0];
        assert_eq!(row["qty"], json!(0));
        assert_eq!(row["doctype"], json!("Material Item"));
        assert!(row.get(ROW_KEY).is_none());
    }

    #[test]
    fn rename_is_detected_and_adopted() {
        let mut record = Values::new();
        record.insert("name".into(), json!("PC-0001"));
        record.insert("code".into(), json!("PC-0001"));
        let mut form = FormCore::load(items_schema(), record);
        assert!(form.pending_rename().is_none());
        form.set_value("code", json!("PC-0002"), SetOptions::USER).unwrap();
        assert_eq!(
            form.pending_rename(),
            Some(Rename {
                from: "PC-0001".into(),
                to: "PC-0002".into()
            })
        );
        form.adopt_name("PC-0002");
        assert!(form.pending_rename().is_none());
        assert_eq!(form.document_name().as_deref(), Some("PC-0002"));
        assert!(form.diff_payload(&[]).is_empty());
    }

    #[test]
    fn commit_keeps_row_keys() {
        let mut form = FormCore::new_document(items_schema());
        form.add_row("items", Row::new()).unwrap();
        let key = form.rows("items").unwrap()[0][ROW_KEY].clone();
        let mut saved = form.submit_payload(&[]);
        saved.insert("name".into(), json!("MR-1"));
        form.commit(saved);
        assert!(!form.is_dirty());
        assert_eq!(form.rows("items").unwrap()[0][ROW_KEY], key);
        assert_eq!(form.document_name().as_deref(), Some("MR-1"));
    }
}
