//! Cross-product checklist grids.
//!
//! A matrix field's value is a list of rows, one per `(row id, column id)`
//! pair, each holding a tri-state [`CellState`] and a note that only exists
//! in the `fail` state. Rows are generated, never added by the user.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FormError;
use crate::schema::MatrixSpec;
use crate::table::{DOCTYPE_KEY, IDX_KEY};
use crate::value::{as_id, Row};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellState {
    Pass,
    Fail,
    #[default]
    Neutral,
}

impl CellState {
    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
            Some("pass") => CellState::Pass,
            Some("fail") => CellState::Fail,
            _ => CellState::Neutral,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CellState::Pass => "pass",
            CellState::Fail => "fail",
            CellState::Neutral => "neutral",
        }
    }
}

/// One cell of the grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatrixCell {
    pub state: CellState,
    /// Only ever `Some` while `state` is [`CellState::Fail`].
    pub note: Option<String>,
}

impl MatrixCell {
    /// Sets the state, dropping the note when leaving `Fail`.
    pub fn set_state(&mut self, state: CellState) {
        self.state = state;
        if state != CellState::Fail {
            self.note = None;
        }
    }

    /// Sets the note. Ignored unless the cell is in `Fail`; an empty note clears it.
    pub fn set_note(&mut self, note: Option<String>) {
        if self.state == CellState::Fail {
            self.note = note.filter(|n| !n.trim().is_empty());
        }
    }
}

/// Grid of cells addressed by `(row id, column id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixGrid {
    rows: Vec<String>,
    columns: Vec<String>,
    cells: BTreeMap<(String, String), MatrixCell>,
}

impl MatrixGrid {
    /// Neutral grid over the given axes. Duplicate ids are dropped.
    #[must_use]
    pub fn new(rows: Vec<String>, columns: Vec<String>) -> Self {
        let rows = dedup(rows);
        let columns = dedup(columns);
        let cells = rows
            .iter()
            .flat_map(|r| columns.iter().map(move |c| ((r.clone(), c.clone()), MatrixCell::default())))
            .collect();
        Self { rows, columns, cells }
    }

    /// Rebuilds a grid from a stored matrix value. Axis order follows first appearance.
    #[must_use]
    pub fn from_value(spec: &MatrixSpec, value: Option<&Value>) -> Self {
        let mut grid = Self::default();
        let Some(Value::Array(items)) = value else {
            return grid;
        };
        for row in items.iter().filter_map(Value::as_object) {
            let (Some(r), Some(c)) = (
                row.get(&spec.row_field).and_then(as_id),
                row.get(&spec.column_field).and_then(as_id),
            ) else {
                continue;
            };
            if !grid.rows.contains(&r) {
                grid.rows.push(r.clone());
            }
            if !grid.columns.contains(&c) {
                grid.columns.push(c.clone());
            }
            let mut cell = MatrixCell::default();
            cell.set_state(CellState::parse(row.get(&spec.state_field)));
            cell.set_note(row.get(&spec.note_field).and_then(Value::as_str).map(str::to_string));
            grid.cells.insert((r, c), cell);
        }
        for r in &grid.rows {
            for c in &grid.columns {
                grid.cells.entry((r.clone(), c.clone())).or_default();
            }
        }
        grid
    }

    /// Grid over new axes. Cells of pairs present in both grids are kept;
    /// pairs that no longer exist are dropped; new pairs start neutral.
    #[must_use]
    pub fn regenerate(&self, rows: Vec<String>, columns: Vec<String>) -> Self {
        let mut next = Self::new(rows, columns);
        for (pair, cell) in &mut next.cells {
            if let Some(previous) = self.cells.get(pair) {
                cell.clone_from(previous);
            }
        }
        next
    }

    #[must_use]
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cell(&self, row: &str, column: &str) -> Option<&MatrixCell> {
        self.cells.get(&(row.to_string(), column.to_string()))
    }

    /// Updates one cell.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownCell`] when the pair is not part of the grid.
    pub fn set_cell(
        &mut self,
        matrix: &str,
        row: &str,
        column: &str,
        state: CellState,
        note: Option<String>,
    ) -> Result<(), FormError> {
        let cell = self
            .cells
            .get_mut(&(row.to_string(), column.to_string()))
            .ok_or_else(|| FormError::UnknownCell {
                matrix: matrix.to_string(),
                row: row.to_string(),
                column: column.to_string(),
            })?;
        cell.set_state(state);
        cell.set_note(note);
        Ok(())
    }

    /// Stored form, rows outer, columns inner.
    #[must_use]
    pub fn to_value(&self, spec: &MatrixSpec) -> Value {
        let rows = self
            .rows
            .iter()
            .flat_map(|r| self.columns.iter().map(move |c| (r, c)))
            .map(|(r, c)| {
                let cell = self
                    .cells
                    .get(&(r.clone(), c.clone()))
                    .cloned()
                    .unwrap_or_default();
                let mut row = Row::new();
                row.insert(spec.row_field.clone(), Value::String(r.clone()));
                row.insert(spec.column_field.clone(), Value::String(c.clone()));
                row.insert(spec.state_field.clone(), Value::String(cell.state.as_str().to_string()));
                if let Some(note) = cell.note {
                    row.insert(spec.note_field.clone(), Value::String(note));
                }
                row.insert(DOCTYPE_KEY.to_string(), Value::String(spec.child_doctype.clone()));
                Value::Object(row)
            })
            .collect();
        Value::Array(rows)
    }
}

/// Submit form of a matrix value: normalized cells with `idx` assigned.
#[must_use]
pub fn submit_rows(spec: &MatrixSpec, value: Option<&Value>) -> Value {
    let Value::Array(rows) = MatrixGrid::from_value(spec, value).to_value(spec) else {
        return Value::Array(Vec::new());
    };
    let rows = rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(mut row) => {
                row.insert(IDX_KEY.to_string(), Value::from(i + 1));
                Value::Object(row)
            }
            other => other,
        })
        .collect();
    Value::Array(rows)
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn spec() -> MatrixSpec {
        MatrixSpec {
            child_doctype: "Checklist Entry".into(),
            row_field: "asset".into(),
            column_field: "parameter".into(),
            trigger_fields: vec!["lis_name".into(), "stage".into()],
            rows_method: "checklist.get_assets".into(),
            columns_method: "checklist.get_parameters".into(),
            state_field: "status".into(),
            note_field: "note".into(),
        }
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn leaving_fail_clears_note() {
        let mut grid = MatrixGrid::new(ids(&["A1"]), ids(&["Voltage"]));
        grid.set_cell("checks", "A1", "Voltage", CellState::Fail, Some("low".into()))
            .unwrap();
        assert_eq!(grid.cell("A1", "Voltage").unwrap().note.as_deref(), Some("low"));
        grid.set_cell("checks", "A1", "Voltage", CellState::Pass, None).unwrap();
        assert_eq!(grid.cell("A1", "Voltage").unwrap().note, None);
    }

    #[test]
    fn note_outside_fail_is_ignored() {
        let mut grid = MatrixGrid::new(ids(&["A1"]), ids(&["Voltage"]));
        grid.set_cell("checks", "A1", "Voltage", CellState::Pass, Some("x".into()))
            .unwrap();
        assert_eq!(grid.cell("A1", "Voltage").unwrap().note, None);
    }

    #[test]
    fn unknown_cell_is_an_error() {
        let mut grid = MatrixGrid::new(ids(&["A1"]), ids(&["Voltage"]));
        assert!(matches!(
            grid.set_cell("checks", "A9", "Voltage", CellState::Pass, None),
            Err(FormError::UnknownCell { .. })
        ));
    }

    #[test]
    fn value_round_trip_persists_note_only_in_fail() {
        let spec = spec();
        let mut grid = MatrixGrid::new(ids(&["A1", "A2"]), ids(&["Voltage", "Noise"]));
        grid.set_cell("checks", "A1", "Noise", CellState::Fail, Some("rattle".into()))
            .unwrap();
        grid.set_cell("checks", "A2", "Voltage", CellState::Pass, None).unwrap();
        let value = grid.to_value(&spec);
        assert_eq!(value.as_array().unwrap().len(), 4);
        assert_eq!(value[1]["note"], json!("rattle"));
        assert!(value[2].get("note").is_none());
        assert_eq!(value[2]["status"], json!("pass"));
        assert_eq!(MatrixGrid::from_value(&spec, Some(&value)), grid);

        let submitted = submit_rows(&spec, Some(&value));
        assert_eq!(submitted[3]["idx"], json!(4));
        assert_eq!(submitted[0]["doctype"], json!("Checklist Entry"));
    }

    #[test]
    fn stored_note_on_passing_cell_is_dropped() {
        let value = json!([
            {"asset": "A1", "parameter": "Voltage", "status": "Pass", "note": "stale"}
        ]);
        let grid = MatrixGrid::from_value(&spec(), Some(&value));
        let cell = grid.cell("A1", "Voltage").unwrap();
        assert_eq!(cell.state, CellState::Pass);
        assert_eq!(cell.note, None);
    }

    #[test]
    fn state_and_note_columns_are_configurable() {
        let spec: MatrixSpec = serde_json::from_value(json!({
            "child_doctype": "Checklist Entry",
            "row_field": "asset",
            "column_field": "parameter",
            "trigger_fields": ["lis_name"],
            "rows_method": "rows",
            "columns_method": "cols",
            "state_field": "result",
            "note_field": "remarks",
        }))
        .unwrap();
        let mut grid = MatrixGrid::new(ids(&["A1"]), ids(&["Voltage"]));
        grid.set_cell("checks", "A1", "Voltage", CellState::Fail, Some("low".into()))
            .unwrap();
        let value = grid.to_value(&spec);
        assert_eq!(value[0]["result"], json!("fail"));
        assert_eq!(value[0]["remarks"], json!("low"));
        assert!(value[0].get("status").is_none());
        assert_eq!(MatrixGrid::from_value(&spec, Some(&value)), grid);

        let defaulted: MatrixSpec = serde_json::from_value(json!({
            "child_doctype": "Checklist Entry",
            "row_field": "asset",
            "column_field": "parameter",
            "trigger_fields": [],
            "rows_method": "rows",
            "columns_method": "cols",
        }))
        .unwrap();
        assert_eq!(defaulted.state_field, "status");
        assert_eq!(defaulted.note_field, "note");
    }

    fn state() -> impl Strategy<Value = CellState> {
        prop_oneof![
            Just(CellState::Pass),
            Just(CellState::Fail),
            Just(CellState::Neutral)
        ]
    }

    proptest! {
        #[test]
        fn regeneration_preserves_surviving_pairs(
            before_rows in proptest::collection::btree_set("[a-d]", 0..4),
            before_cols in proptest::collection::btree_set("[p-s]", 0..4),
            after_rows in proptest::collection::btree_set("[a-d]", 0..4),
            after_cols in proptest::collection::btree_set("[p-s]", 0..4),
            states in proptest::collection::vec(state(), 16),
        ) {
            let mut grid = MatrixGrid::new(
                before_rows.iter().cloned().collect(),
                before_cols.iter().cloned().collect(),
            );
            let pairs: Vec<(String, String)> = before_rows
                .iter()
                .flat_map(|r| before_cols.iter().map(move |c| (r.clone(), c.clone())))
                .collect();
            for ((r, c), s) in pairs.iter().zip(&states) {
                grid.set_cell("m", r, c, *s, Some("n".into())).unwrap();
            }

            let next = grid.regenerate(
                after_rows.iter().cloned().collect(),
                after_cols.iter().cloned().collect(),
            );

            prop_assert_eq!(next.cells.len(), after_rows.len() * after_cols.len());
            for r in &after_rows {
                for c in &after_cols {
                    let cell = next.cell(r, c).unwrap();
                    match grid.cell(r, c) {
                        Some(old) => prop_assert_eq!(cell, old),
                        None => prop_assert_eq!(cell, &MatrixCell::default()),
                    }
                }
            }
            for (r, c) in &pairs {
                if !(after_rows.contains(r) && after_cols.contains(c)) {
                    prop_assert!(next.cell(r, c).is_none());
                }
            }
        }
    }
}
