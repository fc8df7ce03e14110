//! Typed form schemas: tabs of fields, each field a tagged kind.
//!
//! A [`SchemaDef`] is plain data (buildable in code or loaded from JSON).
//! [`Schema::new`] validates it once at registration: unique names, resolvable
//! references, compilable patterns, and an acyclic dependency graph. Everything
//! downstream takes a `Schema` and may assume those invariants.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::error::SchemaError;
use crate::filters::LinkFilter;
use crate::graph::DependencyGraph;
use crate::hooks::ChangeHook;

// ---------------------------------------------------------------------------
// Field kinds
// ---------------------------------------------------------------------------

/// Rows of a user-editable child table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Doctype tag written into every row (required by the remote API).
    pub child_doctype: String,
    /// Shape of one row. Columns may not themselves be tables.
    pub columns: Vec<FieldSpec>,
}

/// Child table whose rows are the cross product of two remote lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Doctype tag for generated rows.
    pub child_doctype: String,
    /// Row column holding the first-axis id (e.g. `asset`).
    pub row_field: String,
    /// Row column holding the second-axis id (e.g. `parameter`).
    pub column_field: String,
    /// Form fields that must all be non-empty before rows are generated.
    pub trigger_fields: Vec<String>,
    /// Remote method returning the first-axis ids.
    pub rows_method: String,
    /// Remote method returning the second-axis ids.
    pub columns_method: String,
    /// Row column holding the cell state.
    #[serde(default = "default_state_field")]
    pub state_field: String,
    /// Row column holding the failure note.
    #[serde(default = "default_note_field")]
    pub note_field: String,
}

fn default_state_field() -> String {
    "status".to_string()
}

fn default_note_field() -> String {
    "note".to_string()
}

/// What a field is. Kind-specific parameters live on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "fieldtype")]
pub enum FieldKind {
    /// Single-line text, optionally constrained by a regex.
    Data {
        /// Regex the whole value must match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// Short multi-line text.
    SmallText,
    /// Long multi-line text.
    LongText,
    /// Integer with optional bounds.
    Int {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Decimal with optional bounds and display precision.
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision: Option<u8>,
    },
    Currency,
    Percent,
    /// Boolean checkbox (stored as 0/1).
    Check,
    Date,
    Datetime,
    Time,
    /// One of a fixed list of options.
    Select {
        options: Vec<String>,
    },
    /// Id of a document of `doctype`, chosen through a remote search.
    Link {
        doctype: String,
        #[serde(default)]
        filters: Vec<LinkFilter>,
    },
    /// User-editable child table.
    Table(TableSpec),
    /// Child table of link rows edited as a multi-select.
    TableMultiSelect {
        child_doctype: String,
        link_field: String,
        link_doctype: String,
    },
    /// Engine-generated cross-product table.
    Matrix(MatrixSpec),
    /// File attachment (URL value).
    Attach,
    /// Display-only field. `backed` fields hold data the server stores.
    ReadOnly {
        #[serde(default)]
        backed: bool,
    },
    SectionBreak,
    ColumnBreak,
    Button,
    /// Escape hatch rendered by a page-supplied widget.
    Custom {
        widget: String,
        /// Whether the widget's value is part of the document.
        #[serde(default)]
        stored: bool,
    },
}

impl FieldKind {
    /// Whether values of this kind are part of the document payload.
    #[must_use]
    pub fn carries_data(&self) -> bool {
        match self {
            FieldKind::SectionBreak | FieldKind::ColumnBreak | FieldKind::Button => false,
            FieldKind::ReadOnly { backed } => *backed,
            FieldKind::Custom { stored, .. } => *stored,
            _ => true,
        }
    }

    /// Whether this kind is a layout marker (section/column break).
    #[must_use]
    pub fn is_layout(&self) -> bool {
        matches!(self, FieldKind::SectionBreak | FieldKind::ColumnBreak)
    }

    /// Whether values are coerced to numbers on submit.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldKind::Int { .. }
                | FieldKind::Float { .. }
                | FieldKind::Currency
                | FieldKind::Percent
                | FieldKind::Check
        )
    }

    /// Whether the value is a list of child rows.
    #[must_use]
    pub fn is_table(&self) -> bool {
        matches!(
            self,
            FieldKind::Table(_) | FieldKind::TableMultiSelect { .. } | FieldKind::Matrix(_)
        )
    }

    /// Child doctype of table-like kinds.
    #[must_use]
    pub fn child_doctype(&self) -> Option<&str> {
        match self {
            FieldKind::Table(t) => Some(&t.child_doctype),
            FieldKind::TableMultiSelect { child_doctype, .. } => Some(child_doctype),
            FieldKind::Matrix(m) => Some(&m.child_doctype),
            _ => None,
        }
    }

    /// Value a field of this kind starts with when neither a default nor a
    /// server value exists.
    #[must_use]
    pub fn empty_value(&self) -> Value {
        if self.is_table() {
            Value::Array(Vec::new())
        } else if matches!(self, FieldKind::Check) {
            Value::from(0)
        } else {
            Value::Null
        }
    }
}

// ---------------------------------------------------------------------------
// FieldSpec
// ---------------------------------------------------------------------------

/// `fetchFrom`: copy `target_field` of the document named by `source_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFrom {
    /// Link field on this form holding the document id.
    pub source_field: String,
    /// Doctype of the linked document.
    pub target_doctype: String,
    /// Property to read from the linked document.
    pub target_field: String,
}

/// One form field or layout marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique key: value-store key and remote property name.
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Never shown, regardless of conditions.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_depends_on: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_depends_on: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_depends_on: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_from: Option<FetchFrom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_change: Vec<ChangeHook>,
}

impl FieldSpec {
    /// A field with the given name and kind; label defaults to the name.
    #[must_use]
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            kind,
            required: false,
            read_only: false,
            hidden: false,
            default: None,
            description: None,
            display_depends_on: None,
            required_depends_on: None,
            read_only_depends_on: None,
            fetch_from: None,
            on_change: Vec::new(),
        }
    }

    /// Plain `Data` field.
    #[must_use]
    pub fn data(name: &str) -> Self {
        Self::new(name, FieldKind::Data { pattern: None })
    }

    /// `Link` field without filters.
    #[must_use]
    pub fn link(name: &str, doctype: &str) -> Self {
        Self::new(
            name,
            FieldKind::Link {
                doctype: doctype.to_string(),
                filters: Vec::new(),
            },
        )
    }

    /// `Select` field.
    #[must_use]
    pub fn select(name: &str, options: &[&str]) -> Self {
        Self::new(
            name,
            FieldKind::Select {
                options: options.iter().map(|s| (*s).to_string()).collect(),
            },
        )
    }

    /// Layout-only section break.
    #[must_use]
    pub fn section(name: &str) -> Self {
        Self::new(name, FieldKind::SectionBreak)
    }

    /// Layout-only column break.
    #[must_use]
    pub fn column(name: &str) -> Self {
        Self::new(name, FieldKind::ColumnBreak)
    }

    #[must_use]
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn display_depends_on(mut self, condition: Condition) -> Self {
        self.display_depends_on = Some(condition);
        self
    }

    #[must_use]
    pub fn required_depends_on(mut self, condition: Condition) -> Self {
        self.required_depends_on = Some(condition);
        self
    }

    #[must_use]
    pub fn read_only_depends_on(mut self, condition: Condition) -> Self {
        self.read_only_depends_on = Some(condition);
        self
    }

    #[must_use]
    pub fn fetch_from(mut self, source_field: &str, target_doctype: &str, target_field: &str) -> Self {
        self.fetch_from = Some(FetchFrom {
            source_field: source_field.to_string(),
            target_doctype: target_doctype.to_string(),
            target_field: target_field.to_string(),
        });
        self
    }

    #[must_use]
    pub fn on_change(mut self, hook: ChangeHook) -> Self {
        self.on_change.push(hook);
        self
    }

    /// Every condition attached to this field.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        [
            &self.display_depends_on,
            &self.required_depends_on,
            &self.read_only_depends_on,
        ]
        .into_iter()
        .flatten()
    }
}

// ---------------------------------------------------------------------------
// Layout and schema definition
// ---------------------------------------------------------------------------

/// One tab: display order is field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabbedLayout {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl TabbedLayout {
    #[must_use]
    pub fn new(name: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }
}

/// How a document's id is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Naming {
    /// The server assigns the id; it never changes from the form.
    #[default]
    Autoname,
    /// The id is the value of `field`; editing it renames the document.
    ByField { field: String },
}

/// Derives a selection table from rows of another table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRule {
    /// Table whose rows are filtered.
    pub source_table: String,
    /// Table overwritten with the derived rows.
    pub target_table: String,
    /// Per-row predicate (row values shadow parent values).
    pub predicate: Condition,
    /// `(source column, target column)` pairs copied into each derived row.
    pub columns: Vec<(String, String)>,
}

/// Unvalidated schema, as written by a page or loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Remote doctype the form edits.
    pub doctype: String,
    pub tabs: Vec<TabbedLayout>,
    #[serde(default)]
    pub naming: Naming,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_rules: Vec<SyncRule>,
}

// ---------------------------------------------------------------------------
// Schema (validated)
// ---------------------------------------------------------------------------

/// A validated schema.
#[derive(Debug, Clone)]
pub struct Schema {
    def: SchemaDef,
    /// Field name -> (tab index, field index).
    index: HashMap<String, (usize, usize)>,
    /// Compiled `Data` patterns keyed by `field` or `table.column`.
    patterns: HashMap<String, Regex>,
}

impl Schema {
    /// Validates and registers a schema definition.
    ///
    /// Malformed condition expressions do not fail registration: they are
    /// logged and evaluate to `false` (field hidden, not required).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for duplicate names, dangling references,
    /// nested tables, invalid patterns, or dependency cycles.
    pub fn new(def: SchemaDef) -> Result<Self, SchemaError> {
        let mut index = HashMap::new();
        let mut patterns = HashMap::new();

        for (t, tab) in def.tabs.iter().enumerate() {
            for (f, field) in tab.fields.iter().enumerate() {
                if index.insert(field.name.clone(), (t, f)).is_some() {
                    return Err(SchemaError::DuplicateField {
                        name: field.name.clone(),
                    });
                }
                compile_pattern(&field.name, field, &mut patterns)?;
                if let FieldKind::Table(table) = &field.kind {
                    let mut seen = HashSet::new();
                    for column in &table.columns {
                        if !seen.insert(column.name.as_str()) {
                            return Err(SchemaError::DuplicateField {
                                name: format!("{}.{}", field.name, column.name),
                            });
                        }
                        if column.kind.is_table() {
                            return Err(SchemaError::NestedTable {
                                table: field.name.clone(),
                                column: column.name.clone(),
                            });
                        }
                        let key = format!("{}.{}", field.name, column.name);
                        compile_pattern(&key, column, &mut patterns)?;
                    }
                }
            }
        }

        let schema = Self {
            def,
            index,
            patterns,
        };
        schema.check_references()?;
        DependencyGraph::build(&schema).check_acyclic()?;
        schema.warn_malformed_conditions();
        Ok(schema)
    }

    fn check_references(&self) -> Result<(), SchemaError> {
        let missing = |field: &str, reference: &str, role: &'static str| {
            SchemaError::UnknownReference {
                field: field.to_string(),
                reference: reference.to_string(),
                role,
            }
        };
        for field in self.fields() {
            if let Some(fetch) = &field.fetch_from {
                if !self.index.contains_key(&fetch.source_field) {
                    return Err(missing(&field.name, &fetch.source_field, "fetch_from"));
                }
            }
            match &field.kind {
                FieldKind::Link { filters, .. } => {
                    for filter in filters {
                        if let LinkFilter::Mapped { source_field, .. } = filter {
                            if !self.index.contains_key(source_field) {
                                return Err(missing(&field.name, source_field, "filter"));
                            }
                        }
                    }
                }
                FieldKind::Matrix(matrix) => {
                    for trigger in &matrix.trigger_fields {
                        if !self.index.contains_key(trigger) {
                            return Err(missing(&field.name, trigger, "matrix trigger"));
                        }
                    }
                }
                _ => {}
            }
            for hook in &field.on_change {
                if let ChangeHook::Clear { fields, .. } = hook {
                    if let Some(unknown) = fields.iter().find(|f| !self.index.contains_key(*f)) {
                        return Err(missing(&field.name, unknown, "on_change"));
                    }
                }
            }
        }
        for rule in &self.def.sync_rules {
            for table in [&rule.source_table, &rule.target_table] {
                match self.field(table).map(|f| &f.kind) {
                    Some(FieldKind::Table(_)) => {}
                    Some(_) => {
                        return Err(SchemaError::NotATable {
                            field: table.clone(),
                        })
                    }
                    None => return Err(missing("sync_rules", table, "sync rule")),
                }
            }
        }
        if let Naming::ByField { field } = &self.def.naming {
            if !self.index.contains_key(field) {
                return Err(missing("naming", field, "naming"));
            }
        }
        Ok(())
    }

    fn warn_malformed_conditions(&self) {
        let check = |owner: &str, condition: &Condition| {
            if let Condition::Expression(expr) = condition {
                if let Some(error) = expr.error() {
                    tracing::warn!(
                        doctype = %self.def.doctype,
                        field = %owner,
                        expression = %expr.source(),
                        %error,
                        "malformed condition; field will be hidden and not required"
                    );
                }
            }
        };
        for field in self.fields() {
            field.conditions().for_each(|c| check(&field.name, c));
            if let FieldKind::Table(table) = &field.kind {
                for column in &table.columns {
                    column.conditions().for_each(|c| check(&column.name, c));
                }
            }
        }
        for rule in &self.def.sync_rules {
            check(&rule.target_table, &rule.predicate);
        }
    }

    /// Remote doctype edited by this schema.
    #[must_use]
    pub fn doctype(&self) -> &str {
        &self.def.doctype
    }

    #[must_use]
    pub fn naming(&self) -> &Naming {
        &self.def.naming
    }

    #[must_use]
    pub fn tabs(&self) -> &[TabbedLayout] {
        &self.def.tabs
    }

    #[must_use]
    pub fn sync_rules(&self) -> &[SyncRule] {
        &self.def.sync_rules
    }

    #[must_use]
    pub fn definition(&self) -> &SchemaDef {
        &self.def
    }

    /// All fields in display order (tab by tab).
    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.def.tabs.iter().flat_map(|tab| tab.fields.iter())
    }

    /// Fields that hold document data, in display order.
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields().filter(|f| f.kind.carries_data())
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index
            .get(name)
            .map(|&(t, f)| &self.def.tabs[t].fields[f])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Fields whose `fetch_from` is sourced from `source`.
    pub fn fetch_dependents<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a FieldSpec> {
        self.fields()
            .filter(move |f| f.fetch_from.as_ref().is_some_and(|ff| ff.source_field == source))
    }

    /// Link fields whose filters read `source`.
    pub fn filter_dependents<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a FieldSpec> {
        self.fields().filter(move |f| match &f.kind {
            FieldKind::Link { filters, .. } => filters.iter().any(|lf| lf.sources().contains(&source)),
            _ => false,
        })
    }

    /// Matrix fields that list `trigger` among their trigger fields.
    pub fn matrices_triggered_by<'a>(
        &'a self,
        trigger: &'a str,
    ) -> impl Iterator<Item = (&'a FieldSpec, &'a MatrixSpec)> {
        self.fields().filter_map(move |f| match &f.kind {
            FieldKind::Matrix(m) if m.trigger_fields.iter().any(|t| t == trigger) => Some((f, m)),
            _ => None,
        })
    }

    /// Compiled pattern for `field` or `table.column`.
    #[must_use]
    pub fn pattern(&self, key: &str) -> Option<&Regex> {
        self.patterns.get(key)
    }
}

fn compile_pattern(
    key: &str,
    field: &FieldSpec,
    patterns: &mut HashMap<String, Regex>,
) -> Result<(), SchemaError> {
    if let FieldKind::Data {
        pattern: Some(pattern),
    } = &field.kind
    {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|e| SchemaError::InvalidPattern {
            field: key.to_string(),
            message: e.to_string(),
        })?;
        patterns.insert(key.to_string(), regex);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn def(fields: Vec<FieldSpec>) -> SchemaDef {
        SchemaDef {
            doctype: "Asset Interchange".into(),
            tabs: vec![TabbedLayout::new("Details", fields)],
            naming: Naming::Autoname,
            sync_rules: Vec::new(),
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Schema::new(def(vec![FieldSpec::data("a"), FieldSpec::data("a")])).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { name } if name == "a"));
    }

    #[test]
    fn rejects_dangling_fetch_source() {
        let err = Schema::new(def(vec![
            FieldSpec::data("pump_no").fetch_from("pump_asset", "Asset", "asset_name")
        ]))
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownReference { role: "fetch_from", .. }));
    }

    #[test]
    fn rejects_nested_tables() {
        let inner = FieldSpec::new(
            "inner",
            FieldKind::Table(TableSpec {
                child_doctype: "Inner".into(),
                columns: Vec::new(),
            }),
        );
        let outer = FieldSpec::new(
            "outer",
            FieldKind::Table(TableSpec {
                child_doctype: "Outer".into(),
                columns: vec![inner],
            }),
        );
        assert!(matches!(
            Schema::new(def(vec![outer])),
            Err(SchemaError::NestedTable { .. })
        ));
    }

    #[test]
    fn malformed_expression_still_registers() {
        let schema = Schema::new(def(vec![
            FieldSpec::data("a").display_depends_on(Condition::expr("b = 1")),
            FieldSpec::data("b"),
        ]))
        .unwrap();
        assert!(schema.field("a").is_some());
    }

    #[test]
    fn loads_from_json() {
        let schema: SchemaDef = serde_json::from_value(json!({
            "doctype": "Stage Work",
            "tabs": [{
                "name": "Main",
                "fields": [
                    {"name": "lis_name", "fieldtype": "Link", "doctype": "Lift Irrigation Scheme"},
                    {"name": "stage", "fieldtype": "Link", "doctype": "Stage No",
                     "filters": [{"type": "mapped", "source_field": "lis_name", "target_field": "lis_name"}]},
                    {"name": "sb1", "fieldtype": "SectionBreak"},
                    {"name": "qty", "fieldtype": "Float", "min": 0.0,
                     "display_depends_on": {"lis_name": true}},
                    {"name": "code", "fieldtype": "Data", "pattern": "[A-Z]{2}-\\d{4}"}
                ]
            }]
        }))
        .unwrap();
        let schema = Schema::new(schema).unwrap();
        assert_eq!(schema.data_fields().count(), 4);
        assert_eq!(schema.filter_dependents("lis_name").count(), 1);
        assert!(schema.pattern("code").unwrap().is_match("PC-0001"));
        assert!(!schema.pattern("code").unwrap().is_match("xPC-0001"));
    }

    #[test]
    fn rejects_invalid_pattern() {
        let field = FieldSpec::new(
            "code",
            FieldKind::Data {
                pattern: Some("([".into()),
            },
        );
        assert!(matches!(
            Schema::new(def(vec![field])),
            Err(SchemaError::InvalidPattern { .. })
        ));
    }
}
