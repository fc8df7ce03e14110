//! Render dispatcher: field kind to widget contract.
//!
//! The output is a toolkit-neutral description of what to draw. Edits flow
//! back through the form controller by field name (the descriptor's
//! `binding`), never through closures captured here.

use serde::Serialize;
use serde_json::Value;

use crate::evaluator::{FieldState, FieldStates};
use crate::filters::{resolve_filters, Filters};
use crate::schema::{FieldKind, FieldSpec, Schema};
use crate::value::Values;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DateTimeMode {
    Date,
    Datetime,
    Time,
}

/// Closed vocabulary of editing affordances.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "widget", rename_all = "snake_case")]
pub enum Widget {
    Text {
        multiline: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    Number {
        integer: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        precision: Option<u8>,
    },
    Boolean,
    SingleSelect {
        options: Vec<String>,
    },
    DateTime {
        mode: DateTimeMode,
    },
    /// Search-as-you-type over `doctype`, constrained by `filters`.
    LinkSearch {
        doctype: String,
        filters: Filters,
    },
    MultiLink {
        doctype: String,
        child_doctype: String,
        link_field: String,
    },
    Attachment,
    NestedTable {
        child_doctype: String,
        columns: Vec<ColumnDescriptor>,
    },
    /// Page-supplied widget. Receives the whole form snapshot, not just its value.
    Custom {
        component: String,
        snapshot: Values,
    },
    /// Display-only value.
    Display,
    Action,
}

/// One column of a nested table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub label: String,
    pub required: bool,
    pub read_only: bool,
    #[serde(flatten)]
    pub widget: Widget,
}

/// Everything a renderer needs to draw one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetDescriptor {
    /// Field name edits are written back to.
    pub binding: String,
    pub label: String,
    #[serde(flatten)]
    pub widget: Widget,
    pub value: Value,
    pub required: bool,
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A run of fields between column breaks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnLayout {
    pub fields: Vec<WidgetDescriptor>,
}

/// A section opened by a section break (or the implicit first section).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub columns: Vec<ColumnLayout>,
}

impl SectionDescriptor {
    fn new(name: Option<String>, label: Option<String>) -> Self {
        Self {
            name,
            label,
            columns: vec![ColumnLayout::default()],
        }
    }

    fn is_empty(&self) -> bool {
        self.columns.iter().all(|c| c.fields.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabDescriptor {
    pub name: String,
    pub sections: Vec<SectionDescriptor>,
}

/// Widget for one data field.
#[must_use]
pub fn widget_for(field: &FieldSpec, values: &Values) -> Widget {
    match &field.kind {
        FieldKind::Data { pattern } => Widget::Text {
            multiline: false,
            pattern: pattern.clone(),
        },
        FieldKind::SmallText | FieldKind::LongText => Widget::Text {
            multiline: true,
            pattern: None,
        },
        FieldKind::Int { min, max } => Widget::Number {
            integer: true,
            min: *min,
            max: *max,
            precision: None,
        },
        FieldKind::Float { min, max, precision } => Widget::Number {
            integer: false,
            min: *min,
            max: *max,
            precision: *precision,
        },
        FieldKind::Currency | FieldKind::Percent => Widget::Number {
            integer: false,
            min: None,
            max: None,
            precision: Some(2),
        },
        FieldKind::Check => Widget::Boolean,
        FieldKind::Date => Widget::DateTime { mode: DateTimeMode::Date },
        FieldKind::Datetime => Widget::DateTime { mode: DateTimeMode::Datetime },
        FieldKind::Time => Widget::DateTime { mode: DateTimeMode::Time },
        FieldKind::Select { options } => Widget::SingleSelect {
            options: options.clone(),
        },
        FieldKind::Link { doctype, .. } => Widget::LinkSearch {
            doctype: doctype.clone(),
            filters: resolve_filters(field, values),
        },
        FieldKind::TableMultiSelect {
            child_doctype,
            link_field,
            link_doctype,
        } => Widget::MultiLink {
            doctype: link_doctype.clone(),
            child_doctype: child_doctype.clone(),
            link_field: link_field.clone(),
        },
        FieldKind::Attach => Widget::Attachment,
        FieldKind::Table(table) => Widget::NestedTable {
            child_doctype: table.child_doctype.clone(),
            columns: table
                .columns
                .iter()
                .filter(|c| c.kind.carries_data() && !c.hidden)
                .map(|c| ColumnDescriptor {
                    name: c.name.clone(),
                    label: c.label.clone(),
                    required: c.required,
                    read_only: c.read_only,
                    widget: widget_for(c, values),
                })
                .collect(),
        },
        FieldKind::Matrix(_) => Widget::Custom {
            component: "matrix".to_string(),
            snapshot: values.clone(),
        },
        FieldKind::Custom { widget, .. } => Widget::Custom {
            component: widget.clone(),
            snapshot: values.clone(),
        },
        FieldKind::ReadOnly { .. } | FieldKind::SectionBreak | FieldKind::ColumnBreak => {
            Widget::Display
        }
        FieldKind::Button => Widget::Action,
    }
}

/// Descriptor for one field given its evaluated state.
#[must_use]
pub fn dispatch(field: &FieldSpec, state: FieldState, values: &Values) -> WidgetDescriptor {
    WidgetDescriptor {
        binding: field.name.clone(),
        label: field.label.clone(),
        widget: widget_for(field, values),
        value: values.get(&field.name).cloned().unwrap_or(Value::Null),
        required: state.required,
        read_only: state.read_only,
        description: field.description.clone(),
    }
}

/// Lays out every visible field, tab by tab.
///
/// Hidden fields are omitted. A hidden section break hides everything up to
/// the next section break; empty sections are dropped.
#[must_use]
pub fn render(schema: &Schema, values: &Values, states: &FieldStates) -> Vec<TabDescriptor> {
    schema
        .tabs()
        .iter()
        .map(|tab| {
            let mut sections = vec![SectionDescriptor::new(None, None)];
            let mut section_visible = true;
            for field in &tab.fields {
                let state = states.get(&field.name).copied().unwrap_or(FieldState::HIDDEN);
                match field.kind {
                    FieldKind::SectionBreak => {
                        section_visible = state.visible;
                        sections.push(SectionDescriptor::new(
                            Some(field.name.clone()),
                            Some(field.label.clone()).filter(|l| !l.is_empty()),
                        ));
                    }
                    FieldKind::ColumnBreak => {
                        if let Some(section) = sections.last_mut() {
                            section.columns.push(ColumnLayout::default());
                        }
                    }
                    _ if section_visible && state.visible => {
                        if let Some(column) = sections.last_mut().and_then(|s| s.columns.last_mut()) {
                            column.fields.push(dispatch(field, state, values));
                        }
                    }
                    _ => {}
                }
            }
            sections.retain(|s| !s.is_empty());
            for section in &mut sections {
                section.columns.retain(|c| !c.fields.is_empty());
            }
            TabDescriptor {
                name: tab.name.clone(),
                sections,
            }
        })
        .collect()
}
