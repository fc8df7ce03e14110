//! Error types for schema registration and form mutation.

/// Schema registration failure. A schema that fails here is never used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate field name: {name}")]
    DuplicateField { name: String },
    #[error("field {field} references unknown field {reference} ({role})")]
    UnknownReference {
        field: String,
        reference: String,
        role: &'static str,
    },
    #[error("table {table} declares nested table column {column}")]
    NestedTable { table: String, column: String },
    #[error("sync rule references {field}, which is not a table")]
    NotATable { field: String },
    #[error("invalid pattern on {field}: {message}")]
    InvalidPattern { field: String, message: String },
    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },
}

/// Rejected form mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormError {
    #[error("unknown field: {name}")]
    UnknownField { name: String },
    #[error("field {name} does not hold data")]
    NotData { name: String },
    #[error("field {name} is not a {expected}")]
    WrongKind { name: String, expected: &'static str },
    #[error("row {index} out of range for table {table} ({len} rows)")]
    RowOutOfRange {
        table: String,
        index: usize,
        len: usize,
    },
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("matrix {matrix} has no cell ({row}, {column})")]
    UnknownCell {
        matrix: String,
        row: String,
        column: String,
    },
}
