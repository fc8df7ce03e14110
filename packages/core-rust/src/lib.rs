//! `docform` Core: schema model, condition grammar, dependency evaluator,
//! form state, child tables, and the render dispatcher.
//!
//! Everything here is synchronous and free of I/O. The async session layer
//! that talks to a document backend lives in `docform-client`.

pub mod condition;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod filters;
pub mod form;
pub mod graph;
pub mod hooks;
pub mod matrix;
pub mod schema;
pub mod state;
pub mod table;
pub mod validate;
pub mod value;

pub use condition::Condition;
pub use dispatch::{TabDescriptor, Widget, WidgetDescriptor};
pub use error::{FormError, SchemaError};
pub use evaluator::{FieldState, FieldStates};
pub use filters::{Filters, LinkFilter};
pub use form::{ChangeSet, FormCore, Rename};
pub use hooks::ChangeHook;
pub use matrix::{CellState, MatrixGrid};
pub use schema::{FieldKind, FieldSpec, MatrixSpec, Naming, Schema, SchemaDef, SyncRule, TabbedLayout, TableSpec};
pub use state::{FormState, SetOptions};
pub use validate::{FieldError, Violation};
pub use value::{Row, ValueAccessor, Values};
