use async_trait::async_trait;
use docform_core::{Filters, Values};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

/// A link search: candidates of `doctype` matching `txt`, restricted by `filters`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkQuery {
    pub doctype: String,
    pub txt: String,
    pub filters: Filters,
    pub page_length: usize,
}

/// One search suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCandidate {
    /// Document id written into the link field.
    pub value: String,
    /// Display text; falls back to `value`.
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-id outcome of a bulk delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkDeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, BackendError)>,
}

impl BulkDeleteReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pluggable document backend.
/// Implementations: `RestBackend` (Frappe-style HTTP API), `InMemoryBackend` (tests, demos).
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Load one document.
    async fn get_doc(&self, doctype: &str, name: &str) -> Result<Values, BackendError>;

    /// Create a document; returns the stored record (with its assigned `name`).
    async fn insert_doc(&self, doctype: &str, doc: &Values) -> Result<Values, BackendError>;

    /// Apply `changes` to an existing document. `modified` is the token the
    /// document was loaded with; a mismatch must fail with
    /// [`BackendError::Conflict`].
    async fn update_doc(
        &self,
        doctype: &str,
        name: &str,
        changes: &Values,
        modified: Option<&Value>,
    ) -> Result<Values, BackendError>;

    /// Rename a document; returns the new id.
    async fn rename_doc(&self, doctype: &str, from: &str, to: &str) -> Result<String, BackendError>;

    async fn search_link(&self, query: &LinkQuery) -> Result<Vec<LinkCandidate>, BackendError>;

    /// Call a whitelisted server method with document-shaped arguments.
    async fn call_method(&self, method: &str, args: &Value) -> Result<Value, BackendError>;

    async fn delete_doc(&self, doctype: &str, name: &str) -> Result<(), BackendError>;

    /// Delete several documents, reporting each failure separately.
    async fn delete_docs(&self, doctype: &str, names: &[String]) -> BulkDeleteReport {
        let outcomes = join_all(names.iter().map(|name| async move {
            (name.clone(), self.delete_doc(doctype, name).await)
        }))
        .await;
        let mut report = BulkDeleteReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => report.deleted.push(name),
                Err(error) => report.failed.push((name, error)),
            }
        }
        report
    }
}
