//! In-process backend with call recording, injected failures and latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use docform_core::value::{as_id, loose_eq};
use docform_core::Values;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::BackendError;
use crate::traits::{DocumentBackend, LinkCandidate, LinkQuery};

/// Backend operation, used to key injected failures and latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetDoc,
    InsertDoc,
    UpdateDoc,
    RenameDoc,
    SearchLink,
    CallMethod,
    DeleteDoc,
}

/// One recorded backend call, with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetDoc {
        doctype: String,
        name: String,
    },
    InsertDoc {
        doctype: String,
        doc: Values,
    },
    UpdateDoc {
        doctype: String,
        name: String,
        changes: Values,
        modified: Option<Value>,
    },
    RenameDoc {
        doctype: String,
        from: String,
        to: String,
    },
    SearchLink(LinkQuery),
    CallMethod {
        method: String,
        args: Value,
    },
    DeleteDoc {
        doctype: String,
        name: String,
    },
}

impl Call {
    #[must_use]
    pub fn op(&self) -> Op {
        match self {
            Call::GetDoc { .. } => Op::GetDoc,
            Call::InsertDoc { .. } => Op::InsertDoc,
            Call::UpdateDoc { .. } => Op::UpdateDoc,
            Call::RenameDoc { .. } => Op::RenameDoc,
            Call::SearchLink(_) => Op::SearchLink,
            Call::CallMethod { .. } => Op::CallMethod,
            Call::DeleteDoc { .. } => Op::DeleteDoc,
        }
    }
}

/// Documents keyed by `(doctype, name)`, each carrying a `modified` token
/// that changes on every write.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    docs: DashMap<(String, String), Values>,
    methods: DashMap<String, Value>,
    failures: DashMap<Op, BackendError>,
    latency: DashMap<Op, Duration>,
    calls: Mutex<Vec<Call>>,
    revision: AtomicU64,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> Value {
        let n = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        Value::String(format!("rev-{n}"))
    }

    /// Stores `doc`, named by its `name` property or a generated id.
    /// Returns the name.
    pub fn insert(&self, doctype: &str, mut doc: Values) -> String {
        let name = doc.get("name").and_then(as_id).unwrap_or_else(|| {
            let n = self.revision.load(Ordering::Relaxed) + 1;
            format!("{doctype}-{n:04}")
        });
        doc.insert("name".to_string(), Value::String(name.clone()));
        doc.insert("doctype".to_string(), Value::String(doctype.to_string()));
        doc.insert("modified".to_string(), self.next_token());
        self.docs.insert((doctype.to_string(), name.clone()), doc);
        name
    }

    #[must_use]
    pub fn doc(&self, doctype: &str, name: &str) -> Option<Values> {
        self.docs
            .get(&(doctype.to_string(), name.to_string()))
            .map(|d| d.value().clone())
    }

    /// Simulates someone else saving the document: its token changes.
    pub fn touch(&self, doctype: &str, name: &str) {
        if let Some(mut doc) = self.docs.get_mut(&(doctype.to_string(), name.to_string())) {
            doc.insert("modified".to_string(), self.next_token());
        }
    }

    pub fn set_method_result(&self, method: &str, result: Value) {
        self.methods.insert(method.to_string(), result);
    }

    /// Every later call of `op` fails with `error`.
    pub fn fail(&self, op: Op, error: BackendError) {
        self.failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: Op) {
        self.failures.remove(&op);
    }

    /// Every later call of `op` takes `delay` (tokio time) before answering.
    pub fn set_latency(&self, op: Op, delay: Duration) {
        self.latency.insert(op, delay);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls.lock().iter().filter(|c| c.op() == op).cloned().collect()
    }

    /// Records the call, then applies the configured latency and failure.
    async fn enter(&self, call: Call) -> Result<(), BackendError> {
        let op = call.op();
        self.calls.lock().push(call);
        let delay = self.latency.get(&op).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.get(&op) {
            Some(error) => Err(error.value().clone()),
            None => Ok(()),
        }
    }

    fn not_found(doctype: &str, name: &str) -> BackendError {
        BackendError::NotFound {
            doctype: doctype.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl DocumentBackend for InMemoryBackend {
    async fn get_doc(&self, doctype: &str, name: &str) -> Result<Values, BackendError> {
        self.enter(Call::GetDoc {
            doctype: doctype.to_string(),
            name: name.to_string(),
        })
        .await?;
        self.doc(doctype, name).ok_or_else(|| Self::not_found(doctype, name))
    }

    async fn insert_doc(&self, doctype: &str, doc: &Values) -> Result<Values, BackendError> {
        self.enter(Call::InsertDoc {
            doctype: doctype.to_string(),
            doc: doc.clone(),
        })
        .await?;
        if let Some(name) = doc.get("name").and_then(as_id) {
            if self.doc(doctype, &name).is_some() {
                return Err(BackendError::Duplicate {
                    message: format!("{doctype} {name} already exists"),
                });
            }
        }
        let name = self.insert(doctype, doc.clone());
        self.doc(doctype, &name).ok_or_else(|| Self::not_found(doctype, &name))
    }

    async fn update_doc(
        &self,
        doctype: &str,
        name: &str,
        changes: &Values,
        modified: Option<&Value>,
    ) -> Result<Values, BackendError> {
        self.enter(Call::UpdateDoc {
            doctype: doctype.to_string(),
            name: name.to_string(),
            changes: changes.clone(),
            modified: modified.cloned(),
        })
        .await?;
        let key = (doctype.to_string(), name.to_string());
        let mut doc = self.docs.get_mut(&key).ok_or_else(|| Self::not_found(doctype, name))?;
        if let Some(token) = modified {
            if doc.get("modified") != Some(token) {
                return Err(BackendError::Conflict {
                    message: "Document has been modified after you have opened it".to_string(),
                });
            }
        }
        for (field, value) in changes {
            doc.insert(field.clone(), value.clone());
        }
        doc.insert("modified".to_string(), self.next_token());
        Ok(doc.value().clone())
    }

    async fn rename_doc(&self, doctype: &str, from: &str, to: &str) -> Result<String, BackendError> {
        self.enter(Call::RenameDoc {
            doctype: doctype.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
        .await?;
        if self.doc(doctype, to).is_some() {
            return Err(BackendError::Duplicate {
                message: format!("{doctype} {to} already exists"),
            });
        }
        let (_, mut doc) = self
            .docs
            .remove(&(doctype.to_string(), from.to_string()))
            .ok_or_else(|| Self::not_found(doctype, from))?;
        doc.insert("name".to_string(), Value::String(to.to_string()));
        self.docs.insert((doctype.to_string(), to.to_string()), doc);
        Ok(to.to_string())
    }

    /// Candidates are the stored documents of the doctype whose fields match
    /// every filter and whose name contains `txt`.
    async fn search_link(&self, query: &LinkQuery) -> Result<Vec<LinkCandidate>, BackendError> {
        self.enter(Call::SearchLink(query.clone())).await?;
        let txt = query.txt.to_lowercase();
        let mut candidates: Vec<LinkCandidate> = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == query.doctype)
            .filter(|entry| entry.key().1.to_lowercase().contains(&txt))
            .filter(|entry| {
                query
                    .filters
                    .iter()
                    .all(|(field, expected)| entry.value().get(field).is_some_and(|v| loose_eq(v, expected)))
            })
            .map(|entry| LinkCandidate {
                value: entry.key().1.clone(),
                label: entry.key().1.clone(),
                description: None,
            })
            .collect();
        candidates.sort_by(|a, b| a.value.cmp(&b.value));
        candidates.truncate(query.page_length);
        Ok(candidates)
    }

    async fn call_method(&self, method: &str, args: &Value) -> Result<Value, BackendError> {
        self.enter(Call::CallMethod {
            method: method.to_string(),
            args: args.clone(),
        })
        .await?;
        self.methods
            .get(method)
            .map(|r| r.value().clone())
            .ok_or_else(|| BackendError::Server {
                status: 404,
                messages: vec![format!("method {method} not found")],
            })
    }

    async fn delete_doc(&self, doctype: &str, name: &str) -> Result<(), BackendError> {
        self.enter(Call::DeleteDoc {
            doctype: doctype.to_string(),
            name: name.to_string(),
        })
        .await?;
        self.docs
            .remove(&(doctype.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(doctype, name))
    }
}
