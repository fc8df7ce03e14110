//! Save: quiescence, validation, rename, then insert or update.

use std::sync::Arc;

use docform_core::form::NAME_KEY;
use docform_core::value::as_id;
use docform_core::{FormCore, Naming, Rename, Values};
use serde_json::Value;
use tracing::Instrument;

use super::{FormEvent, FormSession, Inner, SessionPhase};
use crate::error::SaveError;

/// Result of a successful [`FormSession::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// No field changed and no rename was pending; nothing was sent.
    NothingToSave,
    Saved { name: String },
}

/// Returns the session to `Editing` when a save ends, unless it closed meanwhile.
struct SavingGuard<'a> {
    inner: &'a Inner,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.inner.phase.rcu(|phase| match **phase {
            SessionPhase::Saving => SessionPhase::Editing,
            other => other,
        });
    }
}

enum Plan {
    Insert(Values),
    Update {
        name: String,
        rename: Option<Rename>,
        diff: Values,
        modified: Option<Value>,
    },
}

/// Full payload of a new document. A document named by one of its fields
/// asks for that name explicitly.
fn insert_payload(form: &FormCore, exclude: &[&str]) -> Values {
    let mut payload = form.submit_payload(exclude);
    if let Naming::ByField { field } = form.schema().naming() {
        if let Some(name) = form.get(field).and_then(as_id) {
            payload.insert(NAME_KEY.to_string(), Value::String(name));
        }
    }
    payload
}

fn outcome_label(result: &Result<SaveOutcome, SaveError>) -> &'static str {
    match result {
        Ok(SaveOutcome::NothingToSave) => "nothing_to_save",
        Ok(SaveOutcome::Saved { .. }) => "saved",
        Err(SaveError::Invalid(_)) => "invalid",
        Err(SaveError::Backend(_)) => "backend_error",
        Err(SaveError::Rename { .. }) => "rename_failed",
        Err(SaveError::Stale { .. }) => "stale",
        Err(SaveError::InProgress) => "in_progress",
        Err(SaveError::Closed) => "closed",
    }
}

impl FormSession {
    /// Persists the document.
    ///
    /// Waits for pending lookups (bounded by `submit_wait_timeout`), validates,
    /// renames first when the naming field changed, then sends the full payload
    /// (new document) or only the changed fields with the `modified` token.
    /// A rename failure aborts before any update. The server record becomes
    /// the new baseline.
    ///
    /// # Errors
    ///
    /// See [`SaveError`]. A conflict surfaces as
    /// `SaveError::Backend(BackendError::Conflict { .. })` and is never retried.
    pub async fn save(&self) -> Result<SaveOutcome, SaveError> {
        let span = tracing::info_span!(
            "save",
            doctype = self.inner.schema.doctype(),
            name = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let result = self.save_inner().instrument(span.clone()).await;
        let outcome = outcome_label(&result);
        span.record("outcome", outcome);
        metrics::counter!("docform_save_total", "outcome" => outcome).increment(1);
        match &result {
            Ok(SaveOutcome::Saved { name }) => {
                span.record("name", name.as_str());
                tracing::info!(parent: &span, "document saved");
            }
            Ok(SaveOutcome::NothingToSave) => tracing::info!(parent: &span, "nothing to save"),
            Err(error) => tracing::warn!(parent: &span, %error, "save failed"),
        }
        result
    }

    async fn save_inner(&self) -> Result<SaveOutcome, SaveError> {
        let inner = &*self.inner;
        {
            let _form = inner.form.lock();
            match inner.phase() {
                SessionPhase::Closed => return Err(SaveError::Closed),
                SessionPhase::Saving => return Err(SaveError::InProgress),
                SessionPhase::Editing => inner.phase.store(Arc::new(SessionPhase::Saving)),
            }
        }
        let _saving = SavingGuard { inner };

        let waited = inner.config.submit_wait_timeout;
        if !inner.debouncer.wait_idle(waited).await {
            return Err(SaveError::Stale { waited });
        }

        let exclude: Vec<&str> = inner.config.exclude_fields.iter().map(String::as_str).collect();
        let plan = {
            let form = inner.form.lock();
            if inner.phase() == SessionPhase::Closed {
                return Err(SaveError::Closed);
            }
            let errors = form.validate();
            if !errors.is_empty() {
                return Err(SaveError::Invalid(errors));
            }
            match form.document_name() {
                None => Plan::Insert(insert_payload(&form, &exclude)),
                Some(name) => Plan::Update {
                    name,
                    rename: form.pending_rename(),
                    diff: form.diff_payload(&exclude),
                    modified: form.modified().cloned(),
                },
            }
        };

        let doctype = inner.schema.doctype();
        match plan {
            Plan::Insert(payload) => {
                let record = inner
                    .guarded(inner.backend.insert_doc(doctype, &payload))
                    .await
                    .ok_or(SaveError::Closed)?
                    .map_err(SaveError::Backend)?;
                self.commit(record).map(|name| SaveOutcome::Saved { name })
            }
            Plan::Update {
                rename: None,
                ref diff,
                ..
            } if diff.is_empty() => Ok(SaveOutcome::NothingToSave),
            Plan::Update {
                mut name,
                rename,
                mut diff,
                mut modified,
            } => {
                if let Some(Rename { from, to }) = rename {
                    let renamed = match inner.guarded(inner.backend.rename_doc(doctype, &from, &to)).await {
                        None => return Err(SaveError::Closed),
                        Some(Ok(renamed)) => renamed,
                        Some(Err(source)) => return Err(SaveError::Rename { from, to, source }),
                    };
                    {
                        let mut form = inner.form.lock();
                        if inner.phase() == SessionPhase::Closed {
                            return Err(SaveError::Closed);
                        }
                        form.adopt_name(&renamed);
                        diff = form.diff_payload(&exclude);
                        modified = form.modified().cloned();
                    }
                    inner.emit(FormEvent::Renamed {
                        from,
                        to: renamed.clone(),
                    });
                    name = renamed;
                    if diff.is_empty() {
                        inner.emit(FormEvent::Saved { name: name.clone() });
                        return Ok(SaveOutcome::Saved { name });
                    }
                }
                let record = inner
                    .guarded(inner.backend.update_doc(doctype, &name, &diff, modified.as_ref()))
                    .await
                    .ok_or(SaveError::Closed)?
                    .map_err(SaveError::Backend)?;
                self.commit(record).map(|name| SaveOutcome::Saved { name })
            }
        }
    }

    /// Adopts the saved record as the new baseline and announces it.
    fn commit(&self, record: Values) -> Result<String, SaveError> {
        let name = {
            let mut form = self.inner.form.lock();
            if self.inner.phase() == SessionPhase::Closed {
                return Err(SaveError::Closed);
            }
            form.commit(record);
            form.document_name().unwrap_or_default()
        };
        self.inner.emit(FormEvent::Saved { name: name.clone() });
        Ok(name)
    }
}
