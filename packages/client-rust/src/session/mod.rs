//! Async form session: one document being edited against a backend.
//!
//! [`FormSession`] wraps a [`FormCore`] behind a mutex and adds the remote
//! half of the engine: debounced `fetch_from` lookups, matrix regeneration,
//! link searches, save and delete. All remote work is cancelled when the
//! session closes, and every write from a background task is epoch guarded
//! and applied under the form lock after checking the session is still open.

mod debounce;
mod matrix;
mod resolver;
mod save;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use docform_core::{
    CellState, ChangeSet, FieldError, FieldState, FieldStates, Filters, FormCore, FormError, MatrixGrid, Row,
    Schema, SetOptions, TabDescriptor, Values,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{BackendError, SessionError};
use crate::traits::{DocumentBackend, LinkCandidate, LinkQuery};

use self::debounce::Debouncer;
pub use self::save::SaveOutcome;

/// Lifecycle of a session.
///
/// State machine: Editing -> Saving -> Editing, any -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Editing,
    /// A save is running; user writes are rejected until it finishes.
    Saving,
    /// Terminal. No task writes into the form after this.
    Closed,
}

/// Notification published to [`FormSession::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum FormEvent {
    /// Stored values changed (user edit, hook, sync rule, fetch, regeneration).
    ValueChanged { fields: Vec<String> },
    /// Link fields whose search filters read a changed field.
    FiltersChanged { fields: Vec<String> },
    /// A `fetch_from` lookup failed; the field kept its value.
    FetchFailed { field: String, error: BackendError },
    Renamed { from: String, to: String },
    Saved { name: String },
    Closed,
}

/// What one mutation led to, gathered under the form lock and published
/// after it is released.
#[derive(Debug, Default)]
struct Reaction {
    changes: ChangeSet,
    filters: Vec<String>,
}

pub(crate) struct Inner {
    backend: Arc<dyn DocumentBackend>,
    schema: Arc<Schema>,
    config: SessionConfig,
    form: Mutex<FormCore>,
    phase: ArcSwap<SessionPhase>,
    events: broadcast::Sender<FormEvent>,
    debouncer: Arc<Debouncer>,
    /// Request epochs: `fetch:{dependent}`, `matrix:{field}`, `search:{field}`.
    epochs: DashMap<String, u64>,
    cancel: CancellationToken,
}

impl Inner {
    fn phase(&self) -> SessionPhase {
        **self.phase.load()
    }

    fn check_open(&self) -> Result<(), SessionError> {
        match self.phase() {
            SessionPhase::Closed => Err(SessionError::Closed),
            _ => Ok(()),
        }
    }

    /// User writes are refused during a save; engine writes are not.
    fn check_writable(&self, user: bool) -> Result<(), SessionError> {
        match self.phase() {
            SessionPhase::Closed => Err(SessionError::Closed),
            SessionPhase::Saving if user => Err(SessionError::Busy),
            _ => Ok(()),
        }
    }

    fn bump(&self, key: &str) -> u64 {
        let mut epoch = self.epochs.entry(key.to_string()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    fn is_current(&self, key: &str, epoch: u64) -> bool {
        self.epochs.get(key).is_some_and(|e| *e == epoch)
    }

    fn invalidate_all(&self) {
        for mut epoch in self.epochs.iter_mut() {
            *epoch += 1;
        }
    }

    fn emit(&self, event: FormEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, reaction: Reaction) {
        if !reaction.changes.is_empty() {
            self.emit(FormEvent::ValueChanged {
                fields: reaction.changes.iter().map(str::to_string).collect(),
            });
        }
        if !reaction.filters.is_empty() {
            self.emit(FormEvent::FiltersChanged {
                fields: reaction.filters,
            });
        }
    }

    /// Runs a backend call unless the session closes first (`None`).
    async fn guarded<T, F>(&self, call: F) -> Option<Result<T, BackendError>>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = call => Some(result),
        }
    }

    /// Applies one mutation under the form lock, follows its consequences and
    /// publishes the resulting events.
    fn apply<F>(self: &Arc<Self>, user: bool, mutation: F) -> Result<ChangeSet, SessionError>
    where
        F: FnOnce(&mut FormCore) -> Result<ChangeSet, FormError>,
    {
        let reaction = {
            let mut form = self.form.lock();
            self.check_writable(user)?;
            let changes = mutation(&mut form)?;
            self.react(&mut form, changes)
        };
        let changes = reaction.changes.clone();
        self.publish(reaction);
        Ok(changes)
    }
}

/// Clone-able controller of one document edit session.
#[derive(Clone)]
pub struct FormSession {
    inner: Arc<Inner>,
}

impl FormSession {
    /// Loads document `name` and opens a session on it.
    ///
    /// # Errors
    ///
    /// The backend's error when the document cannot be loaded.
    pub async fn open(
        backend: Arc<dyn DocumentBackend>,
        schema: Arc<Schema>,
        config: SessionConfig,
        name: &str,
    ) -> Result<Self, SessionError> {
        let record = backend.get_doc(schema.doctype(), name).await?;
        tracing::debug!(doctype = schema.doctype(), name, "document loaded");
        Ok(Self::with_form(backend, config, FormCore::load(schema, record)))
    }

    /// Opens a session on a new, unsaved document.
    #[must_use]
    pub fn create(backend: Arc<dyn DocumentBackend>, schema: Arc<Schema>, config: SessionConfig) -> Self {
        Self::with_form(backend, config, FormCore::new_document(schema))
    }

    fn with_form(backend: Arc<dyn DocumentBackend>, config: SessionConfig, form: FormCore) -> Self {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Inner {
            backend,
            schema: Arc::clone(form.schema()),
            form: Mutex::new(form),
            phase: ArcSwap::from_pointee(SessionPhase::Editing),
            events,
            debouncer: Debouncer::new(cancel.clone()),
            epochs: DashMap::new(),
            cancel,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Re-reads the document from the backend, discarding edits and pending lookups.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`], [`SessionError::Busy`] during a save, or the backend's error.
    pub async fn reload(&self) -> Result<(), SessionError> {
        let name = {
            let form = self.inner.form.lock();
            self.inner.check_writable(true)?;
            form.document_name()
        };
        let doctype = self.inner.schema.doctype();
        let record = match name {
            Some(name) => Some(
                self.inner
                    .guarded(self.inner.backend.get_doc(doctype, &name))
                    .await
                    .ok_or(SessionError::Closed)??,
            ),
            None => None,
        };
        {
            let mut form = self.inner.form.lock();
            self.inner.check_writable(true)?;
            self.inner.debouncer.cancel_all();
            self.inner.invalidate_all();
            match record {
                Some(record) => *form = FormCore::load(Arc::clone(&self.inner.schema), record),
                None => form.reset(),
            }
        }
        self.inner.emit(FormEvent::ValueChanged {
            fields: self.inner.schema.data_fields().map(|f| f.name.clone()).collect(),
        });
        Ok(())
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    #[must_use]
    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.inner.form.lock().get(name).cloned()
    }

    /// User edit of one field.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`], [`SessionError::Busy`] during a save, or a
    /// [`FormError`] for unknown and layout fields.
    pub fn set_value(&self, name: &str, value: Value) -> Result<ChangeSet, SessionError> {
        self.set_value_with(name, value, SetOptions::USER)
    }

    /// Write with explicit options; `SetOptions::ENGINE` writes do not mark
    /// the form user-dirty and are accepted during a save.
    ///
    /// # Errors
    ///
    /// As [`FormSession::set_value`].
    pub fn set_value_with(&self, name: &str, value: Value, opts: SetOptions) -> Result<ChangeSet, SessionError> {
        self.inner
            .apply(opts.mark_dirty, |form| form.set_value(name, value, opts))
    }

    #[must_use]
    pub fn snapshot(&self) -> Values {
        self.inner.form.lock().values().clone()
    }

    #[must_use]
    pub fn field_states(&self) -> FieldStates {
        self.inner.form.lock().field_states().clone()
    }

    #[must_use]
    pub fn field_state(&self, name: &str) -> FieldState {
        self.inner.form.lock().field_state(name)
    }

    #[must_use]
    pub fn render(&self) -> Vec<TabDescriptor> {
        self.inner.form.lock().render()
    }

    #[must_use]
    pub fn validate(&self) -> Vec<FieldError> {
        self.inner.form.lock().validate()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.form.lock().is_dirty()
    }

    #[must_use]
    pub fn has_user_edits(&self) -> bool {
        self.inner.form.lock().has_user_edits()
    }

    #[must_use]
    pub fn document_name(&self) -> Option<String> {
        self.inner.form.lock().document_name()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FormEvent> {
        self.inner.events.subscribe()
    }

    // -- link search ------------------------------------------------------

    /// Filters the next search for link field `field` will carry.
    ///
    /// # Errors
    ///
    /// [`FormError::WrongKind`] for non-link fields.
    pub fn link_filters(&self, field: &str) -> Result<Filters, SessionError> {
        Ok(self.inner.form.lock().link_filters(field)?)
    }

    /// Searches candidates for link field `field`, restricted by its current filters.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`], a [`FormError`] for non-link fields, or the backend's error.
    pub async fn search_link(&self, field: &str, txt: &str) -> Result<Vec<LinkCandidate>, SessionError> {
        let query = {
            let form = self.inner.form.lock();
            self.inner.check_open()?;
            LinkQuery {
                doctype: form.link_doctype(field)?.to_string(),
                txt: txt.to_string(),
                filters: form.link_filters(field)?,
                page_length: self.inner.config.search_page_length,
            }
        };
        match self.inner.guarded(self.inner.backend.search_link(&query)).await {
            None => Err(SessionError::Closed),
            Some(Ok(found)) => Ok(found),
            Some(Err(error)) => {
                metrics::counter!("docform_search_failed_total").increment(1);
                tracing::warn!(field, doctype = %query.doctype, %error, "link search failed");
                Err(error.into())
            }
        }
    }

    /// Search-as-you-type: waits out the search debounce window and answers
    /// only if no newer search for the same field started meanwhile
    /// (`Ok(None)` when superseded).
    ///
    /// # Errors
    ///
    /// As [`FormSession::search_link`].
    pub async fn search_link_debounced(
        &self,
        field: &str,
        txt: &str,
    ) -> Result<Option<Vec<LinkCandidate>>, SessionError> {
        let key = format!("search:{field}");
        let epoch = self.inner.bump(&key);
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return Err(SessionError::Closed),
            () = tokio::time::sleep(self.inner.config.search_debounce) => {}
        }
        if !self.inner.is_current(&key, epoch) {
            return Ok(None);
        }
        let found = self.search_link(field, txt).await?;
        Ok(self.inner.is_current(&key, epoch).then_some(found))
    }

    // -- child tables -----------------------------------------------------

    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `table` is not an editable table.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, SessionError> {
        Ok(self.inner.form.lock().rows(table)?)
    }

    /// # Errors
    ///
    /// As [`FormSession::set_value`].
    pub fn add_row(&self, table: &str, init: Row) -> Result<ChangeSet, SessionError> {
        self.inner.apply(true, |form| form.add_row(table, init))
    }

    /// # Errors
    ///
    /// As [`FormSession::set_value`], or [`FormError::RowOutOfRange`].
    pub fn remove_row(&self, table: &str, index: usize) -> Result<ChangeSet, SessionError> {
        self.inner.apply(true, |form| form.remove_row(table, index))
    }

    /// # Errors
    ///
    /// As [`FormSession::set_value`], or a row/column error.
    pub fn set_cell(&self, table: &str, index: usize, column: &str, value: Value) -> Result<ChangeSet, SessionError> {
        self.inner
            .apply(true, |form| form.set_cell(table, index, column, value))
    }

    /// # Errors
    ///
    /// [`FormError::RowOutOfRange`] for a bad index.
    pub fn row_field_states(&self, table: &str, index: usize) -> Result<FieldStates, SessionError> {
        Ok(self.inner.form.lock().row_field_states(table, index)?)
    }

    /// Replaces the links of a multi-select table.
    ///
    /// # Errors
    ///
    /// As [`FormSession::set_value`].
    pub fn set_links(&self, table: &str, ids: &[&str]) -> Result<ChangeSet, SessionError> {
        self.inner.apply(true, |form| form.set_links(table, ids))
    }

    // -- matrices ---------------------------------------------------------

    /// # Errors
    ///
    /// [`FormError::WrongKind`] when `name` is not a matrix.
    pub fn matrix(&self, name: &str) -> Result<MatrixGrid, SessionError> {
        let form = self.inner.form.lock();
        let (_, grid) = form.matrix(name)?;
        Ok(grid)
    }

    /// # Errors
    ///
    /// As [`FormSession::set_value`], or [`FormError::UnknownCell`].
    pub fn set_matrix_cell(
        &self,
        name: &str,
        row: &str,
        column: &str,
        state: CellState,
        note: Option<String>,
    ) -> Result<ChangeSet, SessionError> {
        self.inner
            .apply(true, |form| form.set_matrix_cell(name, row, column, state, note))
    }

    // -- lifecycle --------------------------------------------------------

    /// Number of debounced lookups and regenerations not yet settled.
    #[must_use]
    pub fn pending_lookups(&self) -> usize {
        self.inner.debouncer.pending()
    }

    /// Waits until no lookup is pending. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.debouncer.wait_idle(timeout).await
    }

    /// Deletes the document on the backend and closes the session. An unsaved
    /// document is only closed.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`], [`SessionError::Busy`], or the backend's error
    /// (the session stays open).
    pub async fn delete(&self) -> Result<(), SessionError> {
        let name = {
            let form = self.inner.form.lock();
            self.inner.check_writable(true)?;
            form.document_name()
        };
        if let Some(name) = name {
            let doctype = self.inner.schema.doctype();
            self.inner
                .guarded(self.inner.backend.delete_doc(doctype, &name))
                .await
                .ok_or(SessionError::Closed)??;
            tracing::info!(doctype, name = %name, "document deleted");
        }
        self.close();
        Ok(())
    }

    /// Cancels every timer and request and refuses further writes.
    pub fn close(&self) {
        {
            let _form = self.inner.form.lock();
            if self.inner.phase() == SessionPhase::Closed {
                return;
            }
            self.inner.phase.store(Arc::new(SessionPhase::Closed));
        }
        self.inner.cancel.cancel();
        self.inner.debouncer.cancel_all();
        self.inner.emit(FormEvent::Closed);
        tracing::debug!(doctype = self.inner.schema.doctype(), "session closed");
    }
}
