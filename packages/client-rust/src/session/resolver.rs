//! Reaction to value changes: `fetch_from` lookups, filter announcements and
//! matrix triggers.

use std::collections::BTreeMap;
use std::sync::Arc;

use docform_core::value::as_id;
use docform_core::{ChangeSet, FormCore, SetOptions, Values};
use serde_json::Value;

use super::{FormEvent, Inner, Reaction, SessionPhase};

/// Debounce key of the lookups driven by `source`, and epoch key of the
/// lookup filling `dependent`.
pub(super) fn fetch_key(field: &str) -> String {
    format!("fetch:{field}")
}

/// One dependent field waiting on a lookup, with the epoch it was issued at.
#[derive(Debug)]
pub(super) struct PendingFetch {
    dependent: String,
    target_doctype: String,
    target_field: String,
    epoch: u64,
}

impl Inner {
    /// Follows a batch of changes until nothing more changes synchronously.
    /// Remote work is scheduled, not awaited. Called with the form locked.
    pub(super) fn react(self: &Arc<Self>, form: &mut FormCore, changes: ChangeSet) -> Reaction {
        let schema = Arc::clone(&self.schema);
        let mut reaction = Reaction::default();
        let mut queue = vec![changes];
        while let Some(batch) = queue.pop() {
            for name in batch.iter() {
                for field in schema.filter_dependents(name) {
                    if !reaction.filters.contains(&field.name) {
                        reaction.filters.push(field.name.clone());
                    }
                }
                if let Some(cascade) = self.follow_fetch(form, name) {
                    queue.push(cascade);
                }
                if let Some(cascade) = self.follow_matrices(form, name) {
                    queue.push(cascade);
                }
            }
            reaction.changes.merge(batch);
        }
        reaction
    }

    /// Invalidates in-flight lookups for the dependents of `source`, then
    /// either clears them (empty source) or schedules a new lookup.
    fn follow_fetch(self: &Arc<Self>, form: &mut FormCore, source: &str) -> Option<ChangeSet> {
        let schema = Arc::clone(&self.schema);
        let pending: Vec<PendingFetch> = schema
            .fetch_dependents(source)
            .filter_map(|field| {
                let fetch = field.fetch_from.as_ref()?;
                Some(PendingFetch {
                    dependent: field.name.clone(),
                    target_doctype: fetch.target_doctype.clone(),
                    target_field: fetch.target_field.clone(),
                    epoch: self.bump(&fetch_key(&field.name)),
                })
            })
            .collect();
        if pending.is_empty() {
            return None;
        }

        if let Some(id) = form.get(source).and_then(as_id) {
            let this = Arc::clone(self);
            let owned_source = source.to_string();
            self.debouncer
                .schedule(&fetch_key(source), self.config.fetch_debounce, async move {
                    this.resolve_fetch(&owned_source, &id, pending).await;
                });
            return None;
        }

        self.debouncer.cancel(&fetch_key(source));
        let mut cleared = ChangeSet::default();
        for fetch in &pending {
            match form.set_value(&fetch.dependent, Value::Null, SetOptions::ENGINE) {
                Ok(changes) => cleared.merge(changes),
                Err(error) => tracing::warn!(field = %fetch.dependent, %error, "could not clear fetched field"),
            }
        }
        Some(cleared)
    }

    /// One lookup per target doctype; each dependent reads its own field of
    /// the fetched record.
    async fn resolve_fetch(self: &Arc<Self>, source: &str, id: &str, pending: Vec<PendingFetch>) {
        let mut by_doctype: BTreeMap<&str, Vec<&PendingFetch>> = BTreeMap::new();
        for fetch in &pending {
            by_doctype.entry(fetch.target_doctype.as_str()).or_default().push(fetch);
        }
        for (doctype, group) in by_doctype {
            let Some(result) = self.guarded(self.backend.get_doc(doctype, id)).await else {
                return;
            };
            match result {
                Ok(record) => self.apply_fetched(&group, &record),
                Err(error) => {
                    metrics::counter!("docform_fetch_total", "outcome" => "failed").increment(1);
                    tracing::warn!(source, doctype, id, %error, "fetch failed; dependent fields keep their values");
                    for fetch in group {
                        self.emit(FormEvent::FetchFailed {
                            field: fetch.dependent.clone(),
                            error: error.clone(),
                        });
                    }
                }
            }
        }
    }

    fn apply_fetched(self: &Arc<Self>, group: &[&PendingFetch], record: &Values) {
        let reaction = {
            let mut form = self.form.lock();
            if self.phase() == SessionPhase::Closed {
                return;
            }
            let mut changes = ChangeSet::default();
            for fetch in group {
                if !self.is_current(&fetch_key(&fetch.dependent), fetch.epoch) {
                    metrics::counter!("docform_fetch_total", "outcome" => "discarded").increment(1);
                    tracing::debug!(field = %fetch.dependent, "stale fetch discarded");
                    continue;
                }
                let value = record.get(&fetch.target_field).cloned().unwrap_or(Value::Null);
                match form.set_value(&fetch.dependent, value, SetOptions::ENGINE) {
                    Ok(applied) => {
                        metrics::counter!("docform_fetch_total", "outcome" => "applied").increment(1);
                        changes.merge(applied);
                    }
                    Err(error) => tracing::warn!(field = %fetch.dependent, %error, "fetched value rejected"),
                }
            }
            self.react(&mut form, changes)
        };
        self.publish(reaction);
    }
}
