//! Debounced regeneration of matrix grids from their remote axis lists.

use std::sync::Arc;

use docform_core::value::as_id;
use docform_core::{ChangeSet, FormCore, MatrixSpec, Values};
use serde_json::Value;

use super::{Inner, SessionPhase};

fn matrix_key(field: &str) -> String {
    format!("matrix:{field}")
}

/// Axis ids from a method result: strings or numbers, or objects carrying
/// `name` (document lists) or `value` (search results).
fn axis_ids(result: &Value) -> Vec<String> {
    let Value::Array(items) = result else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => map.get("name").or_else(|| map.get("value")).and_then(as_id),
            other => as_id(other),
        })
        .collect()
}

impl Inner {
    /// For every matrix that lists `trigger`: regenerate once all its
    /// triggers are set, clear it as soon as one is empty. Called with the
    /// form locked.
    pub(super) fn follow_matrices(self: &Arc<Self>, form: &mut FormCore, trigger: &str) -> Option<ChangeSet> {
        let schema = Arc::clone(&self.schema);
        let mut cleared = ChangeSet::default();
        for (field, spec) in schema.matrices_triggered_by(trigger) {
            let key = matrix_key(&field.name);
            let epoch = self.bump(&key);
            match form.matrix_triggers(&field.name) {
                Ok(Some(triggers)) => {
                    let this = Arc::clone(self);
                    let name = field.name.clone();
                    let spec = spec.clone();
                    self.debouncer
                        .schedule(&key, self.config.regeneration_debounce, async move {
                            this.regenerate(&name, &spec, triggers, epoch).await;
                        });
                }
                Ok(None) => {
                    self.debouncer.cancel(&key);
                    match form.clear_matrix(&field.name) {
                        Ok(changes) => cleared.merge(changes),
                        Err(error) => tracing::warn!(matrix = %field.name, %error, "could not clear matrix"),
                    }
                }
                Err(error) => tracing::warn!(matrix = %field.name, %error, "matrix triggers unreadable"),
            }
        }
        (!cleared.is_empty()).then_some(cleared)
    }

    async fn regenerate(self: &Arc<Self>, name: &str, spec: &MatrixSpec, triggers: Values, epoch: u64) {
        let args = Value::Object(triggers.into_iter().collect());
        let backend = &self.backend;
        let fetched = self
            .guarded(async {
                tokio::try_join!(
                    backend.call_method(&spec.rows_method, &args),
                    backend.call_method(&spec.columns_method, &args),
                )
            })
            .await;
        let Some(result) = fetched else {
            return;
        };
        let (rows, columns) = match result {
            Ok(axes) => axes,
            Err(error) => {
                metrics::counter!("docform_regeneration_total", "outcome" => "failed").increment(1);
                tracing::warn!(matrix = name, %error, "matrix axes could not be loaded; grid kept");
                return;
            }
        };

        let reaction = {
            let mut form = self.form.lock();
            if self.phase() == SessionPhase::Closed {
                return;
            }
            if !self.is_current(&matrix_key(name), epoch) {
                metrics::counter!("docform_regeneration_total", "outcome" => "discarded").increment(1);
                tracing::debug!(matrix = name, "stale regeneration discarded");
                return;
            }
            match form.apply_matrix_axes(name, axis_ids(&rows), axis_ids(&columns)) {
                Ok(changes) => self.react(&mut form, changes),
                Err(error) => {
                    tracing::warn!(matrix = name, %error, "regenerated grid rejected");
                    return;
                }
            }
        };
        metrics::counter!("docform_regeneration_total", "outcome" => "applied").increment(1);
        self.publish(reaction);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn axis_ids_accept_documents_and_scalars() {
        assert_eq!(
            axis_ids(&json!(["A1", {"name": "A2"}, {"value": "A3"}, 4, null, {"x": 1}])),
            vec!["A1", "A2", "A3", "4"]
        );
        assert!(axis_ids(&json!({"message": []})).is_empty());
    }
}
