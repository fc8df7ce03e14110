//! Field dependency graph and registration-time cycle detection.
//!
//! Edges point from a field to every field it reads: condition inputs,
//! `fetch_from` sources, link-filter sources, and matrix triggers. The
//! evaluator runs a single pass per snapshot, so the graph must be a DAG.

use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::schema::{FieldKind, Schema};

/// Adjacency list over top-level field names.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    /// Collects dependency edges from a schema. References to unknown fields
    /// in conditions are ignored here (they read as empty at runtime).
    #[must_use]
    pub fn build(schema: &Schema) -> Self {
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for field in schema.fields() {
            let mut deps: Vec<String> = field
                .conditions()
                .flat_map(|c| c.fields())
                .map(str::to_string)
                .collect();
            if let Some(fetch) = &field.fetch_from {
                deps.push(fetch.source_field.clone());
            }
            match &field.kind {
                FieldKind::Link { filters, .. } => {
                    deps.extend(filters.iter().flat_map(|f| f.sources()).map(str::to_string));
                }
                FieldKind::Matrix(matrix) => deps.extend(matrix.trigger_fields.iter().cloned()),
                _ => {}
            }
            deps.retain(|d| schema.contains(d));
            deps.sort();
            deps.dedup();
            edges.insert(field.name.clone(), deps);
        }
        Self { edges }
    }

    /// Fields `name` reads.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Fields that read `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == name))
            .map(|(field, _)| field.as_str())
            .collect()
    }

    /// Verifies the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DependencyCycle`] with the offending path, first
    /// node repeated at the end (`a -> b -> a`).
    pub fn check_acyclic(&self) -> Result<(), SchemaError> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();
        for start in self.edges.keys() {
            if !marks.contains_key(start.as_str()) {
                self.visit(start, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), SchemaError> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for dep in self.dependencies(node) {
            match marks.get(dep.as_str()) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let from = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|s| (*s).to_string()).collect();
                    path.push(dep.clone());
                    return Err(SchemaError::DependencyCycle { path });
                }
                None => self.visit(dep, marks, stack)?,
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::condition::Condition;
    use crate::schema::{FieldSpec, Naming, SchemaDef, TabbedLayout};

    fn def(fields: Vec<FieldSpec>) -> SchemaDef {
        SchemaDef {
            doctype: "Test".into(),
            tabs: vec![TabbedLayout::new("Main", fields)],
            naming: Naming::Autoname,
            sync_rules: Vec::new(),
        }
    }

    #[test]
    fn detects_two_field_cycle() {
        let err = Schema::new(def(vec![
            FieldSpec::data("a").display_depends_on(Condition::map([("b", json!(true))])),
            FieldSpec::data("b").display_depends_on(Condition::expr("a == 'x'")),
        ]))
        .unwrap_err();
        let SchemaError::DependencyCycle { path } = &err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert!(path.contains(&"a".to_string()) && path.contains(&"b".to_string()));
    }

    #[test]
    fn detects_cycle_through_fetch_from() {
        let err = Schema::new(def(vec![
            FieldSpec::link("a", "Asset").fetch_from("b", "Asset", "x"),
            FieldSpec::link("b", "Asset").fetch_from("a", "Asset", "y"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SchemaError::DependencyCycle { .. }));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = Schema::new(def(vec![
            FieldSpec::data("a").required_depends_on(Condition::expr("a")),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::DependencyCycle {
                path: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn dag_is_accepted_and_queryable() {
        let schema = Schema::new(def(vec![
            FieldSpec::link("pump_asset", "Asset"),
            FieldSpec::data("pump_no").fetch_from("pump_asset", "Asset", "asset_name"),
            FieldSpec::data("note").display_depends_on(Condition::expr("pump_no && pump_asset")),
        ]))
        .unwrap();
        let graph = DependencyGraph::build(&schema);
        assert_eq!(graph.dependencies("note"), ["pump_asset", "pump_no"]);
        let mut dependents = graph.dependents("pump_asset");
        dependents.sort_unstable();
        assert_eq!(dependents, vec!["note", "pump_no"]);
    }
}
