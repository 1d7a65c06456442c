//! Variable resolution for a `(deployment, resource)` pair.
//!
//! Per deployment variable key:
//! 1. a resource variable with the same key wins;
//! 2. otherwise the deployment values whose selector admits the resource,
//!    highest `priority` first, ties broken by insertion order;
//! 3. otherwise the variable's default; with no default the key is omitted.
//!
//! The chosen [`Value`] is then resolved: literals verbatim, references by
//! following the relationship graph to the first related resource (lowest
//! id) and reading the property path. An unresolvable reference omits the
//! key.

use std::collections::BTreeMap;

use crate::diagnostics::DiagnosticKind;
use crate::domain::{LiteralValue, Resource, Value};
use crate::relationships::RelationshipGraph;
use crate::selector::{Matcher, Subject};
use crate::store::Store;

/// Where a chosen value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    ResourceOverride,
    DeploymentValue,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct VariableResolver<'a> {
    store: &'a Store,
    graph: &'a RelationshipGraph,
    matcher: Matcher<'a>,
}

impl<'a> VariableResolver<'a> {
    pub fn new(store: &'a Store, graph: &'a RelationshipGraph, matcher: Matcher<'a>) -> Self {
        Self {
            store,
            graph,
            matcher,
        }
    }

    /// Pick the unresolved value for each key, before reference resolution.
    pub fn choose(
        &self,
        deployment_id: &str,
        resource: &Resource,
    ) -> BTreeMap<String, (Value, ValueSource)> {
        let mut chosen = BTreeMap::new();
        for variable in self.store.variables_of(deployment_id) {
            if let Some(rv) = self.store.resource_variable(&resource.id, &variable.key) {
                chosen.insert(
                    variable.key.clone(),
                    (rv.value.clone(), ValueSource::ResourceOverride),
                );
                continue;
            }
            // Stable sort keeps insertion order among equal priorities.
            let mut candidates: Vec<_> = self
                .store
                .values_of(&variable.id)
                .filter(|v| {
                    self.matcher.admits(
                        v.resource_selector.as_ref(),
                        Subject::Resource(resource),
                        true,
                        &format!("deployment_variable_value/{}", v.id),
                    )
                })
                .collect();
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
            if let Some(best) = candidates.first() {
                chosen.insert(
                    variable.key.clone(),
                    (best.value.clone(), ValueSource::DeploymentValue),
                );
            } else if let Some(default) = &variable.default_value {
                chosen.insert(variable.key.clone(), (default.clone(), ValueSource::Default));
            }
        }
        chosen
    }

    /// Fully resolved variable map.
    pub fn resolve(&self, deployment_id: &str, resource: &Resource) -> BTreeMap<String, LiteralValue> {
        self.choose(deployment_id, resource)
            .into_iter()
            .filter_map(|(key, (value, _))| {
                let resolved = self.resolve_value(resource, &key, &value)?;
                Some((key, resolved))
            })
            .collect()
    }

    pub fn resolve_value(&self, resource: &Resource, key: &str, value: &Value) -> Option<LiteralValue> {
        match value {
            Value::Literal(lit) => Some(lit.clone()),
            Value::Reference { reference, path } => {
                let resolved = self
                    .graph
                    .follow(&resource.id, reference)
                    .first()
                    .and_then(|id| self.store.resources().get(id))
                    .and_then(|target| Subject::Resource(target).property(path))
                    .and_then(|json| LiteralValue::from_json(&json));
                if resolved.is_none() {
                    self.matcher.diagnostics.record(
                        DiagnosticKind::VariableResolution,
                        &format!("resource/{}", resource.id),
                        format!(
                            "variable {key}: reference {reference} path {} did not resolve",
                            path.join(".")
                        ),
                    );
                }
                resolved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::domain::{DeploymentVariable, DeploymentVariableValue, ResourceVariable};
    use crate::selector::{Selector, SelectorCache};
    use chrono::Utc;

    fn resource(id: &str, tier: &str) -> Resource {
        Resource {
            id: id.into(),
            workspace_id: "ws".into(),
            name: id.into(),
            kind: "service".into(),
            identifier: id.into(),
            version: String::new(),
            metadata: [("tier".to_string(), tier.to_string())].into_iter().collect(),
            config: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn variable(id: &str, key: &str, default: Option<Value>) -> DeploymentVariable {
        DeploymentVariable {
            id: id.into(),
            deployment_id: "d1".into(),
            key: key.into(),
            description: None,
            default_value: default,
        }
    }

    fn value(id: &str, variable_id: &str, selector: Option<&str>, v: i64, priority: i64) -> DeploymentVariableValue {
        DeploymentVariableValue {
            id: id.into(),
            variable_id: variable_id.into(),
            resource_selector: selector.map(Selector::cel),
            value: Value::literal(v),
            priority,
        }
    }

    fn resolve(store: &Store, resource: &Resource) -> BTreeMap<String, LiteralValue> {
        let cache = SelectorCache::new();
        let diags = Diagnostics::new(10);
        let graph = RelationshipGraph::new();
        VariableResolver::new(store, &graph, Matcher::new(&cache, &diags)).resolve("d1", resource)
    }

    #[test]
    fn precedence_override_then_priority_then_default() {
        let mut store = Store::new();
        let r1 = resource("r1", "gold");
        let r2 = resource("r2", "silver");
        let r3 = resource("r3", "bronze");
        store.upsert_deployment_variable(variable("v-replicas", "replicas", Some(Value::literal(3i64))));
        store.upsert_deployment_variable_value(value("a", "v-replicas", Some("resource.metadata.tier == 'gold'"), 10, 1));
        store.upsert_deployment_variable_value(value("b", "v-replicas", Some("resource.metadata.tier != 'bronze'"), 20, 5));
        store.upsert_deployment_variable_value(value("c", "v-replicas", Some("resource.metadata.tier == 'silver'"), 30, 5));
        store.upsert_resource_variable(ResourceVariable {
            resource_id: "r1".into(),
            key: "replicas".into(),
            value: Value::literal(99i64),
            sensitive: false,
        });

        assert_eq!(resolve(&store, &r1)["replicas"], LiteralValue::Int(99));
        // b and c tie on priority; b was inserted first.
        assert_eq!(resolve(&store, &r2)["replicas"], LiteralValue::Int(20));
        assert_eq!(resolve(&store, &r3)["replicas"], LiteralValue::Int(3));
    }

    #[test]
    fn key_without_default_or_match_is_omitted() {
        let mut store = Store::new();
        store.upsert_deployment_variable(variable("v1", "region", None));
        store.upsert_deployment_variable_value(value("a", "v1", Some("false"), 1, 0));
        assert!(resolve(&store, &resource("r1", "gold")).is_empty());
    }

    #[test]
    fn unresolved_reference_is_omitted() {
        let mut store = Store::new();
        store.upsert_deployment_variable(variable(
            "v1",
            "vpc_cidr",
            Some(Value::reference("vpc", &["metadata", "cidr"])),
        ));
        let cache = SelectorCache::new();
        let diags = Diagnostics::new(10);
        let graph = RelationshipGraph::new();
        let resolver = VariableResolver::new(&store, &graph, Matcher::new(&cache, &diags));
        assert!(resolver.resolve("d1", &resource("r1", "gold")).is_empty());
        assert_eq!(diags.snapshot()[0].kind, DiagnosticKind::VariableResolution);
    }
}
