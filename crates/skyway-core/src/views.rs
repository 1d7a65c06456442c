//! Materialized views derived from the store.
//!
//! | View                 | Key           | Value               |
//! |----------------------|---------------|---------------------|
//! | environment members  | environment   | resource ids        |
//! | deployment members   | deployment    | resource ids        |
//! | release targets      | -             | `(d, e, r)` triples |
//!
//! A target exists iff the deployment and environment share a system and
//! both admit the resource. Refreshes are scoped to one entity and report
//! which targets appeared and disappeared.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Deployment, Environment, ReleaseTarget, Resource};
use crate::selector::{Matcher, Subject};
use crate::store::Store;

/// Targets gained and lost by a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDelta {
    pub added: BTreeSet<ReleaseTarget>,
    pub removed: BTreeSet<ReleaseTarget>,
}

impl TargetDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: TargetDelta) {
        for t in other.added {
            if !self.removed.remove(&t) {
                self.added.insert(t);
            }
        }
        for t in other.removed {
            if !self.added.remove(&t) {
                self.removed.insert(t);
            }
        }
    }

    pub fn touched(&self) -> impl Iterator<Item = &ReleaseTarget> {
        self.added.iter().chain(self.removed.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializedViews {
    environment_resources: BTreeMap<String, BTreeSet<String>>,
    deployment_resources: BTreeMap<String, BTreeSet<String>>,
    targets: BTreeSet<ReleaseTarget>,
}

fn environment_admits(matcher: Matcher<'_>, env: &Environment, resource: &Resource) -> bool {
    matcher.admits(
        env.resource_selector.as_ref(),
        Subject::Resource(resource),
        false,
        &format!("environment/{}", env.id),
    )
}

fn deployment_admits(matcher: Matcher<'_>, deployment: &Deployment, resource: &Resource) -> bool {
    matcher.admits(
        deployment.resource_selector.as_ref(),
        Subject::Resource(resource),
        true,
        &format!("deployment/{}", deployment.id),
    )
}

impl MaterializedViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> &BTreeSet<ReleaseTarget> {
        &self.targets
    }

    pub fn contains(&self, target: &ReleaseTarget) -> bool {
        self.targets.contains(target)
    }

    pub fn environment_resources(&self, environment_id: &str) -> impl Iterator<Item = &String> {
        self.environment_resources.get(environment_id).into_iter().flatten()
    }

    pub fn deployment_resources(&self, deployment_id: &str) -> impl Iterator<Item = &String> {
        self.deployment_resources.get(deployment_id).into_iter().flatten()
    }

    pub fn targets_for_deployment<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> impl Iterator<Item = &'a ReleaseTarget> + 'a {
        self.targets
            .iter()
            .filter(move |t| t.deployment_id == deployment_id)
    }

    pub fn targets_for_environment<'a>(
        &'a self,
        environment_id: &'a str,
    ) -> impl Iterator<Item = &'a ReleaseTarget> + 'a {
        self.targets
            .iter()
            .filter(move |t| t.environment_id == environment_id)
    }

    pub fn targets_for_resource<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> impl Iterator<Item = &'a ReleaseTarget> + 'a {
        self.targets
            .iter()
            .filter(move |t| t.resource_id == resource_id)
    }

    /// Recompute every view from scratch.
    pub fn rebuild(&mut self, store: &Store, matcher: Matcher<'_>) -> TargetDelta {
        self.environment_resources.clear();
        self.deployment_resources.clear();
        for env in store.environments().items() {
            let members = store
                .resources()
                .items()
                .filter(|r| environment_admits(matcher, env, r))
                .map(|r| r.id.clone())
                .collect();
            self.environment_resources.insert(env.id.clone(), members);
        }
        for deployment in store.deployments().items() {
            let members = store
                .resources()
                .items()
                .filter(|r| deployment_admits(matcher, deployment, r))
                .map(|r| r.id.clone())
                .collect();
            self.deployment_resources
                .insert(deployment.id.clone(), members);
        }
        let fresh: BTreeSet<ReleaseTarget> = store
            .environments()
            .items()
            .flat_map(|env| self.compute_for_environment(store, env))
            .collect();
        self.replace(|_| true, fresh)
    }

    /// Re-evaluate one resource against every environment and deployment.
    /// A resource missing from the store is removed from every view.
    pub fn refresh_resource(
        &mut self,
        store: &Store,
        matcher: Matcher<'_>,
        resource_id: &str,
    ) -> TargetDelta {
        let resource = store.resources().get(resource_id);
        for env in store.environments().items() {
            let admitted = resource.map_or(false, |r| environment_admits(matcher, env, r));
            let set = self.environment_resources.entry(env.id.clone()).or_default();
            if admitted {
                set.insert(resource_id.to_string());
            } else {
                set.remove(resource_id);
            }
        }
        for deployment in store.deployments().items() {
            let admitted = resource.map_or(false, |r| deployment_admits(matcher, deployment, r));
            let set = self
                .deployment_resources
                .entry(deployment.id.clone())
                .or_default();
            if admitted {
                set.insert(resource_id.to_string());
            } else {
                set.remove(resource_id);
            }
        }

        let mut fresh = BTreeSet::new();
        if resource.is_some() {
            for env in store.environments().items() {
                if !self.env_has(&env.id, resource_id) {
                    continue;
                }
                for deployment in store.deployments_in_system(&env.system_id) {
                    if self.deployment_has(&deployment.id, resource_id) {
                        fresh.insert(ReleaseTarget::new(&deployment.id, &env.id, resource_id));
                    }
                }
            }
        }
        self.replace(|t| t.resource_id == resource_id, fresh)
    }

    /// Re-evaluate one environment's selector over every resource.
    pub fn refresh_environment(
        &mut self,
        store: &Store,
        matcher: Matcher<'_>,
        environment_id: &str,
    ) -> TargetDelta {
        let Some(env) = store.environments().get(environment_id) else {
            self.environment_resources.remove(environment_id);
            return self.replace(|t| t.environment_id == environment_id, BTreeSet::new());
        };
        let members = store
            .resources()
            .items()
            .filter(|r| environment_admits(matcher, env, r))
            .map(|r| r.id.clone())
            .collect();
        self.environment_resources
            .insert(environment_id.to_string(), members);
        let fresh = self.compute_for_environment(store, env);
        self.replace(|t| t.environment_id == environment_id, fresh)
    }

    /// Re-evaluate one deployment's selector over every resource.
    pub fn refresh_deployment(
        &mut self,
        store: &Store,
        matcher: Matcher<'_>,
        deployment_id: &str,
    ) -> TargetDelta {
        let Some(deployment) = store.deployments().get(deployment_id) else {
            self.deployment_resources.remove(deployment_id);
            return self.replace(|t| t.deployment_id == deployment_id, BTreeSet::new());
        };
        let members: BTreeSet<String> = store
            .resources()
            .items()
            .filter(|r| deployment_admits(matcher, deployment, r))
            .map(|r| r.id.clone())
            .collect();
        let mut fresh = BTreeSet::new();
        for env in store.environments_in_system(&deployment.system_id) {
            for resource_id in self.environment_resources(&env.id) {
                if members.contains(resource_id) {
                    fresh.insert(ReleaseTarget::new(deployment_id, &env.id, resource_id));
                }
            }
        }
        self.deployment_resources
            .insert(deployment_id.to_string(), members);
        self.replace(|t| t.deployment_id == deployment_id, fresh)
    }

    fn env_has(&self, env_id: &str, resource_id: &str) -> bool {
        self.environment_resources
            .get(env_id)
            .map_or(false, |s| s.contains(resource_id))
    }

    fn deployment_has(&self, deployment_id: &str, resource_id: &str) -> bool {
        self.deployment_resources
            .get(deployment_id)
            .map_or(false, |s| s.contains(resource_id))
    }

    fn compute_for_environment(&self, store: &Store, env: &Environment) -> BTreeSet<ReleaseTarget> {
        let mut out = BTreeSet::new();
        for deployment in store.deployments_in_system(&env.system_id) {
            for resource_id in self.environment_resources(&env.id) {
                if self.deployment_has(&deployment.id, resource_id) {
                    out.insert(ReleaseTarget::new(&deployment.id, &env.id, resource_id));
                }
            }
        }
        out
    }

    /// Swap the targets selected by `scope` for `fresh`.
    fn replace<F>(&mut self, scope: F, fresh: BTreeSet<ReleaseTarget>) -> TargetDelta
    where
        F: Fn(&ReleaseTarget) -> bool,
    {
        let stale: BTreeSet<ReleaseTarget> = self
            .targets
            .iter()
            .filter(|t| scope(*t) && !fresh.contains(*t))
            .cloned()
            .collect();
        let added: BTreeSet<ReleaseTarget> = fresh
            .into_iter()
            .filter(|t| !self.targets.contains(t))
            .collect();
        for t in &stale {
            self.targets.remove(t);
        }
        self.targets.extend(added.iter().cloned());
        TargetDelta {
            added,
            removed: stale,
        }
    }
}
