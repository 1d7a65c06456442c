//! In-memory repository store for every entity kind.
//!
//! Mutations go through typed methods so secondary indices stay coherent
//! with the primary maps. Every mutation appends to a change log that the
//! dispatcher drains once per event. While a journal is open each mutation
//! also records the prior value it displaced, so a failed event can be
//! undone without copying the store.

mod repository;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use repository::Repository;

use crate::domain::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Entity,
    EntityKind, Environment, Job, JobAgent, Policy, PolicyBypass, RelationshipRule, Release,
    ReleaseTarget, Resource, ResourceVariable, System, UserApprovalRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Created,
    Updated,
    Deleted,
}

/// One committed store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: EntityKind,
    pub id: String,
    pub op: ChangeOp,
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    systems: Repository<System>,
    deployments: Repository<Deployment>,
    environments: Repository<Environment>,
    resources: Repository<Resource>,
    job_agents: Repository<JobAgent>,
    versions: Repository<DeploymentVersion>,
    deployment_variables: Repository<DeploymentVariable>,
    deployment_variable_values: Repository<DeploymentVariableValue>,
    resource_variables: Repository<ResourceVariable>,
    relationship_rules: Repository<RelationshipRule>,
    policies: Repository<Policy>,
    bypasses: Repository<PolicyBypass>,
    approvals: Repository<UserApprovalRecord>,
    releases: Repository<Release>,
    jobs: Repository<Job>,

    deployments_by_system: BTreeMap<String, BTreeSet<String>>,
    environments_by_system: BTreeMap<String, BTreeSet<String>>,
    versions_by_deployment: BTreeMap<String, BTreeSet<String>>,
    variables_by_deployment: BTreeMap<String, BTreeSet<String>>,
    /// Insertion order matters: it breaks priority ties.
    values_by_variable: BTreeMap<String, Vec<String>>,
    resource_variables_by_resource: BTreeMap<String, BTreeSet<String>>,
    releases_by_target: BTreeMap<ReleaseTarget, BTreeSet<String>>,
    /// Creation order per target.
    jobs_by_target: BTreeMap<ReleaseTarget, Vec<String>>,

    changes: Vec<Change>,
    journal: Option<Vec<Undo>>,
}

/// Prior state of one journaled mutation, keyed by entity id. `None`
/// means the entity did not exist before.
#[derive(Debug, Clone)]
enum Undo {
    System(String, Option<System>),
    Deployment(String, Option<Deployment>),
    Environment(String, Option<Environment>),
    Resource(String, Option<Resource>),
    JobAgent(String, Option<JobAgent>),
    Version(String, Option<DeploymentVersion>),
    Variable(String, Option<DeploymentVariable>),
    /// The slot is set when the value left a variable's ordered list.
    VariableValue(String, Option<DeploymentVariableValue>, Option<usize>),
    ResourceVariable(String, Option<ResourceVariable>),
    RelationshipRule(String, Option<RelationshipRule>),
    Policy(String, Option<Policy>),
    Bypass(String, Option<PolicyBypass>),
    Approval(String, Option<UserApprovalRecord>),
    Release(String, Option<Release>),
    /// The slot is set when the job left its target's creation order.
    Job(String, Option<Job>, Option<usize>),
}

/// Put back `prior` through the typed upsert, or drop what was created.
macro_rules! revert {
    ($store:expr, $id:ident, $prior:ident, $upsert:ident, $remove:ident) => {
        match $prior {
            Some(prior) => {
                $store.$upsert(prior);
            }
            None => {
                $store.$remove(&$id);
            }
        }
    };
}

fn index_insert(index: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    index.entry(key.to_string()).or_default().insert(id.to_string());
}

fn index_remove(index: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(set) = index.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

fn index_ids<'a>(
    index: &'a BTreeMap<String, BTreeSet<String>>,
    key: &str,
) -> impl Iterator<Item = &'a String> + 'a {
    index.get(key).into_iter().flatten()
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn log<T: Entity>(&mut self, id: String, existed: bool) {
        self.changes.push(Change {
            kind: T::KIND,
            id,
            op: if existed {
                ChangeOp::Updated
            } else {
                ChangeOp::Created
            },
        });
    }

    fn log_delete<T: Entity>(&mut self, id: &str) {
        self.changes.push(Change {
            kind: T::KIND,
            id: id.to_string(),
            op: ChangeOp::Deleted,
        });
    }

    fn record(&mut self, undo: impl FnOnce() -> Undo) {
        if let Some(journal) = &mut self.journal {
            journal.push(undo());
        }
    }

    /// Drain the change log accumulated since the last call.
    pub fn take_changes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.changes)
    }

    /// Changes logged since the last drain.
    pub fn pending_changes(&self) -> &[Change] {
        &self.changes
    }

    /// Start recording undo entries; replaces any journal still open.
    pub fn begin_journal(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Keep every journaled mutation.
    pub fn end_journal(&mut self) {
        self.journal = None;
    }

    /// Undo every mutation since [`Store::begin_journal`], newest first,
    /// and close the journal. Returns the undone changes; the change log
    /// is left empty.
    pub fn rollback(&mut self) -> Vec<Change> {
        let Some(journal) = self.journal.take() else {
            return self.take_changes();
        };
        let undone = self.take_changes();
        for undo in journal.into_iter().rev() {
            self.undo(undo);
        }
        self.changes.clear();
        undone
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::System(id, prior) => revert!(self, id, prior, upsert_system, remove_system),
            Undo::Deployment(id, prior) => {
                revert!(self, id, prior, upsert_deployment, remove_deployment)
            }
            Undo::Environment(id, prior) => {
                revert!(self, id, prior, upsert_environment, remove_environment)
            }
            Undo::Resource(id, prior) => revert!(self, id, prior, upsert_resource, remove_resource),
            Undo::JobAgent(id, prior) => {
                revert!(self, id, prior, upsert_job_agent, remove_job_agent)
            }
            Undo::Version(id, prior) => revert!(self, id, prior, upsert_version, remove_version),
            Undo::Variable(id, prior) => revert!(
                self,
                id,
                prior,
                upsert_deployment_variable,
                remove_deployment_variable
            ),
            Undo::VariableValue(id, prior, slot) => {
                let variable_id = prior.as_ref().map(|v| v.variable_id.clone());
                revert!(
                    self,
                    id,
                    prior,
                    upsert_deployment_variable_value,
                    remove_deployment_variable_value
                );
                if let (Some(variable_id), Some(slot)) = (variable_id, slot) {
                    if let Some(ids) = self.values_by_variable.get_mut(&variable_id) {
                        ids.retain(|v| *v != id);
                        ids.insert(slot.min(ids.len()), id);
                    }
                }
            }
            Undo::ResourceVariable(id, prior) => revert!(
                self,
                id,
                prior,
                upsert_resource_variable,
                remove_resource_variable
            ),
            Undo::RelationshipRule(id, prior) => revert!(
                self,
                id,
                prior,
                upsert_relationship_rule,
                remove_relationship_rule
            ),
            Undo::Policy(id, prior) => revert!(self, id, prior, upsert_policy, remove_policy),
            Undo::Bypass(id, prior) => revert!(self, id, prior, upsert_bypass, remove_bypass),
            Undo::Approval(id, prior) => revert!(self, id, prior, upsert_approval, remove_approval),
            Undo::Release(id, prior) => revert!(self, id, prior, intern_release, remove_release),
            Undo::Job(id, None, _) => {
                self.remove_job(&id);
            }
            Undo::Job(_, Some(job), None) => {
                self.jobs.upsert(job);
            }
            Undo::Job(id, Some(job), Some(slot)) => {
                let ids = self
                    .jobs_by_target
                    .entry(job.release_target.clone())
                    .or_default();
                ids.insert(slot.min(ids.len()), id);
                self.jobs.upsert(job);
            }
        }
    }

    // ---- read access -------------------------------------------------

    pub fn systems(&self) -> &Repository<System> {
        &self.systems
    }
    pub fn deployments(&self) -> &Repository<Deployment> {
        &self.deployments
    }
    pub fn environments(&self) -> &Repository<Environment> {
        &self.environments
    }
    pub fn resources(&self) -> &Repository<Resource> {
        &self.resources
    }
    pub fn job_agents(&self) -> &Repository<JobAgent> {
        &self.job_agents
    }
    pub fn versions(&self) -> &Repository<DeploymentVersion> {
        &self.versions
    }
    pub fn deployment_variables(&self) -> &Repository<DeploymentVariable> {
        &self.deployment_variables
    }
    pub fn deployment_variable_values(&self) -> &Repository<DeploymentVariableValue> {
        &self.deployment_variable_values
    }
    pub fn resource_variables(&self) -> &Repository<ResourceVariable> {
        &self.resource_variables
    }
    pub fn relationship_rules(&self) -> &Repository<RelationshipRule> {
        &self.relationship_rules
    }
    pub fn policies(&self) -> &Repository<Policy> {
        &self.policies
    }
    pub fn bypasses(&self) -> &Repository<PolicyBypass> {
        &self.bypasses
    }
    pub fn approvals(&self) -> &Repository<UserApprovalRecord> {
        &self.approvals
    }
    pub fn releases(&self) -> &Repository<Release> {
        &self.releases
    }
    pub fn jobs(&self) -> &Repository<Job> {
        &self.jobs
    }

    pub fn deployments_in_system(&self, system_id: &str) -> impl Iterator<Item = &Deployment> {
        index_ids(&self.deployments_by_system, system_id).filter_map(|id| self.deployments.get(id))
    }

    pub fn environments_in_system(&self, system_id: &str) -> impl Iterator<Item = &Environment> {
        index_ids(&self.environments_by_system, system_id)
            .filter_map(|id| self.environments.get(id))
    }

    pub fn versions_of(&self, deployment_id: &str) -> impl Iterator<Item = &DeploymentVersion> {
        index_ids(&self.versions_by_deployment, deployment_id)
            .filter_map(|id| self.versions.get(id))
    }

    pub fn variables_of(&self, deployment_id: &str) -> impl Iterator<Item = &DeploymentVariable> {
        index_ids(&self.variables_by_deployment, deployment_id)
            .filter_map(|id| self.deployment_variables.get(id))
    }

    pub fn variable_by_key(&self, deployment_id: &str, key: &str) -> Option<&DeploymentVariable> {
        self.variables_of(deployment_id).find(|v| v.key == key)
    }

    /// Values of a variable in insertion order.
    pub fn values_of(&self, variable_id: &str) -> impl Iterator<Item = &DeploymentVariableValue> {
        self.values_by_variable
            .get(variable_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.deployment_variable_values.get(id))
    }

    pub fn resource_variables_of(
        &self,
        resource_id: &str,
    ) -> impl Iterator<Item = &ResourceVariable> {
        index_ids(&self.resource_variables_by_resource, resource_id)
            .filter_map(|key| self.resource_variables.get(key))
    }

    pub fn resource_variable(&self, resource_id: &str, key: &str) -> Option<&ResourceVariable> {
        self.resource_variables
            .get(&ResourceVariable::key_for(resource_id, key))
    }

    pub fn releases_for(&self, target: &ReleaseTarget) -> impl Iterator<Item = &Release> {
        self.releases_by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|id| self.releases.get(id))
    }

    /// Jobs of a target, oldest first.
    pub fn jobs_for(&self, target: &ReleaseTarget) -> impl Iterator<Item = &Job> {
        self.jobs_by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Targets that have ever had a job.
    pub fn job_targets(&self) -> impl Iterator<Item = &ReleaseTarget> {
        self.jobs_by_target.keys()
    }

    /// Jobs grouped by target in creation order; a stable encoding order.
    pub fn jobs_in_order(&self) -> impl Iterator<Item = &Job> {
        self.jobs_by_target
            .values()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Variable values grouped by variable in insertion order.
    pub fn variable_values_in_order(&self) -> impl Iterator<Item = &DeploymentVariableValue> {
        self.values_by_variable
            .values()
            .flatten()
            .filter_map(|id| self.deployment_variable_values.get(id))
    }

    // ---- systems -----------------------------------------------------

    pub fn upsert_system(&mut self, system: System) {
        let id = system.id();
        let previous = self.systems.upsert(system);
        let existed = previous.is_some();
        self.record(|| Undo::System(id.clone(), previous));
        self.log::<System>(id, existed);
    }

    pub fn remove_system(&mut self, id: &str) -> Option<System> {
        let removed = self.systems.remove(id)?;
        self.record(|| Undo::System(id.to_string(), Some(removed.clone())));
        self.log_delete::<System>(id);
        Some(removed)
    }

    // ---- deployments -------------------------------------------------

    pub fn upsert_deployment(&mut self, deployment: Deployment) -> Option<Deployment> {
        let id = deployment.id();
        index_insert(&mut self.deployments_by_system, &deployment.system_id, &id);
        let previous = self.deployments.upsert(deployment);
        if let Some(prev) = &previous {
            let moved = self
                .deployments
                .get(&id)
                .map_or(false, |d| d.system_id != prev.system_id);
            if moved {
                index_remove(&mut self.deployments_by_system, &prev.system_id, &id);
            }
        }
        self.record(|| Undo::Deployment(id.clone(), previous.clone()));
        self.log::<Deployment>(id, previous.is_some());
        previous
    }

    pub fn remove_deployment(&mut self, id: &str) -> Option<Deployment> {
        let removed = self.deployments.remove(id)?;
        index_remove(&mut self.deployments_by_system, &removed.system_id, id);
        self.record(|| Undo::Deployment(id.to_string(), Some(removed.clone())));
        self.log_delete::<Deployment>(id);
        Some(removed)
    }

    // ---- environments ------------------------------------------------

    pub fn upsert_environment(&mut self, environment: Environment) -> Option<Environment> {
        let id = environment.id();
        index_insert(&mut self.environments_by_system, &environment.system_id, &id);
        let previous = self.environments.upsert(environment);
        if let Some(prev) = &previous {
            let moved = self
                .environments
                .get(&id)
                .map_or(false, |e| e.system_id != prev.system_id);
            if moved {
                index_remove(&mut self.environments_by_system, &prev.system_id, &id);
            }
        }
        self.record(|| Undo::Environment(id.clone(), previous.clone()));
        self.log::<Environment>(id, previous.is_some());
        previous
    }

    pub fn remove_environment(&mut self, id: &str) -> Option<Environment> {
        let removed = self.environments.remove(id)?;
        index_remove(&mut self.environments_by_system, &removed.system_id, id);
        self.record(|| Undo::Environment(id.to_string(), Some(removed.clone())));
        self.log_delete::<Environment>(id);
        Some(removed)
    }

    // ---- resources ---------------------------------------------------

    pub fn upsert_resource(&mut self, resource: Resource) -> Option<Resource> {
        let id = resource.id();
        let previous = self.resources.upsert(resource);
        self.record(|| Undo::Resource(id.clone(), previous.clone()));
        self.log::<Resource>(id, previous.is_some());
        previous
    }

    pub fn remove_resource(&mut self, id: &str) -> Option<Resource> {
        let removed = self.resources.remove(id)?;
        self.record(|| Undo::Resource(id.to_string(), Some(removed.clone())));
        self.log_delete::<Resource>(id);
        Some(removed)
    }

    // ---- job agents --------------------------------------------------

    pub fn upsert_job_agent(&mut self, agent: JobAgent) -> Option<JobAgent> {
        let id = agent.id();
        let previous = self.job_agents.upsert(agent);
        self.record(|| Undo::JobAgent(id.clone(), previous.clone()));
        self.log::<JobAgent>(id, previous.is_some());
        previous
    }

    pub fn remove_job_agent(&mut self, id: &str) -> Option<JobAgent> {
        let removed = self.job_agents.remove(id)?;
        self.record(|| Undo::JobAgent(id.to_string(), Some(removed.clone())));
        self.log_delete::<JobAgent>(id);
        Some(removed)
    }

    // ---- versions ----------------------------------------------------

    pub fn upsert_version(&mut self, version: DeploymentVersion) -> Option<DeploymentVersion> {
        let id = version.id();
        index_insert(&mut self.versions_by_deployment, &version.deployment_id, &id);
        let deployment_id = version.deployment_id.clone();
        let previous = self.versions.upsert(version);
        if let Some(prev) = &previous {
            if prev.deployment_id != deployment_id {
                index_remove(&mut self.versions_by_deployment, &prev.deployment_id, &id);
            }
        }
        self.record(|| Undo::Version(id.clone(), previous.clone()));
        self.log::<DeploymentVersion>(id, previous.is_some());
        previous
    }

    pub fn remove_version(&mut self, id: &str) -> Option<DeploymentVersion> {
        let removed = self.versions.remove(id)?;
        index_remove(&mut self.versions_by_deployment, &removed.deployment_id, id);
        self.record(|| Undo::Version(id.to_string(), Some(removed.clone())));
        self.log_delete::<DeploymentVersion>(id);
        Some(removed)
    }

    // ---- deployment variables ----------------------------------------

    pub fn upsert_deployment_variable(
        &mut self,
        variable: DeploymentVariable,
    ) -> Option<DeploymentVariable> {
        let id = variable.id();
        index_insert(&mut self.variables_by_deployment, &variable.deployment_id, &id);
        let deployment_id = variable.deployment_id.clone();
        let previous = self.deployment_variables.upsert(variable);
        if let Some(prev) = &previous {
            if prev.deployment_id != deployment_id {
                index_remove(&mut self.variables_by_deployment, &prev.deployment_id, &id);
            }
        }
        self.record(|| Undo::Variable(id.clone(), previous.clone()));
        self.log::<DeploymentVariable>(id, previous.is_some());
        previous
    }

    pub fn remove_deployment_variable(&mut self, id: &str) -> Option<DeploymentVariable> {
        let removed = self.deployment_variables.remove(id)?;
        index_remove(&mut self.variables_by_deployment, &removed.deployment_id, id);
        self.record(|| Undo::Variable(id.to_string(), Some(removed.clone())));
        self.log_delete::<DeploymentVariable>(id);
        Some(removed)
    }

    /// An update keeps the value's position unless it moves to another
    /// variable, in which case it is appended there.
    pub fn upsert_deployment_variable_value(
        &mut self,
        value: DeploymentVariableValue,
    ) -> Option<DeploymentVariableValue> {
        let id = value.id();
        let variable_id = value.variable_id.clone();
        let previous = self.deployment_variable_values.upsert(value);
        let mut slot = None;
        match &previous {
            Some(prev) if prev.variable_id != variable_id => {
                slot = self.detach_value(&prev.variable_id, &id);
                self.values_by_variable
                    .entry(variable_id)
                    .or_default()
                    .push(id.clone());
            }
            Some(_) => {}
            None => self
                .values_by_variable
                .entry(variable_id)
                .or_default()
                .push(id.clone()),
        }
        self.record(|| Undo::VariableValue(id.clone(), previous.clone(), slot));
        self.log::<DeploymentVariableValue>(id, previous.is_some());
        previous
    }

    pub fn remove_deployment_variable_value(
        &mut self,
        id: &str,
    ) -> Option<DeploymentVariableValue> {
        let removed = self.deployment_variable_values.remove(id)?;
        let slot = self.detach_value(&removed.variable_id, id);
        self.record(|| Undo::VariableValue(id.to_string(), Some(removed.clone()), slot));
        self.log_delete::<DeploymentVariableValue>(id);
        Some(removed)
    }

    /// Unlink a value from its variable's list; returns the slot it held.
    fn detach_value(&mut self, variable_id: &str, value_id: &str) -> Option<usize> {
        let ids = self.values_by_variable.get_mut(variable_id)?;
        let slot = ids.iter().position(|v| v == value_id);
        if let Some(slot) = slot {
            ids.remove(slot);
        }
        if ids.is_empty() {
            self.values_by_variable.remove(variable_id);
        }
        slot
    }

    // ---- resource variables ------------------------------------------

    pub fn upsert_resource_variable(
        &mut self,
        variable: ResourceVariable,
    ) -> Option<ResourceVariable> {
        let key = variable.id();
        index_insert(
            &mut self.resource_variables_by_resource,
            &variable.resource_id,
            &key,
        );
        let previous = self.resource_variables.upsert(variable);
        self.record(|| Undo::ResourceVariable(key.clone(), previous.clone()));
        self.log::<ResourceVariable>(key, previous.is_some());
        previous
    }

    pub fn remove_resource_variable(&mut self, key: &str) -> Option<ResourceVariable> {
        let removed = self.resource_variables.remove(key)?;
        index_remove(
            &mut self.resource_variables_by_resource,
            &removed.resource_id,
            key,
        );
        self.record(|| Undo::ResourceVariable(key.to_string(), Some(removed.clone())));
        self.log_delete::<ResourceVariable>(key);
        Some(removed)
    }

    // ---- rules, policies, bypasses, approvals -------------------------

    pub fn upsert_relationship_rule(&mut self, rule: RelationshipRule) -> Option<RelationshipRule> {
        let id = rule.id();
        let previous = self.relationship_rules.upsert(rule);
        self.record(|| Undo::RelationshipRule(id.clone(), previous.clone()));
        self.log::<RelationshipRule>(id, previous.is_some());
        previous
    }

    pub fn remove_relationship_rule(&mut self, id: &str) -> Option<RelationshipRule> {
        let removed = self.relationship_rules.remove(id)?;
        self.record(|| Undo::RelationshipRule(id.to_string(), Some(removed.clone())));
        self.log_delete::<RelationshipRule>(id);
        Some(removed)
    }

    pub fn upsert_policy(&mut self, policy: Policy) -> Option<Policy> {
        let id = policy.id();
        let previous = self.policies.upsert(policy);
        self.record(|| Undo::Policy(id.clone(), previous.clone()));
        self.log::<Policy>(id, previous.is_some());
        previous
    }

    pub fn remove_policy(&mut self, id: &str) -> Option<Policy> {
        let removed = self.policies.remove(id)?;
        self.record(|| Undo::Policy(id.to_string(), Some(removed.clone())));
        self.log_delete::<Policy>(id);
        Some(removed)
    }

    pub fn upsert_bypass(&mut self, bypass: PolicyBypass) -> Option<PolicyBypass> {
        let id = bypass.id();
        let previous = self.bypasses.upsert(bypass);
        self.record(|| Undo::Bypass(id.clone(), previous.clone()));
        self.log::<PolicyBypass>(id, previous.is_some());
        previous
    }

    pub fn remove_bypass(&mut self, id: &str) -> Option<PolicyBypass> {
        let removed = self.bypasses.remove(id)?;
        self.record(|| Undo::Bypass(id.to_string(), Some(removed.clone())));
        self.log_delete::<PolicyBypass>(id);
        Some(removed)
    }

    pub fn upsert_approval(&mut self, record: UserApprovalRecord) -> Option<UserApprovalRecord> {
        let id = record.id();
        let previous = self.approvals.upsert(record);
        self.record(|| Undo::Approval(id.clone(), previous.clone()));
        self.log::<UserApprovalRecord>(id, previous.is_some());
        previous
    }

    pub fn remove_approval(&mut self, id: &str) -> Option<UserApprovalRecord> {
        let removed = self.approvals.remove(id)?;
        self.record(|| Undo::Approval(id.to_string(), Some(removed.clone())));
        self.log_delete::<UserApprovalRecord>(id);
        Some(removed)
    }

    // ---- releases ----------------------------------------------------

    /// Intern a release; returns `false` when an identical release (same
    /// fingerprint) was already stored, which is then left untouched.
    pub fn intern_release(&mut self, release: Release) -> bool {
        if self.releases.contains(&release.id) {
            return false;
        }
        let id = release.id();
        self.releases_by_target
            .entry(release.release_target.clone())
            .or_default()
            .insert(id.clone());
        self.releases.upsert(release);
        self.record(|| Undo::Release(id.clone(), None));
        self.log::<Release>(id, false);
        true
    }

    pub fn remove_release(&mut self, id: &str) -> Option<Release> {
        let removed = self.releases.remove(id)?;
        if let Some(set) = self.releases_by_target.get_mut(&removed.release_target) {
            set.remove(id);
            if set.is_empty() {
                self.releases_by_target.remove(&removed.release_target);
            }
        }
        self.record(|| Undo::Release(id.to_string(), Some(removed.clone())));
        self.log_delete::<Release>(id);
        Some(removed)
    }

    // ---- jobs --------------------------------------------------------

    pub fn insert_job(&mut self, job: Job) {
        let id = job.id();
        let existed = self.jobs.contains(&id);
        if !existed {
            self.jobs_by_target
                .entry(job.release_target.clone())
                .or_default()
                .push(id.clone());
        }
        let previous = self.jobs.upsert(job);
        self.record(|| Undo::Job(id.clone(), previous, None));
        self.log::<Job>(id, existed);
    }

    /// Mutate a stored job in place.
    pub fn update_job<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if let Some(journal) = &mut self.journal {
            journal.push(Undo::Job(id.to_string(), Some(job.clone()), None));
        }
        f(job);
        self.log::<Job>(id.to_string(), true);
        true
    }

    pub fn remove_job(&mut self, id: &str) -> Option<Job> {
        let removed = self.jobs.remove(id)?;
        let mut slot = None;
        if let Some(ids) = self.jobs_by_target.get_mut(&removed.release_target) {
            slot = ids.iter().position(|j| j == id);
            if let Some(slot) = slot {
                ids.remove(slot);
            }
            if ids.is_empty() {
                self.jobs_by_target.remove(&removed.release_target);
            }
        }
        self.record(|| Undo::Job(id.to_string(), Some(removed.clone()), slot));
        self.log_delete::<Job>(id);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;

    fn value(id: &str, variable_id: &str, priority: i64) -> DeploymentVariableValue {
        DeploymentVariableValue {
            id: id.into(),
            variable_id: variable_id.into(),
            resource_selector: None,
            value: Value::literal(priority),
            priority,
        }
    }

    fn deployment(id: &str, system_id: &str) -> Deployment {
        Deployment {
            id: id.into(),
            system_id: system_id.into(),
            name: id.into(),
            slug: None,
            description: None,
            job_agent_id: None,
            job_agent_config: serde_json::Value::Null,
            resource_selector: None,
        }
    }

    #[test]
    fn variable_values_keep_insertion_order() {
        let mut store = Store::new();
        store.upsert_deployment_variable_value(value("z", "var", 1));
        store.upsert_deployment_variable_value(value("a", "var", 1));
        store.upsert_deployment_variable_value(value("m", "var", 1));
        // An update keeps the slot.
        store.upsert_deployment_variable_value(value("z", "var", 7));
        let ids: Vec<_> = store.values_of("var").map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "m"]);

        store.upsert_deployment_variable_value(value("z", "other", 7));
        let ids: Vec<_> = store.values_of("var").map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m"]);
        assert_eq!(store.values_of("other").count(), 1);
    }

    #[test]
    fn system_index_follows_moves() {
        let mut store = Store::new();
        store.upsert_deployment(deployment("d1", "s1"));
        store.upsert_deployment(deployment("d1", "s2"));
        assert_eq!(store.deployments_in_system("s1").count(), 0);
        assert_eq!(store.deployments_in_system("s2").count(), 1);
        store.remove_deployment("d1");
        assert_eq!(store.deployments_in_system("s2").count(), 0);
    }

    fn job(id: &str, resource_id: &str) -> Job {
        let now = chrono::Utc::now();
        Job {
            id: id.into(),
            release_id: format!("rel-{id}"),
            release_target: ReleaseTarget::new("d1", "prod", resource_id),
            job_agent_id: None,
            job_agent_config: serde_json::Value::Null,
            status: crate::domain::JobStatus::Pending,
            message: None,
            external_id: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            dispatch_context: None,
        }
    }

    #[test]
    fn rollback_restores_entities_and_order() {
        let mut store = Store::new();
        store.upsert_deployment(deployment("d1", "s1"));
        for id in ["a", "b", "c"] {
            store.upsert_deployment_variable_value(value(id, "var", 1));
        }
        for id in ["j1", "j2", "j3"] {
            store.insert_job(job(id, "r1"));
        }
        store.take_changes();
        let before = crate::snapshot::StoreSnapshot::capture("ws", &store);

        store.begin_journal();
        store.upsert_deployment(deployment("d1", "s2"));
        store.upsert_deployment(deployment("d2", "s1"));
        store.upsert_deployment_variable_value(value("b", "other", 9));
        store.remove_deployment_variable_value("a");
        store.remove_job("j2");
        store.update_job("j3", |j| j.status = crate::domain::JobStatus::Cancelled);
        store.insert_job(job("j4", "r1"));
        let undone = store.rollback();

        assert_eq!(undone.len(), 7);
        assert!(store.take_changes().is_empty());
        assert_eq!(crate::snapshot::StoreSnapshot::capture("ws", &store), before);
        let values: Vec<_> = store.values_of("var").map(|v| v.id.as_str()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
        assert_eq!(store.values_of("other").count(), 0);
        let target = ReleaseTarget::new("d1", "prod", "r1");
        let jobs: Vec<_> = store.jobs_for(&target).map(|j| j.id.as_str()).collect();
        assert_eq!(jobs, vec!["j1", "j2", "j3"]);
        assert_eq!(store.deployments_in_system("s1").count(), 1);
        assert_eq!(store.deployments_in_system("s2").count(), 0);
    }

    #[test]
    fn closed_journal_keeps_mutations() {
        let mut store = Store::new();
        store.begin_journal();
        store.upsert_deployment(deployment("d1", "s1"));
        store.end_journal();
        assert_eq!(store.pending_changes().len(), 1);
        assert_eq!(store.rollback().len(), 1);
        assert!(store.deployments().get("d1").is_some());
    }

    #[test]
    fn change_log_records_ops() {
        let mut store = Store::new();
        store.upsert_deployment(deployment("d1", "s1"));
        store.upsert_deployment(deployment("d1", "s1"));
        store.remove_deployment("d1");
        let ops: Vec<_> = store.take_changes().into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![ChangeOp::Created, ChangeOp::Updated, ChangeOp::Deleted]);
        assert!(store.take_changes().is_empty());
    }
}
