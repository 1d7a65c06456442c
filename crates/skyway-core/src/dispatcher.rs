//! Event dispatcher.
//!
//! Each event runs to completion in five steps: validate, apply to the
//! store while collecting the taint set, refresh the affected views,
//! reconcile every tainted release target, then verify invariants over the
//! targets the event reached. A validation error leaves the state
//! untouched. Any later failure replays the store's undo journal and
//! re-derives the graph and views for the entities the event touched.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::diagnostics::DiagnosticKind;
use crate::domain::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EngineError,
    Entity, EntityKind, Environment, Job, JobStatus, PolicyBypass, ReleaseTarget, Resource,
    ResourceVariable, Result, UserApprovalRecord, ValidationError,
};
use crate::events::{Event, Op};
use crate::jobs::{self, JobTransition};
use crate::obs;
use crate::relationships::RelationshipGraph;
use crate::releases::{reconcile_target, ReconcileMode, ReconcileOutcome};
use crate::selector::Matcher;
use crate::store::{Change, ChangeOp, Repository, Store};
use crate::views::{MaterializedViews, TargetDelta};

/// Everything that rolls back together: entities and the views derived
/// from them.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    pub id: String,
    pub store: Store,
    pub graph: RelationshipGraph,
    pub views: MaterializedViews,
}

impl WorkspaceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// State over an existing store. Graph and views start empty; call
    /// [`Dispatcher::rebuild`] before use.
    pub fn from_store(id: impl Into<String>, store: Store) -> Self {
        Self {
            id: id.into(),
            store,
            ..Self::default()
        }
    }
}

/// Published after an event commits.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceNotification {
    TargetAdded(ReleaseTarget),
    TargetRemoved(ReleaseTarget),
    ReleaseCreated {
        release_id: String,
        target: ReleaseTarget,
    },
    JobCreated {
        job_id: String,
        target: ReleaseTarget,
    },
    JobCancelled {
        job_id: String,
        target: ReleaseTarget,
    },
    JobUpdated {
        job_id: String,
        target: ReleaseTarget,
        from: JobStatus,
        to: JobStatus,
    },
    /// Raw store change, including derived releases and jobs.
    EntityChanged(Change),
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub tainted: usize,
    pub notifications: Vec<WorkspaceNotification>,
}

#[derive(Debug, Default)]
struct Taint {
    targets: BTreeSet<ReleaseTarget>,
    delta: TargetDelta,
    redeploy: Option<ReleaseTarget>,
    transition: Option<JobTransition>,
}

impl Taint {
    fn extend<'t>(&mut self, targets: impl IntoIterator<Item = &'t ReleaseTarget>) {
        self.targets.extend(targets.into_iter().cloned());
    }

    fn absorb(&mut self, delta: TargetDelta) {
        self.extend(delta.touched());
        self.delta.merge(delta);
    }
}

/// Applies events to a [`WorkspaceState`] at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    matcher: Matcher<'a>,
    now: DateTime<Utc>,
    verify_invariants: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(matcher: Matcher<'a>, now: DateTime<Utc>, verify_invariants: bool) -> Self {
        Self {
            matcher,
            now,
            verify_invariants,
        }
    }

    pub fn dispatch(&self, state: &mut WorkspaceState, event: Event) -> Result<DispatchOutcome> {
        validate(&state.store, &state.views, &event)?;
        let kind = event.kind();
        if let Some(owner) = updated_selector_owner(&event) {
            self.matcher.cache.release(&owner);
        }
        state.store.begin_journal();
        let mut taint = Taint::default();
        self.apply(state, event, &mut taint);
        self.commit(state, taint, None, &kind)
    }

    /// Reconcile every release target, plus targets that only have jobs left.
    pub fn reconcile_all(&self, state: &mut WorkspaceState) -> Result<DispatchOutcome> {
        state.store.begin_journal();
        let mut taint = Taint::default();
        taint.extend(state.views.targets());
        taint.extend(state.store.job_targets());
        self.commit(state, taint, None, "workspace.reconcile")
    }

    /// Recompute graph and views from the store, then reconcile everything.
    /// The only path that snapshots the whole state for rollback.
    pub fn rebuild(&self, state: &mut WorkspaceState) -> Result<DispatchOutcome> {
        let backup = state.clone();
        let mut taint = Taint::default();
        state.graph.rebuild(&state.store, self.matcher);
        taint.absorb(state.views.rebuild(&state.store, self.matcher));
        taint.extend(state.views.targets());
        taint.extend(state.store.job_targets());
        self.commit(state, taint, Some(backup), "workspace.rebuild")
    }

    fn commit(
        &self,
        state: &mut WorkspaceState,
        taint: Taint,
        backup: Option<WorkspaceState>,
        kind: &str,
    ) -> Result<DispatchOutcome> {
        let result = self.reconcile(state, &taint).and_then(|outcomes| {
            if self.verify_invariants {
                check_targets(&state.store, scope(&state.store, &taint))
                    .map_err(EngineError::Internal)?;
            }
            Ok(outcomes)
        });
        match result {
            Ok(outcomes) => {
                state.store.end_journal();
                let changes = state.store.take_changes();
                for change in changes.iter().filter(|c| c.op == ChangeOp::Deleted) {
                    if SELECTOR_OWNERS.contains(&change.kind) {
                        self.matcher
                            .cache
                            .release(&format!("{}/{}", change.kind, change.id));
                    }
                }
                Ok(DispatchOutcome {
                    tainted: taint.targets.len(),
                    notifications: notifications(taint, outcomes, changes),
                })
            }
            Err(err) => {
                match backup {
                    Some(previous) => *state = previous,
                    None => self.revert(state),
                }
                state.store.take_changes();
                if let EngineError::Internal(violation) = &err {
                    obs::emit_invariant_violation(&state.id, kind, violation);
                    self.matcher
                        .diagnostics
                        .record(DiagnosticKind::Internal, kind, violation.clone());
                }
                Err(err)
            }
        }
    }

    /// Undo the journaled store mutations, then bring the graph and views
    /// back in line for every entity they derive from.
    fn revert(&self, state: &mut WorkspaceState) {
        let undone = state.store.rollback();
        let touched = |kind| ids_of(&undone, kind);
        let WorkspaceState {
            store,
            graph,
            views,
            ..
        } = state;
        let resources = touched(EntityKind::Resource);
        if touched(EntityKind::RelationshipRule).is_empty() {
            for id in &resources {
                graph.refresh_resource(store, self.matcher, id);
            }
        } else {
            graph.rebuild(store, self.matcher);
        }
        for id in touched(EntityKind::Environment) {
            views.refresh_environment(store, self.matcher, id);
        }
        for id in touched(EntityKind::Deployment) {
            views.refresh_deployment(store, self.matcher, id);
        }
        for id in &resources {
            views.refresh_resource(store, self.matcher, id);
        }
    }

    fn reconcile(
        &self,
        state: &mut WorkspaceState,
        taint: &Taint,
    ) -> Result<Vec<(ReleaseTarget, ReconcileOutcome)>> {
        let WorkspaceState {
            store,
            graph,
            views,
            ..
        } = state;
        let mut outcomes = Vec::new();
        for target in &taint.targets {
            let mode = if taint.redeploy.as_ref() == Some(target) {
                ReconcileMode::Redeploy
            } else {
                ReconcileMode::Converge
            };
            let outcome =
                reconcile_target(store, graph, views, self.matcher, self.now, target, mode)?;
            if !outcome.is_noop() {
                outcomes.push((target.clone(), outcome));
            }
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    fn apply(&self, s: &mut WorkspaceState, event: Event, taint: &mut Taint) {
        match event {
            Event::System(op) => match op {
                Op::Create(system) | Op::Update(system) => s.store.upsert_system(system),
                Op::Delete { id } => self.remove_system(s, &id, taint),
            },
            Event::Deployment(op) => match op {
                Op::Create(d) | Op::Update(d) => self.upsert_deployment(s, d, taint),
                Op::Delete { id } => self.remove_deployment(s, &id, taint),
            },
            Event::Environment(op) => match op {
                Op::Create(e) | Op::Update(e) => self.upsert_environment(s, e, taint),
                Op::Delete { id } => self.remove_environment(s, &id, taint),
            },
            Event::Resource(op) => match op {
                Op::Create(r) | Op::Update(r) => self.upsert_resource(s, r, taint),
                Op::Delete { id } => self.remove_resource(s, &id, taint),
            },
            Event::JobAgent(op) => {
                let id = match op {
                    Op::Create(agent) | Op::Update(agent) => {
                        let id = agent.id.clone();
                        s.store.upsert_job_agent(agent);
                        id
                    }
                    Op::Delete { id } => {
                        s.store.remove_job_agent(&id);
                        id
                    }
                };
                let users: Vec<String> = s
                    .store
                    .deployments()
                    .items()
                    .filter(|d| d.job_agent_id.as_deref() == Some(id.as_str()))
                    .map(|d| d.id.clone())
                    .collect();
                for deployment_id in &users {
                    taint.extend(s.views.targets_for_deployment(deployment_id));
                }
            }
            Event::DeploymentVersion(op) => match op {
                Op::Create(v) | Op::Update(v) => self.upsert_version(s, v, taint),
                Op::Delete { id } => {
                    if let Some(removed) = s.store.remove_version(&id) {
                        taint.extend(s.views.targets_for_deployment(&removed.deployment_id));
                    }
                }
            },
            Event::DeploymentVariable(op) => match op {
                Op::Create(v) | Op::Update(v) => self.upsert_variable(s, v, taint),
                Op::Delete { id } => self.remove_variable(s, &id, taint),
            },
            Event::DeploymentVariableValue(op) => match op {
                Op::Create(v) | Op::Update(v) => self.upsert_variable_value(s, v, taint),
                Op::Delete { id } => {
                    if let Some(removed) = s.store.remove_deployment_variable_value(&id) {
                        self.taint_variable(s, &removed.variable_id, taint);
                    }
                }
            },
            Event::ResourceVariable(op) => {
                let resource_id = match op {
                    Op::Create(v) | Op::Update(v) => {
                        let resource_id = v.resource_id.clone();
                        s.store.upsert_resource_variable(v);
                        Some(resource_id)
                    }
                    Op::Delete { id } => s.store.remove_resource_variable(&id).map(|v| v.resource_id),
                };
                if let Some(resource_id) = resource_id {
                    taint.extend(s.views.targets_for_resource(&resource_id));
                }
            }
            Event::RelationshipRule(op) => {
                let before = s.graph.clone();
                match op {
                    Op::Create(rule) | Op::Update(rule) => {
                        s.store.upsert_relationship_rule(rule);
                    }
                    Op::Delete { id } => {
                        s.store.remove_relationship_rule(&id);
                    }
                }
                s.graph.rebuild(&s.store, self.matcher);
                for resource_id in before.changed_sources(&s.graph) {
                    taint.extend(s.views.targets_for_resource(&resource_id));
                }
            }
            Event::Policy(op) => {
                match op {
                    Op::Create(policy) | Op::Update(policy) => {
                        s.store.upsert_policy(policy);
                    }
                    Op::Delete { id } => {
                        s.store.remove_policy(&id);
                    }
                }
                taint.extend(s.views.targets());
            }
            Event::PolicyBypass(op) => match op {
                Op::Create(bypass) | Op::Update(bypass) => {
                    taint_bypass(s, &bypass, taint);
                    if let Some(previous) = s.store.upsert_bypass(bypass) {
                        taint_bypass(s, &previous, taint);
                    }
                }
                Op::Delete { id } => {
                    if let Some(removed) = s.store.remove_bypass(&id) {
                        taint_bypass(s, &removed, taint);
                    }
                }
            },
            Event::UserApprovalRecord(op) => match op {
                Op::Create(record) | Op::Update(record) => {
                    taint_approval(s, &record, taint);
                    s.store.upsert_approval(record);
                }
                Op::Delete { id } => {
                    if let Some(removed) = s.store.remove_approval(&id) {
                        taint_approval(s, &removed, taint);
                    }
                }
            },
            Event::Job(op) => match op {
                Op::Create(job) => s.store.insert_job(job),
                Op::Update(update) => {
                    let job_id = update.job.id.clone();
                    match jobs::apply_update(&mut s.store, update, self.now) {
                        Ok(transition) => {
                            obs::emit_job_transition(
                                &transition.job_id,
                                transition.from,
                                transition.to,
                            );
                            if transition.entered_terminal() {
                                taint.targets.insert(transition.release_target.clone());
                            }
                            taint.transition = Some(transition);
                        }
                        Err(err) => {
                            obs::emit_job_update_dropped(&job_id, &err);
                            self.matcher.diagnostics.record(
                                DiagnosticKind::JobState,
                                &format!("job/{job_id}"),
                                err.to_string(),
                            );
                        }
                    }
                }
                Op::Delete { id } => {
                    s.store.remove_job(&id);
                }
            },
            Event::ReleaseTargetDeploy(target) => {
                taint.targets.insert(target.clone());
                taint.redeploy = Some(target);
            }
        }
    }

    fn remove_system(&self, s: &mut WorkspaceState, id: &str, taint: &mut Taint) {
        let deployments: Vec<String> = s
            .store
            .deployments_in_system(id)
            .map(|d| d.id.clone())
            .collect();
        for deployment_id in &deployments {
            self.remove_deployment(s, deployment_id, taint);
        }
        let environments: Vec<String> = s
            .store
            .environments_in_system(id)
            .map(|e| e.id.clone())
            .collect();
        for environment_id in &environments {
            self.remove_environment(s, environment_id, taint);
        }
        s.store.remove_system(id);
    }

    fn upsert_deployment(&self, s: &mut WorkspaceState, deployment: Deployment, taint: &mut Taint) {
        let id = deployment.id.clone();
        taint.extend(s.views.targets_for_deployment(&id));
        s.store.upsert_deployment(deployment);
        taint.absorb(s.views.refresh_deployment(&s.store, self.matcher, &id));
        taint.extend(s.views.targets_for_deployment(&id));
    }

    fn remove_deployment(&self, s: &mut WorkspaceState, id: &str, taint: &mut Taint) {
        taint.extend(s.views.targets_for_deployment(id));
        let versions: Vec<String> = s.store.versions_of(id).map(|v| v.id.clone()).collect();
        for version_id in &versions {
            s.store.remove_version(version_id);
        }
        let variables: Vec<String> = s.store.variables_of(id).map(|v| v.id.clone()).collect();
        for variable_id in &variables {
            self.remove_variable(s, variable_id, taint);
        }
        s.store.remove_deployment(id);
        taint.absorb(s.views.refresh_deployment(&s.store, self.matcher, id));
    }

    fn upsert_environment(&self, s: &mut WorkspaceState, env: Environment, taint: &mut Taint) {
        let id = env.id.clone();
        taint.extend(s.views.targets_for_environment(&id));
        s.store.upsert_environment(env);
        taint.absorb(s.views.refresh_environment(&s.store, self.matcher, &id));
        taint.extend(s.views.targets_for_environment(&id));
    }

    fn remove_environment(&self, s: &mut WorkspaceState, id: &str, taint: &mut Taint) {
        taint.extend(s.views.targets_for_environment(id));
        s.store.remove_environment(id);
        taint.absorb(s.views.refresh_environment(&s.store, self.matcher, id));
    }

    /// Taints the resource's own targets and those of every resource that
    /// reaches it through the graph, before and after the change.
    fn upsert_resource(&self, s: &mut WorkspaceState, resource: Resource, taint: &mut Taint) {
        let id = resource.id.clone();
        let mut affected = s.graph.dependents(&id);
        affected.insert(id.clone());
        s.store.upsert_resource(resource);
        s.graph.refresh_resource(&s.store, self.matcher, &id);
        affected.extend(s.graph.dependents(&id));
        taint.absorb(s.views.refresh_resource(&s.store, self.matcher, &id));
        for resource_id in &affected {
            taint.extend(s.views.targets_for_resource(resource_id));
        }
    }

    fn remove_resource(&self, s: &mut WorkspaceState, id: &str, taint: &mut Taint) {
        let keys: Vec<String> = s.store.resource_variables_of(id).map(|v| v.id()).collect();
        for key in &keys {
            s.store.remove_resource_variable(key);
        }
        let affected = s.graph.dependents(id);
        s.store.remove_resource(id);
        s.graph.remove_resource(id);
        taint.absorb(s.views.refresh_resource(&s.store, self.matcher, id));
        for resource_id in &affected {
            taint.extend(s.views.targets_for_resource(resource_id));
        }
    }

    fn upsert_version(&self, s: &mut WorkspaceState, version: DeploymentVersion, taint: &mut Taint) {
        let deployment_id = version.deployment_id.clone();
        if let Some(previous) = s.store.upsert_version(version) {
            taint.extend(s.views.targets_for_deployment(&previous.deployment_id));
        }
        taint.extend(s.views.targets_for_deployment(&deployment_id));
    }

    fn upsert_variable(&self, s: &mut WorkspaceState, variable: DeploymentVariable, taint: &mut Taint) {
        let deployment_id = variable.deployment_id.clone();
        if let Some(previous) = s.store.upsert_deployment_variable(variable) {
            taint.extend(s.views.targets_for_deployment(&previous.deployment_id));
        }
        taint.extend(s.views.targets_for_deployment(&deployment_id));
    }

    fn remove_variable(&self, s: &mut WorkspaceState, id: &str, taint: &mut Taint) {
        let values: Vec<String> = s.store.values_of(id).map(|v| v.id.clone()).collect();
        for value_id in &values {
            s.store.remove_deployment_variable_value(value_id);
        }
        if let Some(removed) = s.store.remove_deployment_variable(id) {
            taint.extend(s.views.targets_for_deployment(&removed.deployment_id));
        }
    }

    fn upsert_variable_value(
        &self,
        s: &mut WorkspaceState,
        value: DeploymentVariableValue,
        taint: &mut Taint,
    ) {
        let variable_id = value.variable_id.clone();
        if let Some(previous) = s.store.upsert_deployment_variable_value(value) {
            self.taint_variable(s, &previous.variable_id, taint);
        }
        self.taint_variable(s, &variable_id, taint);
    }

    fn taint_variable(&self, s: &WorkspaceState, variable_id: &str, taint: &mut Taint) {
        if let Some(variable) = s.store.deployment_variables().get(variable_id) {
            taint.extend(s.views.targets_for_deployment(&variable.deployment_id));
        }
    }
}

/// Entity kinds whose selectors are interned under `<kind>/<id>`.
const SELECTOR_OWNERS: [EntityKind; 5] = [
    EntityKind::Environment,
    EntityKind::Deployment,
    EntityKind::DeploymentVariableValue,
    EntityKind::RelationshipRule,
    EntityKind::Policy,
];

/// Owner handle of an entity whose selectors an update may replace.
fn updated_selector_owner(event: &Event) -> Option<String> {
    let (kind, id) = match event {
        Event::Environment(Op::Update(e)) => (EntityKind::Environment, &e.id),
        Event::Deployment(Op::Update(d)) => (EntityKind::Deployment, &d.id),
        Event::DeploymentVariableValue(Op::Update(v)) => {
            (EntityKind::DeploymentVariableValue, &v.id)
        }
        Event::RelationshipRule(Op::Update(r)) => (EntityKind::RelationshipRule, &r.id),
        Event::Policy(Op::Update(p)) => (EntityKind::Policy, &p.id),
        _ => return None,
    };
    Some(format!("{kind}/{id}"))
}

fn taint_bypass(s: &WorkspaceState, bypass: &PolicyBypass, taint: &mut Taint) {
    let Some(version) = s.store.versions().get(&bypass.version_id) else {
        return;
    };
    let scoped = s.views.targets_for_deployment(&version.deployment_id).filter(|t| {
        bypass
            .environment_id
            .as_deref()
            .map_or(true, |e| e == t.environment_id)
            && bypass.resource_id.as_deref().map_or(true, |r| r == t.resource_id)
    });
    taint.extend(scoped);
}

fn taint_approval(s: &WorkspaceState, record: &UserApprovalRecord, taint: &mut Taint) {
    let Some(version) = s.store.versions().get(&record.version_id) else {
        return;
    };
    let scoped = s
        .views
        .targets_for_deployment(&version.deployment_id)
        .filter(|t| t.environment_id == record.environment_id);
    taint.extend(scoped);
}

fn notifications(
    taint: Taint,
    outcomes: Vec<(ReleaseTarget, ReconcileOutcome)>,
    changes: Vec<Change>,
) -> Vec<WorkspaceNotification> {
    let mut out: Vec<WorkspaceNotification> = taint
        .delta
        .added
        .into_iter()
        .map(WorkspaceNotification::TargetAdded)
        .chain(
            taint
                .delta
                .removed
                .into_iter()
                .map(WorkspaceNotification::TargetRemoved),
        )
        .collect();
    if let Some(t) = taint.transition {
        out.push(WorkspaceNotification::JobUpdated {
            job_id: t.job_id,
            target: t.release_target,
            from: t.from,
            to: t.to,
        });
    }
    for (target, outcome) in outcomes {
        if let Some(release_id) = outcome.release_created {
            out.push(WorkspaceNotification::ReleaseCreated {
                release_id,
                target: target.clone(),
            });
        }
        for job_id in outcome.jobs_cancelled {
            out.push(WorkspaceNotification::JobCancelled {
                job_id,
                target: target.clone(),
            });
        }
        for job_id in outcome.jobs_created {
            out.push(WorkspaceNotification::JobCreated {
                job_id,
                target: target.clone(),
            });
        }
    }
    out.extend(changes.into_iter().map(WorkspaceNotification::EntityChanged));
    out
}

fn ids_of(changes: &[Change], kind: EntityKind) -> BTreeSet<&str> {
    changes
        .iter()
        .filter(|c| c.kind == kind)
        .map(|c| c.id.as_str())
        .collect()
}

/// Targets an event can have broken: everything it tainted plus the
/// targets of jobs it wrote.
fn scope<'s>(store: &'s Store, taint: &'s Taint) -> BTreeSet<&'s ReleaseTarget> {
    let mut targets: BTreeSet<&ReleaseTarget> = taint.targets.iter().collect();
    targets.extend(
        store
            .pending_changes()
            .iter()
            .filter(|c| c.kind == EntityKind::Job)
            .filter_map(|c| store.jobs().get(&c.id))
            .map(|j| &j.release_target),
    );
    targets
}

/// Every job of the given targets references a stored release, and none of
/// them has more than one processing job.
pub fn check_targets<'t>(
    store: &Store,
    targets: impl IntoIterator<Item = &'t ReleaseTarget>,
) -> std::result::Result<(), String> {
    for target in targets {
        let mut processing = 0;
        for job in store.jobs_for(target) {
            if !store.releases().contains(&job.release_id) {
                return Err(format!(
                    "job {} references missing release {}",
                    job.id, job.release_id
                ));
            }
            if job.is_processing() {
                processing += 1;
            }
        }
        if processing > 1 {
            return Err(format!(
                "release target {target} has {processing} processing jobs"
            ));
        }
    }
    Ok(())
}

/// [`check_targets`] over every target that has jobs.
pub fn check_invariants(store: &Store) -> std::result::Result<(), String> {
    check_targets(store, store.job_targets())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

type Checked = std::result::Result<(), ValidationError>;

fn payload<T>(op: &Op<T>) -> Option<&T> {
    match op {
        Op::Create(item) | Op::Update(item) => Some(item),
        Op::Delete { .. } => None,
    }
}

fn presence<T: Entity>(repo: &Repository<T>, op: &Op<T>) -> Checked {
    match op {
        Op::Create(item) => {
            let id = item.id();
            if id.is_empty() {
                return Err(ValidationError::missing(T::KIND, "id"));
            }
            if repo.contains(&id) {
                return Err(ValidationError::AlreadyExists {
                    kind: T::KIND.to_string(),
                    id,
                });
            }
            Ok(())
        }
        Op::Update(item) => {
            let id = item.id();
            if repo.contains(&id) {
                Ok(())
            } else {
                Err(ValidationError::not_found(T::KIND, &id))
            }
        }
        Op::Delete { id } => {
            if repo.contains(id) {
                Ok(())
            } else {
                Err(ValidationError::not_found(T::KIND, id))
            }
        }
    }
}

fn require<T: Entity>(repo: &Repository<T>, owner: EntityKind, owner_id: &str, id: &str) -> Checked {
    if repo.contains(id) {
        Ok(())
    } else {
        Err(ValidationError::unknown(owner, owner_id, T::KIND, id))
    }
}

fn non_empty(kind: EntityKind, field: &str, value: &str) -> Checked {
    if value.trim().is_empty() {
        Err(ValidationError::missing(kind, field))
    } else {
        Ok(())
    }
}

/// Pure check of an event against the current state.
pub fn validate(store: &Store, views: &MaterializedViews, event: &Event) -> Checked {
    match event {
        Event::System(op) => presence(store.systems(), op),
        Event::Deployment(op) => {
            presence(store.deployments(), op)?;
            if let Some(d) = payload(op) {
                require(store.systems(), EntityKind::Deployment, &d.id, &d.system_id)?;
                if let Some(agent) = &d.job_agent_id {
                    require(store.job_agents(), EntityKind::Deployment, &d.id, agent)?;
                }
            }
            Ok(())
        }
        Event::Environment(op) => {
            presence(store.environments(), op)?;
            if let Some(e) = payload(op) {
                require(store.systems(), EntityKind::Environment, &e.id, &e.system_id)?;
            }
            Ok(())
        }
        Event::Resource(op) => presence(store.resources(), op),
        Event::JobAgent(op) => presence(store.job_agents(), op),
        Event::DeploymentVersion(op) => {
            presence(store.versions(), op)?;
            if let Some(v) = payload(op) {
                non_empty(EntityKind::DeploymentVersion, "tag", &v.tag)?;
                require(
                    store.deployments(),
                    EntityKind::DeploymentVersion,
                    &v.id,
                    &v.deployment_id,
                )?;
            }
            Ok(())
        }
        Event::DeploymentVariable(op) => {
            presence(store.deployment_variables(), op)?;
            if let Some(v) = payload(op) {
                non_empty(EntityKind::DeploymentVariable, "key", &v.key)?;
                require(
                    store.deployments(),
                    EntityKind::DeploymentVariable,
                    &v.id,
                    &v.deployment_id,
                )?;
                if let Some(other) = store.variable_by_key(&v.deployment_id, &v.key) {
                    if other.id != v.id {
                        return Err(ValidationError::invalid(
                            EntityKind::DeploymentVariable,
                            &v.id,
                            format!("key {} already defined by {}", v.key, other.id),
                        ));
                    }
                }
            }
            Ok(())
        }
        Event::DeploymentVariableValue(op) => {
            presence(store.deployment_variable_values(), op)?;
            if let Some(v) = payload(op) {
                require(
                    store.deployment_variables(),
                    EntityKind::DeploymentVariableValue,
                    &v.id,
                    &v.variable_id,
                )?;
            }
            Ok(())
        }
        Event::ResourceVariable(op) => {
            presence(store.resource_variables(), op)?;
            if let Some(v) = payload(op) {
                non_empty(EntityKind::ResourceVariable, "key", &v.key)?;
                require(
                    store.resources(),
                    EntityKind::ResourceVariable,
                    &ResourceVariable::key_for(&v.resource_id, &v.key),
                    &v.resource_id,
                )?;
            }
            Ok(())
        }
        Event::RelationshipRule(op) => {
            presence(store.relationship_rules(), op)?;
            if let Some(rule) = payload(op) {
                non_empty(EntityKind::RelationshipRule, "reference", &rule.reference)?;
            }
            Ok(())
        }
        Event::Policy(op) => presence(store.policies(), op),
        Event::PolicyBypass(op) => {
            presence(store.bypasses(), op)?;
            if let Some(b) = payload(op) {
                if b.bypass_rule_kinds.is_empty() {
                    return Err(ValidationError::missing(
                        EntityKind::PolicyBypass,
                        "bypass_rule_kinds",
                    ));
                }
                require(store.versions(), EntityKind::PolicyBypass, &b.id, &b.version_id)?;
            }
            Ok(())
        }
        Event::UserApprovalRecord(op) => {
            presence(store.approvals(), op)?;
            if let Some(r) = payload(op) {
                let id = r.id();
                require(store.versions(), EntityKind::UserApprovalRecord, &id, &r.version_id)?;
                require(
                    store.environments(),
                    EntityKind::UserApprovalRecord,
                    &id,
                    &r.environment_id,
                )?;
            }
            Ok(())
        }
        Event::Job(op) => validate_job(store, op),
        Event::ReleaseTargetDeploy(target) => {
            if views.contains(target) {
                Ok(())
            } else {
                Err(ValidationError::not_found("release_target", &target.to_string()))
            }
        }
    }
}

fn validate_job(store: &Store, op: &Op<Job, crate::domain::JobUpdate>) -> Checked {
    match op {
        Op::Create(job) => {
            non_empty(EntityKind::Job, "id", &job.id)?;
            if store.jobs().contains(&job.id) {
                return Err(ValidationError::AlreadyExists {
                    kind: EntityKind::Job.to_string(),
                    id: job.id.clone(),
                });
            }
            let release = store.releases().get(&job.release_id).ok_or_else(|| {
                ValidationError::unknown(EntityKind::Job, &job.id, EntityKind::Release, &job.release_id)
            })?;
            if release.release_target != job.release_target {
                return Err(ValidationError::invalid(
                    EntityKind::Job,
                    &job.id,
                    "release target differs from the release's",
                ));
            }
            if job.is_processing() && jobs::processing_job(store, &job.release_target).is_some() {
                return Err(ValidationError::invalid(
                    EntityKind::Job,
                    &job.id,
                    format!("{} already has a processing job", job.release_target),
                ));
            }
            Ok(())
        }
        Op::Update(update) => {
            if store.jobs().contains(&update.job.id) {
                Ok(())
            } else {
                Err(ValidationError::not_found(EntityKind::Job, &update.job.id))
            }
        }
        Op::Delete { id } => {
            if store.jobs().contains(id) {
                Ok(())
            } else {
                Err(ValidationError::not_found(EntityKind::Job, id))
            }
        }
    }
}
