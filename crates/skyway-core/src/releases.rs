//! Release manager: version selection, desired/current releases and
//! per-target reconciliation.

use chrono::{DateTime, Utc};

use crate::domain::digest::deep_merge;
use crate::domain::{
    DeploymentVersion, DispatchContext, Job, JobStatus, Release, ReleaseTarget, Result,
    VersionStatus,
};
use crate::jobs;
use crate::obs;
use crate::policy::{PolicyEngine, PolicyVerdict};
use crate::relationships::RelationshipGraph;
use crate::selector::Matcher;
use crate::store::Store;
use crate::variables::VariableResolver;
use crate::views::MaterializedViews;

/// How the chosen version was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `Ready` and every applicable rule admits it.
    Admitted,
    /// `Paused`, but the target already has a release of it, which is kept.
    Grandfathered,
}

/// Read-only release computations over one consistent state.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseManager<'a> {
    store: &'a Store,
    graph: &'a RelationshipGraph,
    matcher: Matcher<'a>,
    now: DateTime<Utc>,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(
        store: &'a Store,
        graph: &'a RelationshipGraph,
        matcher: Matcher<'a>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            graph,
            matcher,
            now,
        }
    }

    /// Versions of a deployment, newest first (`created_at` then id, both
    /// descending).
    pub fn candidates(&self, deployment_id: &str) -> Vec<&'a DeploymentVersion> {
        let mut versions: Vec<_> = self.store.versions_of(deployment_id).collect();
        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        versions
    }

    pub fn policy_verdict(
        &self,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
    ) -> PolicyVerdict {
        PolicyEngine::new(self.store, self.matcher, self.now).evaluate(target, version)
    }

    /// Newest version the target may run.
    pub fn select_version(
        &self,
        target: &ReleaseTarget,
    ) -> Option<(&'a DeploymentVersion, Admission)> {
        for version in self.candidates(&target.deployment_id) {
            match version.status {
                VersionStatus::Ready => {
                    if self.policy_verdict(target, version).admitted() {
                        return Some((version, Admission::Admitted));
                    }
                }
                VersionStatus::Paused => {
                    if self.latest_release_of(target, &version.id).is_some() {
                        return Some((version, Admission::Grandfathered));
                    }
                }
                VersionStatus::Building | VersionStatus::Failed => {}
            }
        }
        None
    }

    fn latest_release_of(&self, target: &ReleaseTarget, version_id: &str) -> Option<&'a Release> {
        self.store
            .releases_for(target)
            .filter(|r| r.version.id == version_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Release the target should be running, built fresh from current state.
    /// A grandfathered paused version yields its existing release.
    pub fn desired_release(&self, target: &ReleaseTarget) -> Result<Option<Release>> {
        let Some((version, admission)) = self.select_version(target) else {
            return Ok(None);
        };
        if admission == Admission::Grandfathered {
            return Ok(self.latest_release_of(target, &version.id).cloned());
        }
        let (Some(deployment), Some(resource)) = (
            self.store.deployments().get(&target.deployment_id),
            self.store.resources().get(&target.resource_id),
        ) else {
            return Ok(None);
        };
        let variables = VariableResolver::new(self.store, self.graph, self.matcher)
            .resolve(&deployment.id, resource);
        let agent = deployment
            .job_agent_id
            .as_deref()
            .and_then(|id| self.store.job_agents().get(id));
        let job_agent_config = match agent {
            Some(agent) => deep_merge(
                &deep_merge(&agent.config, &deployment.job_agent_config),
                &version.job_agent_config,
            ),
            None => serde_json::Value::Null,
        };
        Release::new(
            target.clone(),
            version.clone(),
            variables,
            agent.map(|a| a.id.clone()),
            job_agent_config,
            self.now,
        )
        .map(Some)
    }

    /// Release of the newest successful job, if any.
    pub fn current_release(&self, target: &ReleaseTarget) -> Option<&'a Release> {
        let jobs: Vec<&Job> = self.store.jobs_for(target).collect();
        jobs.into_iter()
            .rev()
            .find(|j| j.status == JobStatus::Successful)
            .and_then(|j| self.store.releases().get(&j.release_id))
    }

    fn dispatch_context(&self, release: &Release) -> Option<DispatchContext> {
        let target = &release.release_target;
        Some(DispatchContext {
            release_target: target.clone(),
            version: release.version.clone(),
            deployment: self.store.deployments().get(&target.deployment_id)?.clone(),
            environment: self.store.environments().get(&target.environment_id)?.clone(),
            resource: self.store.resources().get(&target.resource_id)?.clone(),
            variables: release.variables.clone(),
            job_agent: release
                .job_agent_id
                .as_deref()
                .and_then(|id| self.store.job_agents().get(id))
                .cloned(),
        })
    }
}

/// Why reconcile was invoked for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Converge on the desired release; one job per desired release.
    Converge,
    /// Explicit redeploy: create a job for the desired release unless a
    /// processing job exists.
    Redeploy,
}

/// What a reconcile pass did to one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub release_created: Option<String>,
    pub jobs_created: Vec<String>,
    pub jobs_cancelled: Vec<String>,
    pub releases_pruned: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.release_created.is_none()
            && self.jobs_created.is_empty()
            && self.jobs_cancelled.is_empty()
            && self.releases_pruned.is_empty()
    }
}

/// Drive one target toward its desired release.
///
/// Only processing jobs are ever cancelled. A job in `ActionRequired`
/// blocks replacement until it leaves that state.
pub fn reconcile_target(
    store: &mut Store,
    graph: &RelationshipGraph,
    views: &MaterializedViews,
    matcher: Matcher<'_>,
    now: DateTime<Utc>,
    target: &ReleaseTarget,
    mode: ReconcileMode,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    if !views.contains(target) {
        if let Some(job) = jobs::processing_job(store, target).map(|j| j.id.clone()) {
            if jobs::cancel(store, &job, "release target removed", now) {
                obs::emit_job_cancelled(&job, target, "release target removed");
                outcome.jobs_cancelled.push(job);
            }
        }
        outcome.releases_pruned = prune_releases(store, target, None);
        return Ok(outcome);
    }

    let (desired, context) = {
        let manager = ReleaseManager::new(store, graph, matcher, now);
        let Some(desired) = manager.desired_release(target)? else {
            return Ok(outcome);
        };
        let context = manager.dispatch_context(&desired);
        (desired, context)
    };
    let Some(context) = context else {
        return Ok(outcome);
    };

    let version_tag = desired.version.tag.clone();
    let desired_id = desired.id.clone();
    if store.intern_release(desired) {
        obs::emit_release_created(&desired_id, target, &version_tag);
        outcome.release_created = Some(desired_id.clone());
    }

    let processing = jobs::processing_job(store, target)
        .map(|j| (j.id.clone(), j.release_id.clone(), j.status));
    let create = match (mode, processing) {
        (ReconcileMode::Redeploy, Some((job_id, _, status))) => {
            obs::emit_redeploy_blocked(target, &job_id, status);
            false
        }
        (ReconcileMode::Redeploy, None) => true,
        (ReconcileMode::Converge, Some((_, release_id, _))) if release_id == desired_id => false,
        (ReconcileMode::Converge, Some((_, _, JobStatus::ActionRequired))) => false,
        (ReconcileMode::Converge, Some((job_id, _, _))) => {
            if jobs::cancel(store, &job_id, "superseded by a newer release", now) {
                obs::emit_job_cancelled(&job_id, target, "superseded by a newer release");
                outcome.jobs_cancelled.push(job_id);
            }
            true
        }
        (ReconcileMode::Converge, None) => !has_job_for_release(store, target, &desired_id),
    };

    if create {
        if let Some(release) = store.releases().get(&desired_id) {
            let job = jobs::new_job(release, context, now);
            obs::emit_job_created(&job.id, target, job.status);
            outcome.jobs_created.push(job.id.clone());
            store.insert_job(job);
        }
    }

    outcome.releases_pruned = prune_releases(store, target, Some(&desired_id));
    Ok(outcome)
}

fn has_job_for_release(store: &Store, target: &ReleaseTarget, release_id: &str) -> bool {
    store.jobs_for(target).any(|j| j.release_id == release_id)
}

/// Drop releases of `target` that no job references, except `keep`.
fn prune_releases(store: &mut Store, target: &ReleaseTarget, keep: Option<&str>) -> Vec<String> {
    let unreferenced: Vec<String> = store
        .releases_for(target)
        .filter(|r| Some(r.id.as_str()) != keep)
        .filter(|r| !has_job_for_release(store, target, &r.id))
        .map(|r| r.id.clone())
        .collect();
    for id in &unreferenced {
        store.remove_release(id);
    }
    unreferenced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::domain::{Deployment, Environment, JobAgent, Resource, System};
    use crate::selector::{Selector, SelectorCache};
    use chrono::Duration;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Store,
        graph: RelationshipGraph,
        views: MaterializedViews,
        cache: SelectorCache,
        diags: Diagnostics,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new(agent: bool) -> Self {
            let now = Utc::now();
            let mut store = Store::new();
            store.upsert_system(System {
                id: "s1".into(),
                workspace_id: "ws".into(),
                name: "platform".into(),
                description: None,
            });
            store.upsert_job_agent(JobAgent {
                id: "argo".into(),
                workspace_id: "ws".into(),
                name: "argo".into(),
                agent_type: "argo-cd".into(),
                config: serde_json::json!({"server": "argo.local", "sync": {"prune": false}}),
            });
            store.upsert_deployment(Deployment {
                id: "api".into(),
                system_id: "s1".into(),
                name: "api".into(),
                slug: None,
                description: None,
                job_agent_id: agent.then(|| "argo".to_string()),
                job_agent_config: serde_json::json!({"sync": {"prune": true}}),
                resource_selector: None,
            });
            store.upsert_environment(Environment {
                id: "prod".into(),
                system_id: "s1".into(),
                name: "prod".into(),
                description: None,
                resource_selector: Some(Selector::all()),
            });
            store.upsert_resource(Resource {
                id: "r1".into(),
                workspace_id: "ws".into(),
                name: "r1".into(),
                kind: "service".into(),
                identifier: "r1".into(),
                version: String::new(),
                metadata: BTreeMap::new(),
                config: serde_json::Value::Null,
                created_at: now,
            });
            let mut fixture = Self {
                store,
                graph: RelationshipGraph::new(),
                views: MaterializedViews::new(),
                cache: SelectorCache::new(),
                diags: Diagnostics::new(16),
                now,
            };
            fixture.refresh_views();
            fixture
        }

        fn refresh_views(&mut self) {
            let matcher = Matcher::new(&self.cache, &self.diags);
            self.views.rebuild(&self.store, matcher);
        }

        fn add_version(&mut self, tag: &str, status: VersionStatus, age_secs: i64) {
            self.store.upsert_version(DeploymentVersion {
                id: tag.into(),
                deployment_id: "api".into(),
                name: tag.into(),
                tag: tag.into(),
                config: serde_json::Value::Null,
                job_agent_config: serde_json::Value::Null,
                metadata: BTreeMap::new(),
                status,
                message: None,
                created_at: self.now - Duration::seconds(age_secs),
            });
        }

        fn reconcile(&mut self, mode: ReconcileMode) -> ReconcileOutcome {
            let matcher = Matcher::new(&self.cache, &self.diags);
            reconcile_target(
                &mut self.store,
                &self.graph,
                &self.views,
                matcher,
                self.now,
                &target(),
                mode,
            )
            .unwrap()
        }

        fn jobs(&self) -> Vec<&Job> {
            self.store.jobs_for(&target()).collect()
        }
    }

    fn target() -> ReleaseTarget {
        ReleaseTarget::new("api", "prod", "r1")
    }

    #[test]
    fn selects_newest_ready_version() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 30);
        fx.add_version("v2", VersionStatus::Ready, 20);
        fx.add_version("v3", VersionStatus::Building, 10);
        let matcher = Matcher::new(&fx.cache, &fx.diags);
        let manager = ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now);
        let (version, admission) = manager.select_version(&target()).unwrap();
        assert_eq!(version.id, "v2");
        assert_eq!(admission, Admission::Admitted);
    }

    #[test]
    fn creation_time_ties_break_on_id() {
        let mut fx = Fixture::new(true);
        fx.add_version("a", VersionStatus::Ready, 10);
        fx.add_version("b", VersionStatus::Ready, 10);
        let matcher = Matcher::new(&fx.cache, &fx.diags);
        let manager = ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now);
        assert_eq!(manager.select_version(&target()).unwrap().0.id, "b");
    }

    #[test]
    fn desired_release_merges_agent_config() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 10);
        let matcher = Matcher::new(&fx.cache, &fx.diags);
        let manager = ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now);
        let release = manager.desired_release(&target()).unwrap().unwrap();
        assert_eq!(release.job_agent_id.as_deref(), Some("argo"));
        assert_eq!(
            release.job_agent_config,
            serde_json::json!({"server": "argo.local", "sync": {"prune": true}})
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 10);
        let first = fx.reconcile(ReconcileMode::Converge);
        assert!(first.release_created.is_some());
        assert_eq!(first.jobs_created.len(), 1);
        let second = fx.reconcile(ReconcileMode::Converge);
        assert!(second.is_noop());
        assert_eq!(fx.jobs().len(), 1);
        assert_eq!(fx.jobs()[0].status, JobStatus::Pending);
    }

    #[test]
    fn missing_agent_yields_invalid_job_agent() {
        let mut fx = Fixture::new(false);
        fx.add_version("v1", VersionStatus::Ready, 10);
        fx.reconcile(ReconcileMode::Converge);
        let jobs = fx.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::InvalidJobAgent);
        assert!(jobs[0].completed_at.is_some());
        // One job per desired release, even when it is terminal.
        assert!(fx.reconcile(ReconcileMode::Converge).is_noop());
    }

    #[test]
    fn newer_version_supersedes_processing_job() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 20);
        fx.reconcile(ReconcileMode::Converge);
        fx.add_version("v2", VersionStatus::Ready, 10);
        let outcome = fx.reconcile(ReconcileMode::Converge);
        assert_eq!(outcome.jobs_cancelled.len(), 1);
        assert_eq!(outcome.jobs_created.len(), 1);
        let jobs = fx.jobs();
        assert_eq!(jobs[0].status, JobStatus::Cancelled);
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(
            fx.store.releases().get(&jobs[1].release_id).unwrap().version.id,
            "v2"
        );
    }

    #[test]
    fn action_required_blocks_replacement() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 20);
        fx.reconcile(ReconcileMode::Converge);
        let job_id = fx.jobs()[0].id.clone();
        fx.store
            .update_job(&job_id, |j| j.status = JobStatus::ActionRequired);
        fx.add_version("v2", VersionStatus::Ready, 10);
        let outcome = fx.reconcile(ReconcileMode::Converge);
        assert!(outcome.jobs_cancelled.is_empty());
        assert!(outcome.jobs_created.is_empty());
        assert_eq!(fx.jobs().len(), 1);
    }

    #[test]
    fn redeploy_waits_for_processing_job() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 10);
        fx.reconcile(ReconcileMode::Converge);
        assert!(fx.reconcile(ReconcileMode::Redeploy).jobs_created.is_empty());

        let job_id = fx.jobs()[0].id.clone();
        fx.store
            .update_job(&job_id, |j| j.status = JobStatus::Successful);
        let outcome = fx.reconcile(ReconcileMode::Redeploy);
        assert_eq!(outcome.jobs_created.len(), 1);
        assert_eq!(fx.jobs()[0].release_id, fx.jobs()[1].release_id);
    }

    #[test]
    fn removed_target_cancels_only_processing_jobs() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 10);
        fx.reconcile(ReconcileMode::Converge);
        let job_id = fx.jobs()[0].id.clone();
        fx.store.remove_resource("r1");
        fx.refresh_views();
        let outcome = fx.reconcile(ReconcileMode::Converge);
        assert_eq!(outcome.jobs_cancelled, vec![job_id.clone()]);
        assert_eq!(
            fx.store.jobs().get(&job_id).unwrap().status,
            JobStatus::Cancelled
        );
        // The cancelled job still references its release.
        assert!(outcome.releases_pruned.is_empty());
    }

    #[test]
    fn paused_version_is_grandfathered_only_where_released() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 20);
        fx.add_version("v2", VersionStatus::Ready, 10);
        fx.reconcile(ReconcileMode::Converge);
        let v2 = fx.store.versions().get("v2").unwrap().clone();
        fx.store.upsert_version(DeploymentVersion {
            status: VersionStatus::Paused,
            ..v2
        });
        let matcher = Matcher::new(&fx.cache, &fx.diags);
        let manager = ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now);
        let (version, admission) = manager.select_version(&target()).unwrap();
        assert_eq!(version.id, "v2");
        assert_eq!(admission, Admission::Grandfathered);
        assert!(fx.reconcile(ReconcileMode::Converge).is_noop());
    }

    #[test]
    fn current_release_tracks_latest_success() {
        let mut fx = Fixture::new(true);
        fx.add_version("v1", VersionStatus::Ready, 10);
        fx.reconcile(ReconcileMode::Converge);
        let matcher = Matcher::new(&fx.cache, &fx.diags);
        assert!(ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now)
            .current_release(&target())
            .is_none());
        let job = fx.jobs()[0].clone();
        fx.store
            .update_job(&job.id, |j| j.status = JobStatus::Successful);
        let manager = ReleaseManager::new(&fx.store, &fx.graph, matcher, fx.now);
        assert_eq!(
            manager.current_release(&target()).map(|r| r.id.as_str()),
            Some(job.release_id.as_str())
        );
    }
}
