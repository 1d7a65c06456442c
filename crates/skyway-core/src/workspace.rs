//! Workspace handle: the single-writer state plus its read-side queries.
//!
//! Writers serialize on the state lock, so each event is applied, its
//! views refreshed and its targets reconciled before any reader observes
//! the result. Readers get owned copies and never hold the lock across
//! calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::dispatcher::{DispatchOutcome, Dispatcher, WorkspaceNotification, WorkspaceState};
use crate::domain::{Job, JobStatus, LiteralValue, Release, ReleaseTarget, Result};
use crate::events::Event;
use crate::obs::{self, WorkspaceSpan};
use crate::policy::PolicyVerdict;
use crate::releases::ReleaseManager;
use crate::selector::{Matcher, SelectorCache};
use crate::store::Store;
use crate::variables::VariableResolver;

#[derive(Debug)]
pub struct Workspace {
    state: RwLock<WorkspaceState>,
    cache: SelectorCache,
    diagnostics: Diagnostics,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    notifications: broadcast::Sender<WorkspaceNotification>,
}

impl Workspace {
    pub fn new(id: impl Into<String>, config: EngineConfig) -> Self {
        Self::with_clock(id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(id: impl Into<String>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (notifications, _) = broadcast::channel(config.event_queue_depth.max(1));
        Self {
            state: RwLock::new(WorkspaceState::new(id)),
            cache: SelectorCache::new(),
            diagnostics: Diagnostics::new(config.max_diagnostics),
            clock,
            config,
            notifications,
        }
    }

    pub fn id(&self) -> String {
        self.state.read().id.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn matcher(&self) -> Matcher<'_> {
        Matcher::new(&self.cache, &self.diagnostics)
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self.matcher(), self.clock.now(), self.config.verify_invariants)
    }

    /// Receive notifications for every event committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceNotification> {
        self.notifications.subscribe()
    }

    fn publish(&self, outcome: &DispatchOutcome) {
        for notification in &outcome.notifications {
            // No receivers is fine.
            let _ = self.notifications.send(notification.clone());
        }
    }

    /// Apply one event. Validation errors leave the workspace unchanged.
    pub fn push_event(&self, event: Event) -> Result<DispatchOutcome> {
        let kind = event.kind();
        let started = Instant::now();
        let mut state = self.state.write();
        let _span = WorkspaceSpan::enter(&state.id);
        match self.dispatcher().dispatch(&mut state, event) {
            Ok(outcome) => {
                obs::emit_event_applied(
                    &state.id,
                    &kind,
                    outcome.tainted,
                    started.elapsed().as_micros() as u64,
                );
                drop(state);
                self.publish(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                obs::emit_event_rejected(&state.id, &kind, &err);
                Err(err)
            }
        }
    }

    /// Re-evaluate every release target at the current time.
    pub fn reconcile_all(&self) -> Result<DispatchOutcome> {
        let mut state = self.state.write();
        let _span = WorkspaceSpan::enter(&state.id);
        let outcome = self.dispatcher().reconcile_all(&mut state)?;
        drop(state);
        self.publish(&outcome);
        Ok(outcome)
    }

    /// Recompute graph and views from the store, then reconcile.
    pub fn rebuild(&self) -> Result<DispatchOutcome> {
        let mut state = self.state.write();
        let _span = WorkspaceSpan::enter(&state.id);
        let outcome = self.dispatcher().rebuild(&mut state)?;
        drop(state);
        self.publish(&outcome);
        Ok(outcome)
    }

    /// Replace the whole store (snapshot load). The previous state is kept
    /// if the rebuild fails.
    pub fn restore(&self, store: Store) -> Result<usize> {
        let mut state = self.state.write();
        let mut fresh = WorkspaceState::from_store(state.id.clone(), store);
        self.dispatcher().rebuild(&mut fresh)?;
        let targets = fresh.views.targets().len();
        *state = fresh;
        Ok(targets)
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&WorkspaceState) -> R) -> R {
        f(&self.state.read())
    }

    // ---- queries -----------------------------------------------------

    /// Jobs waiting for an agent, oldest first.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.read();
        let mut jobs: Vec<Job> = state
            .store
            .jobs_in_order()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.state.read().store.jobs().get(id).cloned()
    }

    pub fn release(&self, id: &str) -> Option<Release> {
        self.state.read().store.releases().get(id).cloned()
    }

    /// Jobs of one target in creation order.
    pub fn jobs_for_target(&self, target: &ReleaseTarget) -> Vec<Job> {
        self.state.read().store.jobs_for(target).cloned().collect()
    }

    pub fn release_targets(&self) -> Vec<ReleaseTarget> {
        self.state.read().views.targets().iter().cloned().collect()
    }

    pub fn desired_release(&self, target: &ReleaseTarget) -> Result<Option<Release>> {
        let state = self.state.read();
        if !state.views.contains(target) {
            return Ok(None);
        }
        ReleaseManager::new(&state.store, &state.graph, self.matcher(), self.clock.now())
            .desired_release(target)
    }

    pub fn current_release(&self, target: &ReleaseTarget) -> Option<Release> {
        let state = self.state.read();
        ReleaseManager::new(&state.store, &state.graph, self.matcher(), self.clock.now())
            .current_release(target)
            .cloned()
    }

    /// Policy verdict for a version on a target; `None` if the version is
    /// unknown.
    pub fn policy_verdict(&self, target: &ReleaseTarget, version_id: &str) -> Option<PolicyVerdict> {
        let state = self.state.read();
        let version = state.store.versions().get(version_id)?;
        let manager =
            ReleaseManager::new(&state.store, &state.graph, self.matcher(), self.clock.now());
        Some(manager.policy_verdict(target, version))
    }

    /// Variable map a release of `deployment_id` on `resource_id` would get.
    pub fn resolved_variables(
        &self,
        deployment_id: &str,
        resource_id: &str,
    ) -> Option<BTreeMap<String, LiteralValue>> {
        let state = self.state.read();
        let resource = state.store.resources().get(resource_id)?;
        Some(
            VariableResolver::new(&state.store, &state.graph, self.matcher())
                .resolve(deployment_id, resource),
        )
    }

    pub fn follow(&self, resource_id: &str, reference: &str) -> Vec<String> {
        self.state.read().graph.follow(resource_id, reference)
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.snapshot()
    }
}
