#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use skyway_core::{
    Clock, Deployment, DeploymentVariable, DeploymentVersion, EngineConfig, Environment, Event, Job,
    JobAgent, JobField, JobStatus, JobUpdate, ManualClock, Op, Policy, PolicyRule, PolicyTarget,
    ReleaseTarget, Resource, Selector, System, Value, VersionStatus, Workspace,
};

pub const WS: &str = "ws-test";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// A workspace on a manual clock with one system, an optional agent and
/// the `api` deployment.
pub struct Fixture {
    pub ws: Arc<Workspace>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new(with_agent: bool) -> Self {
        Self::with_config(with_agent, EngineConfig::default())
    }

    pub fn with_config(with_agent: bool, config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let ws = Arc::new(Workspace::with_clock(WS, config, clock.clone()));
        let fx = Self { ws, clock };

        fx.push(Event::System(Op::Create(System {
            id: "s1".into(),
            workspace_id: WS.into(),
            name: "platform".into(),
            description: None,
        })));
        if with_agent {
            fx.push(Event::JobAgent(Op::Create(JobAgent {
                id: "A".into(),
                workspace_id: WS.into(),
                name: "argo".into(),
                agent_type: "argo-cd".into(),
                config: serde_json::json!({"server": "argo.internal"}),
            })));
        }
        fx.push(Event::Deployment(Op::Create(deployment(
            with_agent.then_some("A"),
        ))));
        fx
    }

    pub fn push(&self, event: Event) {
        let kind = event.kind();
        if let Err(err) = self.ws.push_event(event) {
            panic!("{kind} rejected: {err}");
        }
    }

    pub fn environment(&self, id: &str, selector: &str) {
        self.push(Event::Environment(Op::Create(environment(id, selector))));
    }

    pub fn resource(&self, resource: Resource) {
        self.push(Event::Resource(Op::Create(resource)));
    }

    /// Create a ready version one minute after the previous clock reading.
    pub fn version(&self, tag: &str) {
        self.clock.advance(chrono::Duration::minutes(1));
        self.push(Event::DeploymentVersion(Op::Create(version(
            tag,
            self.clock_now(),
        ))));
    }

    pub fn variable(&self, key: &str, default: Option<Value>) {
        self.push(Event::DeploymentVariable(Op::Create(DeploymentVariable {
            id: format!("var-{key}"),
            deployment_id: "api".into(),
            key: key.into(),
            description: None,
            default_value: default,
        })));
    }

    pub fn set_status(&self, job: &Job, status: JobStatus) {
        let mut job = job.clone();
        job.status = status;
        self.push(Event::Job(Op::Update(JobUpdate {
            job,
            fields_to_update: Some(vec![JobField::Status]),
        })));
    }

    pub fn jobs(&self, resource_id: &str, environment_id: &str) -> Vec<Job> {
        self.ws
            .jobs_for_target(&ReleaseTarget::new("api", environment_id, resource_id))
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Advance the manual clock by whole seconds.
    pub fn wait(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }

    pub fn policy(&self, id: &str, rules: Vec<PolicyRule>) {
        self.push(Event::Policy(Op::Create(Policy {
            id: id.into(),
            workspace_id: WS.into(),
            name: id.into(),
            description: None,
            priority: 0,
            enabled: true,
            targets: vec![PolicyTarget::default()],
            rules,
            created_at: t0(),
        })));
    }

    /// Every job in the workspace, grouped by target.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.ws.read(|s| s.store.jobs_in_order().cloned().collect())
    }
}

pub fn deployment(agent: Option<&str>) -> Deployment {
    Deployment {
        id: "api".into(),
        system_id: "s1".into(),
        name: "api".into(),
        slug: Some("api".into()),
        description: None,
        job_agent_id: agent.map(str::to_string),
        job_agent_config: serde_json::Value::Null,
        resource_selector: None,
    }
}

pub fn environment(id: &str, selector: &str) -> Environment {
    Environment {
        id: id.into(),
        system_id: "s1".into(),
        name: id.into(),
        description: None,
        resource_selector: Some(Selector::cel(selector)),
    }
}

pub fn resource(id: &str, kind: &str, metadata: &[(&str, &str)]) -> Resource {
    Resource {
        id: id.into(),
        workspace_id: WS.into(),
        name: id.into(),
        kind: kind.into(),
        identifier: id.into(),
        version: String::new(),
        metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        config: serde_json::Value::Null,
        created_at: t0(),
    }
}

pub fn version(tag: &str, created_at: DateTime<Utc>) -> DeploymentVersion {
    DeploymentVersion {
        id: tag.into(),
        deployment_id: "api".into(),
        name: tag.into(),
        tag: tag.into(),
        config: serde_json::Value::Null,
        job_agent_config: serde_json::Value::Null,
        metadata: BTreeMap::new(),
        status: VersionStatus::Ready,
        message: None,
        created_at,
    }
}
