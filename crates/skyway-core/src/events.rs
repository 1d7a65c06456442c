//! Typed event stream consumed by the dispatcher.
//!
//! One variant per entity, each carrying an [`Op`]. The wire form is
//! `{"entity": "deployment", "op": {"create": {...}}}`; deletes carry only
//! the entity key.

use serde::{Deserialize, Serialize};

use crate::domain::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EntityKind,
    Environment, Job, JobAgent, JobUpdate, Policy, PolicyBypass, RelationshipRule, ReleaseTarget,
    Resource, ResourceVariable, System, UserApprovalRecord,
};

/// Create, update or delete of one entity. Updates may use a different
/// payload type than creates (jobs are updated through [`JobUpdate`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op<T, U = T> {
    Create(T),
    Update(U),
    Delete { id: String },
}

impl<T, U> Op<T, U> {
    pub fn verb(&self) -> &'static str {
        match self {
            Op::Create(_) => "create",
            Op::Update(_) => "update",
            Op::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "op", rename_all = "snake_case")]
pub enum Event {
    System(Op<System>),
    Deployment(Op<Deployment>),
    Environment(Op<Environment>),
    Resource(Op<Resource>),
    JobAgent(Op<JobAgent>),
    DeploymentVersion(Op<DeploymentVersion>),
    DeploymentVariable(Op<DeploymentVariable>),
    DeploymentVariableValue(Op<DeploymentVariableValue>),
    ResourceVariable(Op<ResourceVariable>),
    RelationshipRule(Op<RelationshipRule>),
    Policy(Op<Policy>),
    PolicyBypass(Op<PolicyBypass>),
    UserApprovalRecord(Op<UserApprovalRecord>),
    Job(Op<Job, JobUpdate>),
    /// Explicit redeploy of one release target.
    ReleaseTargetDeploy(ReleaseTarget),
}

impl Event {
    /// Entity the event mutates; `None` for a redeploy.
    pub fn entity(&self) -> Option<EntityKind> {
        Some(match self {
            Event::System(_) => EntityKind::System,
            Event::Deployment(_) => EntityKind::Deployment,
            Event::Environment(_) => EntityKind::Environment,
            Event::Resource(_) => EntityKind::Resource,
            Event::JobAgent(_) => EntityKind::JobAgent,
            Event::DeploymentVersion(_) => EntityKind::DeploymentVersion,
            Event::DeploymentVariable(_) => EntityKind::DeploymentVariable,
            Event::DeploymentVariableValue(_) => EntityKind::DeploymentVariableValue,
            Event::ResourceVariable(_) => EntityKind::ResourceVariable,
            Event::RelationshipRule(_) => EntityKind::RelationshipRule,
            Event::Policy(_) => EntityKind::Policy,
            Event::PolicyBypass(_) => EntityKind::PolicyBypass,
            Event::UserApprovalRecord(_) => EntityKind::UserApprovalRecord,
            Event::Job(_) => EntityKind::Job,
            Event::ReleaseTargetDeploy(_) => return None,
        })
    }

    fn verb(&self) -> &'static str {
        match self {
            Event::System(op) => op.verb(),
            Event::Deployment(op) => op.verb(),
            Event::Environment(op) => op.verb(),
            Event::Resource(op) => op.verb(),
            Event::JobAgent(op) => op.verb(),
            Event::DeploymentVersion(op) => op.verb(),
            Event::DeploymentVariable(op) => op.verb(),
            Event::DeploymentVariableValue(op) => op.verb(),
            Event::ResourceVariable(op) => op.verb(),
            Event::RelationshipRule(op) => op.verb(),
            Event::Policy(op) => op.verb(),
            Event::PolicyBypass(op) => op.verb(),
            Event::UserApprovalRecord(op) => op.verb(),
            Event::Job(op) => op.verb(),
            Event::ReleaseTargetDeploy(_) => "deploy",
        }
    }

    /// Log label such as `deployment.create` or `release_target.deploy`.
    pub fn kind(&self) -> String {
        let entity = self.entity().map_or("release_target", |k| k.as_str());
        format!("{entity}.{}", self.verb())
    }
}
