//! Declarative entities owned by a workspace.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::Value;
use crate::selector::Selector;

/// Every entity kind that events can create, update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    System,
    Deployment,
    Environment,
    Resource,
    JobAgent,
    DeploymentVersion,
    DeploymentVariable,
    DeploymentVariableValue,
    ResourceVariable,
    RelationshipRule,
    Policy,
    PolicyBypass,
    UserApprovalRecord,
    Job,
    Release,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Deployment => "deployment",
            Self::Environment => "environment",
            Self::Resource => "resource",
            Self::JobAgent => "job_agent",
            Self::DeploymentVersion => "deployment_version",
            Self::DeploymentVariable => "deployment_variable",
            Self::DeploymentVariableValue => "deployment_variable_value",
            Self::ResourceVariable => "resource_variable",
            Self::RelationshipRule => "relationship_rule",
            Self::Policy => "policy",
            Self::PolicyBypass => "policy_bypass",
            Self::UserApprovalRecord => "user_approval_record",
            Self::Job => "job",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything stored in a repository: has a kind and a stable string key.
pub trait Entity: Clone {
    const KIND: EntityKind;

    fn id(&self) -> String;
}

/// Container for deployments and environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// An external executor that picks up jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAgent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Agent type tag, e.g. `github-app`, `argo-cd`, `kubernetes-job`.
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub job_agent_id: Option<String>,
    /// Overrides merged on top of the agent's own config.
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    /// `None` admits every resource its environments admit.
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `None` admits no resources.
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a deployment version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Building,
    Ready,
    Paused,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub id: String,
    pub deployment_id: String,
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub status: VersionStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: String,
    /// Unique per deployment.
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// One selector-scoped candidate value of a deployment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVariableValue {
    pub id: String,
    pub variable_id: String,
    #[serde(default)]
    pub resource_selector: Option<Selector>,
    pub value: Value,
    #[serde(default)]
    pub priority: i64,
}

/// A per-resource override. Keyed by `(resource_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVariable {
    pub resource_id: String,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

impl ResourceVariable {
    pub fn key_for(resource_id: &str, key: &str) -> String {
        format!("{resource_id}/{key}")
    }
}

impl Entity for System {
    const KIND: EntityKind = EntityKind::System;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for JobAgent {
    const KIND: EntityKind = EntityKind::JobAgent;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for Deployment {
    const KIND: EntityKind = EntityKind::Deployment;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for Environment {
    const KIND: EntityKind = EntityKind::Environment;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for Resource {
    const KIND: EntityKind = EntityKind::Resource;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for DeploymentVersion {
    const KIND: EntityKind = EntityKind::DeploymentVersion;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for DeploymentVariable {
    const KIND: EntityKind = EntityKind::DeploymentVariable;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for DeploymentVariableValue {
    const KIND: EntityKind = EntityKind::DeploymentVariableValue;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for ResourceVariable {
    const KIND: EntityKind = EntityKind::ResourceVariable;
    fn id(&self) -> String {
        Self::key_for(&self.resource_id, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_defaults_from_minimal_json() {
        let r: Resource = serde_json::from_value(json!({
            "id": "r1",
            "workspace_id": "ws",
            "name": "cluster-a",
            "kind": "kubernetes-cluster",
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .expect("deserialize");
        assert!(r.metadata.is_empty());
        assert_eq!(r.config, serde_json::Value::Null);
        assert_eq!(r.id(), "r1");
    }

    #[test]
    fn job_agent_type_field_renamed() {
        let a: JobAgent = serde_json::from_value(json!({
            "id": "a1", "workspace_id": "ws", "name": "argo", "type": "argo-cd"
        }))
        .expect("deserialize");
        assert_eq!(a.agent_type, "argo-cd");
    }

    #[test]
    fn resource_variable_composite_key() {
        let v = ResourceVariable {
            resource_id: "r1".into(),
            key: "replicas".into(),
            value: Value::literal(5i64),
            sensitive: false,
        };
        assert_eq!(v.id(), "r1/replicas");
    }
}
