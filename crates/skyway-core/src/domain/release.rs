//! Release targets and immutable, fingerprinted releases.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::digest::compute_digest;
use super::entity::{DeploymentVersion, Entity, EntityKind};
use super::error::Result;
use super::value::LiteralValue;

/// The unit of deployment. Identity is the triple itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub deployment_id: String,
    pub environment_id: String,
    pub resource_id: String,
}

impl ReleaseTarget {
    pub fn new(
        deployment_id: impl Into<String>,
        environment_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            environment_id: environment_id.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.deployment_id, self.environment_id, self.resource_id
        )
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.deployment_id, self.environment_id, self.resource_id
        )
    }
}

/// Snapshot of what should run on a release target. Never mutated; a change
/// in any input produces a different fingerprint and thus a new release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Fingerprint (hex SHA-256 over the canonical identity fields).
    pub id: String,
    pub release_target: ReleaseTarget,
    pub version: DeploymentVersion,
    pub variables: BTreeMap<String, LiteralValue>,
    #[serde(default)]
    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Deterministic fingerprint over the identity fields of a release.
///
/// `created_at` and the version snapshot beyond its id are excluded: two
/// releases with the same target, version, variables and agent config are
/// the same release.
pub fn fingerprint(
    target: &ReleaseTarget,
    version_id: &str,
    variables: &BTreeMap<String, LiteralValue>,
    job_agent_id: Option<&str>,
    job_agent_config: &serde_json::Value,
) -> Result<String> {
    let vars: serde_json::Map<String, serde_json::Value> = variables
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    compute_digest(&json!({
        "releaseTarget": {
            "deploymentId": target.deployment_id,
            "environmentId": target.environment_id,
            "resourceId": target.resource_id,
        },
        "versionId": version_id,
        "variables": vars,
        "jobAgentId": job_agent_id,
        "jobAgentConfig": job_agent_config,
    }))
}

impl Release {
    pub fn new(
        release_target: ReleaseTarget,
        version: DeploymentVersion,
        variables: BTreeMap<String, LiteralValue>,
        job_agent_id: Option<String>,
        job_agent_config: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let id = fingerprint(
            &release_target,
            &version.id,
            &variables,
            job_agent_id.as_deref(),
            &job_agent_config,
        )?;
        Ok(Self {
            id,
            release_target,
            version,
            variables,
            job_agent_id,
            job_agent_config,
            created_at,
        })
    }
}

impl Entity for Release {
    const KIND: EntityKind = EntityKind::Release;
    fn id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::VersionStatus;

    fn version(id: &str) -> DeploymentVersion {
        DeploymentVersion {
            id: id.into(),
            deployment_id: "d1".into(),
            name: id.into(),
            tag: id.into(),
            config: serde_json::Value::Null,
            job_agent_config: serde_json::Value::Null,
            metadata: BTreeMap::new(),
            status: VersionStatus::Ready,
            message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_ignores_created_at() {
        let target = ReleaseTarget::new("d1", "e1", "r1");
        let a = Release::new(
            target.clone(),
            version("v1"),
            BTreeMap::new(),
            Some("agent".into()),
            json!({"ns": "x"}),
            Utc::now(),
        )
        .unwrap();
        let b = Release::new(
            target,
            version("v1"),
            BTreeMap::new(),
            Some("agent".into()),
            json!({"ns": "x"}),
            Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn fingerprint_changes_with_variables() {
        let target = ReleaseTarget::new("d1", "e1", "r1");
        let mut vars = BTreeMap::new();
        vars.insert("replicas".to_string(), LiteralValue::Int(3));
        let a = fingerprint(&target, "v1", &vars, None, &serde_json::Value::Null).unwrap();
        vars.insert("replicas".to_string(), LiteralValue::Int(5));
        let b = fingerprint(&target, "v1", &vars, None, &serde_json::Value::Null).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn target_display_and_ordering() {
        let a = ReleaseTarget::new("d1", "e1", "r1");
        let b = ReleaseTarget::new("d1", "e1", "r2");
        assert!(a < b);
        assert_eq!(a.to_string(), "d1/e1/r1");
    }
}
