//! Workspace snapshot codec and persistence.
//!
//! Layout: `MAGIC (4) | format version (u16 BE) | sha256(payload) (32) |
//! payload`, where the payload is the MessagePack encoding (named fields)
//! of a [`StoreSnapshot`]. Only entities are stored; graph and views are
//! rebuilt on load.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyway_state::{ContentDigest, ObjectStore};
use tokio_util::sync::CancellationToken;

use crate::domain::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EngineError,
    Environment, Job, JobAgent, Policy, PolicyBypass, RelationshipRule, Release, Resource,
    ResourceVariable, Result, System, UserApprovalRecord,
};
use crate::obs;
use crate::store::Store;
use crate::workspace::Workspace;

const MAGIC: &[u8; 4] = b"SKWS";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 32;

/// Every entity of a store in a deterministic order: ids ascending,
/// except jobs (per target, creation order) and variable values (per
/// variable, insertion order), whose order carries meaning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub workspace_id: String,
    pub systems: Vec<System>,
    pub deployments: Vec<Deployment>,
    pub environments: Vec<Environment>,
    pub resources: Vec<Resource>,
    pub job_agents: Vec<JobAgent>,
    pub versions: Vec<DeploymentVersion>,
    pub deployment_variables: Vec<DeploymentVariable>,
    pub deployment_variable_values: Vec<DeploymentVariableValue>,
    pub resource_variables: Vec<ResourceVariable>,
    pub relationship_rules: Vec<RelationshipRule>,
    pub policies: Vec<Policy>,
    pub bypasses: Vec<PolicyBypass>,
    pub approvals: Vec<UserApprovalRecord>,
    pub releases: Vec<Release>,
    pub jobs: Vec<Job>,
}

impl StoreSnapshot {
    pub fn capture(workspace_id: &str, store: &Store) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            systems: store.systems().items().cloned().collect(),
            deployments: store.deployments().items().cloned().collect(),
            environments: store.environments().items().cloned().collect(),
            resources: store.resources().items().cloned().collect(),
            job_agents: store.job_agents().items().cloned().collect(),
            versions: store.versions().items().cloned().collect(),
            deployment_variables: store.deployment_variables().items().cloned().collect(),
            deployment_variable_values: store.variable_values_in_order().cloned().collect(),
            resource_variables: store.resource_variables().items().cloned().collect(),
            relationship_rules: store.relationship_rules().items().cloned().collect(),
            policies: store.policies().items().cloned().collect(),
            bypasses: store.bypasses().items().cloned().collect(),
            approvals: store.approvals().items().cloned().collect(),
            releases: store.releases().items().cloned().collect(),
            jobs: store.jobs_in_order().cloned().collect(),
        }
    }

    /// Rebuild a store with the same contents and orderings.
    pub fn into_store(self) -> Store {
        let mut store = Store::new();
        for e in self.systems {
            store.upsert_system(e);
        }
        for e in self.deployments {
            store.upsert_deployment(e);
        }
        for e in self.environments {
            store.upsert_environment(e);
        }
        for e in self.resources {
            store.upsert_resource(e);
        }
        for e in self.job_agents {
            store.upsert_job_agent(e);
        }
        for e in self.versions {
            store.upsert_version(e);
        }
        for e in self.deployment_variables {
            store.upsert_deployment_variable(e);
        }
        for e in self.deployment_variable_values {
            store.upsert_deployment_variable_value(e);
        }
        for e in self.resource_variables {
            store.upsert_resource_variable(e);
        }
        for e in self.relationship_rules {
            store.upsert_relationship_rule(e);
        }
        for e in self.policies {
            store.upsert_policy(e);
        }
        for e in self.bypasses {
            store.upsert_bypass(e);
        }
        for e in self.approvals {
            store.upsert_approval(e);
        }
        for e in self.releases {
            store.intern_release(e);
        }
        for e in self.jobs {
            store.insert_job(e);
        }
        store.take_changes();
        store
    }
}

pub fn encode(snapshot: &StoreSnapshot) -> Result<Vec<u8>> {
    let payload =
        rmp_serde::to_vec_named(snapshot).map_err(|e| EngineError::Codec(e.to_string()))?;
    let checksum = ContentDigest::from_bytes(&payload).to_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&checksum);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<StoreSnapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(EngineError::SnapshotCorrupt(format!(
            "{} bytes is shorter than the header",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if &header[..4] != MAGIC {
        return Err(EngineError::SnapshotCorrupt("bad magic".into()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(EngineError::SnapshotCorrupt(format!(
            "unsupported format version {version}"
        )));
    }
    let mut expected = [0u8; 32];
    expected.copy_from_slice(&header[6..HEADER_LEN]);
    let actual = ContentDigest::from_bytes(payload);
    if actual.to_bytes() != expected {
        return Err(EngineError::SnapshotCorrupt(format!(
            "checksum mismatch: expected {}, payload hashes to {}",
            ContentDigest::from_raw(expected).short(),
            actual.short()
        )));
    }
    rmp_serde::from_slice(payload).map_err(|e| EngineError::Codec(e.to_string()))
}

/// Bound a storage call by a deadline and a cancellation token.
async fn guarded<T, F>(
    operation: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled(operation.to_string())),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| EngineError::Timeout {
            operation: operation.to_string(),
            millis: timeout.as_millis() as u64,
        })?,
    }
}

/// Persist the workspace under its configured snapshot path. Returns the
/// number of bytes written.
pub async fn save(
    workspace: &Workspace,
    storage: &dyn ObjectStore,
    cancel: &CancellationToken,
) -> Result<usize> {
    let (workspace_id, bytes) = workspace.read(|state| {
        encode(&StoreSnapshot::capture(&state.id, &state.store)).map(|b| (state.id.clone(), b))
    })?;
    let config = workspace.config();
    let path = config.snapshot_path(&workspace_id);
    guarded("snapshot save", config.snapshot_timeout, cancel, async {
        storage.put(&path, &bytes).await.map_err(EngineError::from)
    })
    .await?;
    obs::emit_snapshot_saved(&workspace_id, &path, bytes.len());
    Ok(bytes.len())
}

/// Replace the workspace's contents with its stored snapshot and rebuild
/// every derived view. Returns the number of release targets.
///
/// On any error the in-memory workspace is left as it was.
pub async fn load(
    workspace: &Workspace,
    storage: &dyn ObjectStore,
    cancel: &CancellationToken,
) -> Result<usize> {
    let workspace_id = workspace.id();
    let config = workspace.config();
    let path = config.snapshot_path(&workspace_id);
    let bytes = guarded("snapshot load", config.snapshot_timeout, cancel, async {
        storage.get(&path).await.map_err(|err| {
            if err.is_not_found() {
                EngineError::SnapshotNotFound { path: path.clone() }
            } else {
                EngineError::from(err)
            }
        })
    })
    .await?;
    let snapshot = decode(&bytes)?;
    let targets = workspace.restore(snapshot.into_store())?;
    obs::emit_snapshot_loaded(&workspace_id, &path, targets);
    Ok(targets)
}
