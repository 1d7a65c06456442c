//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SNAPSHOT_PREFIX: &str = "workspaces";
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_MAX_DIAGNOSTICS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Object-store prefix under which snapshots are written as
    /// `<prefix>/<workspace_id>.snapshot`.
    pub snapshot_prefix: String,
    /// Deadline for a single snapshot save or load.
    pub snapshot_timeout: Duration,
    /// Check job invariants on the targets each event reaches and roll back
    /// on violation.
    pub verify_invariants: bool,
    /// Capacity of the runner's ingress queue.
    pub event_queue_depth: usize,
    /// When set, the runner re-reconciles every target on this interval.
    pub reconcile_interval: Option<Duration>,
    pub max_diagnostics: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.to_string(),
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            verify_invariants: true,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            reconcile_interval: None,
            max_diagnostics: DEFAULT_MAX_DIAGNOSTICS,
        }
    }
}

impl EngineConfig {
    pub fn snapshot_path(&self, workspace_id: &str) -> String {
        let prefix = self.snapshot_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{workspace_id}.snapshot")
        } else {
            format!("{prefix}/{workspace_id}.snapshot")
        }
    }
}
