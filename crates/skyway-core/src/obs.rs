//! Structured log events for the workspace lifecycle.
//!
//! Every helper logs with a stable `event` field so log pipelines can key on
//! it. For JSON output run the daemon with `--log-format json`.

use tracing::{info, warn};

use crate::domain::{JobStatus, ReleaseTarget};

/// RAII guard that enters a workspace-scoped span.
///
/// ```ignore
/// let _span = WorkspaceSpan::enter("ws-1");
/// // tracing calls here carry workspace_id = "ws-1"
/// ```
pub struct WorkspaceSpan {
    _span: tracing::span::EnteredSpan,
}

impl WorkspaceSpan {
    pub fn enter(workspace_id: &str) -> Self {
        let span = tracing::info_span!("skyway.workspace", workspace_id = %workspace_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_event_applied(workspace_id: &str, kind: &str, tainted: usize, elapsed_us: u64) {
    info!(
        event = "workspace.event_applied",
        workspace_id = %workspace_id,
        kind = %kind,
        tainted = tainted,
        elapsed_us = elapsed_us,
    );
}

pub fn emit_event_rejected(workspace_id: &str, kind: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "workspace.event_rejected",
        workspace_id = %workspace_id,
        kind = %kind,
        error = %error,
    );
}

pub fn emit_release_created(release_id: &str, target: &ReleaseTarget, version_tag: &str) {
    info!(
        event = "release.created",
        release_id = %release_id,
        release_target = %target,
        version = %version_tag,
    );
}

pub fn emit_job_created(job_id: &str, target: &ReleaseTarget, status: JobStatus) {
    info!(
        event = "job.created",
        job_id = %job_id,
        release_target = %target,
        status = %status,
    );
}

pub fn emit_job_cancelled(job_id: &str, target: &ReleaseTarget, reason: &str) {
    info!(
        event = "job.cancelled",
        job_id = %job_id,
        release_target = %target,
        reason = %reason,
    );
}

pub fn emit_job_transition(job_id: &str, from: JobStatus, to: JobStatus) {
    info!(event = "job.transition", job_id = %job_id, from = %from, to = %to);
}

pub fn emit_job_update_dropped(job_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.update_dropped", job_id = %job_id, error = %error);
}

pub fn emit_redeploy_blocked(target: &ReleaseTarget, job_id: &str, status: JobStatus) {
    info!(
        event = "release_target.redeploy_blocked",
        release_target = %target,
        job_id = %job_id,
        status = %status,
    );
}

pub fn emit_invariant_violation(workspace_id: &str, kind: &str, violation: &str) {
    warn!(
        event = "workspace.invariant_violation",
        workspace_id = %workspace_id,
        kind = %kind,
        violation = %violation,
    );
}

pub fn emit_snapshot_saved(workspace_id: &str, path: &str, bytes: usize) {
    info!(
        event = "snapshot.saved",
        workspace_id = %workspace_id,
        path = %path,
        bytes = bytes,
    );
}

pub fn emit_snapshot_loaded(workspace_id: &str, path: &str, targets: usize) {
    info!(
        event = "snapshot.loaded",
        workspace_id = %workspace_id,
        path = %path,
        release_targets = targets,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_enter_does_not_panic() {
        let _span = WorkspaceSpan::enter("ws-test");
        emit_job_transition("j1", JobStatus::Pending, JobStatus::InProgress);
    }
}
