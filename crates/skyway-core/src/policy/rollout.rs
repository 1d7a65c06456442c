//! `GradualRollout` rule.
//!
//! A version reaches the targets of a deployment one at a time: the next
//! target is admitted once `interval_seconds` have passed since the version
//! was last admitted anywhere in the deployment. Admission time is the
//! creation time of the newest job carrying the version. A target that
//! already has a job for the version stays admitted.

use chrono::{DateTime, Duration, Utc};

use crate::domain::ReleaseTarget;
use crate::store::Store;

/// Newest job creation time for `version_id` across the deployment.
pub fn last_admission(store: &Store, deployment_id: &str, version_id: &str) -> Option<DateTime<Utc>> {
    store
        .job_targets()
        .filter(|t| t.deployment_id == deployment_id)
        .flat_map(|t| store.jobs_for(t))
        .filter(|job| {
            store
                .releases()
                .get(&job.release_id)
                .map_or(false, |r| r.version.id == version_id)
        })
        .map(|job| job.created_at)
        .max()
}

fn target_has_version(store: &Store, target: &ReleaseTarget, version_id: &str) -> bool {
    store.jobs_for(target).any(|job| {
        store
            .releases()
            .get(&job.release_id)
            .map_or(false, |r| r.version.id == version_id)
    })
}

/// `Err` carries the denial reason; a negative interval is a
/// misconfiguration reported through [`RolloutError::Misconfigured`].
pub fn evaluate(
    store: &Store,
    target: &ReleaseTarget,
    version_id: &str,
    interval_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), RolloutError> {
    if interval_seconds < 0 {
        return Err(RolloutError::Misconfigured(format!(
            "interval_seconds must be non-negative, got {interval_seconds}"
        )));
    }
    if target_has_version(store, target, version_id) {
        return Ok(());
    }
    let Some(last) = last_admission(store, &target.deployment_id, version_id) else {
        return Ok(());
    };
    let next = last + Duration::seconds(interval_seconds);
    if now >= next {
        Ok(())
    } else {
        Err(RolloutError::Waiting(format!(
            "version {version_id} next rollout slot at {}",
            next.to_rfc3339()
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutError {
    Waiting(String),
    Misconfigured(String),
}
