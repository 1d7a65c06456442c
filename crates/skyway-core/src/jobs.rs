//! Job creation, cancellation and agent-driven updates.
//!
//! Terminal jobs are frozen: nothing here mutates a job once it reached
//! `Successful`, `Failure`, `Cancelled`, `Skipped` or `InvalidJobAgent`.

use chrono::{DateTime, Utc};

use crate::domain::{
    DispatchContext, EngineError, Job, JobField, JobStatus, JobUpdate, Release, ReleaseTarget,
    Result, ValidationError,
};
use crate::store::Store;

/// A status change applied to a stored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub job_id: String,
    pub release_target: ReleaseTarget,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobTransition {
    pub fn entered_terminal(&self) -> bool {
        !self.from.is_terminal() && self.to.is_terminal()
    }
}

/// Build a job for `release`. Without a job agent the job is born
/// terminal as `InvalidJobAgent`.
pub fn new_job(release: &Release, context: DispatchContext, now: DateTime<Utc>) -> Job {
    let status = if release.job_agent_id.is_some() {
        JobStatus::Pending
    } else {
        JobStatus::InvalidJobAgent
    };
    Job {
        id: uuid::Uuid::new_v4().to_string(),
        release_id: release.id.clone(),
        release_target: release.release_target.clone(),
        job_agent_id: release.job_agent_id.clone(),
        job_agent_config: release.job_agent_config.clone(),
        status,
        message: (status == JobStatus::InvalidJobAgent)
            .then(|| "deployment has no job agent".to_string()),
        external_id: None,
        metadata: Default::default(),
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: status.is_terminal().then_some(now),
        dispatch_context: Some(context),
    }
}

/// The processing job of a target, if any.
pub fn processing_job<'a>(store: &'a Store, target: &ReleaseTarget) -> Option<&'a Job> {
    store.jobs_for(target).find(|j| j.is_processing())
}

/// Cancel a processing job. Terminal jobs are left untouched and `false` is
/// returned.
pub fn cancel(store: &mut Store, job_id: &str, reason: &str, now: DateTime<Utc>) -> bool {
    let processing = store.jobs().get(job_id).map_or(false, Job::is_processing);
    if !processing {
        return false;
    }
    store.update_job(job_id, |job| {
        job.status = JobStatus::Cancelled;
        job.message = Some(reason.to_string());
        job.completed_at = Some(now);
        job.updated_at = job.updated_at.max(now);
    })
}

/// Apply an agent update.
///
/// With `fields_to_update` only the listed fields are copied; without it
/// every agent-mutable field is. Identity fields (id, release, target,
/// creation time, dispatch context) never change. `started_at` and
/// `completed_at` are filled in when the status implies them, and
/// `updated_at` never moves backwards.
pub fn apply_update(store: &mut Store, update: JobUpdate, now: DateTime<Utc>) -> Result<JobTransition> {
    let incoming = update.job;
    let stored = store
        .jobs()
        .get(&incoming.id)
        .ok_or_else(|| ValidationError::not_found("job", &incoming.id))?;
    let fields = update
        .fields_to_update
        .unwrap_or_else(|| JobField::ALL.to_vec());
    let from = stored.status;
    let to = if fields.contains(&JobField::Status) {
        incoming.status
    } else {
        from
    };

    if from.is_terminal() || !from.can_transition_to(to) {
        return Err(EngineError::JobState {
            job_id: incoming.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let release_target = stored.release_target.clone();

    store.update_job(&incoming.id, |job| {
        for field in &fields {
            match field {
                JobField::Status => job.status = incoming.status,
                JobField::Message => job.message = incoming.message.clone(),
                JobField::ExternalId => job.external_id = incoming.external_id.clone(),
                JobField::Metadata => job.metadata = incoming.metadata.clone(),
                JobField::StartedAt => job.started_at = incoming.started_at,
                JobField::CompletedAt => job.completed_at = incoming.completed_at,
                JobField::JobAgentConfig => job.job_agent_config = incoming.job_agent_config.clone(),
            }
        }
        if job.status == JobStatus::InProgress && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if job.status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        job.updated_at = job.updated_at.max(now);
    });

    Ok(JobTransition {
        job_id: incoming.id,
        release_target,
        from,
        to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Deployment, DeploymentVersion, Environment, Resource, VersionStatus,
    };
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn release(agent: Option<&str>) -> Release {
        let target = ReleaseTarget::new("d1", "e1", "r1");
        Release::new(
            target,
            version(),
            BTreeMap::new(),
            agent.map(str::to_string),
            serde_json::json!({"namespace": "api"}),
            Utc::now(),
        )
        .unwrap()
    }

    fn version() -> DeploymentVersion {
        DeploymentVersion {
            id: "v1".into(),
            deployment_id: "d1".into(),
            name: "v1".into(),
            tag: "v1".into(),
            config: serde_json::Value::Null,
            job_agent_config: serde_json::Value::Null,
            metadata: BTreeMap::new(),
            status: VersionStatus::Ready,
            message: None,
            created_at: Utc::now(),
        }
    }

    fn context() -> DispatchContext {
        DispatchContext {
            release_target: ReleaseTarget::new("d1", "e1", "r1"),
            version: version(),
            deployment: Deployment {
                id: "d1".into(),
                system_id: "s1".into(),
                name: "api".into(),
                slug: None,
                description: None,
                job_agent_id: None,
                job_agent_config: serde_json::Value::Null,
                resource_selector: None,
            },
            environment: Environment {
                id: "e1".into(),
                system_id: "s1".into(),
                name: "prod".into(),
                description: None,
                resource_selector: None,
            },
            resource: Resource {
                id: "r1".into(),
                workspace_id: "ws".into(),
                name: "r1".into(),
                kind: "service".into(),
                identifier: "r1".into(),
                version: String::new(),
                metadata: BTreeMap::new(),
                config: serde_json::Value::Null,
                created_at: Utc::now(),
            },
            variables: BTreeMap::new(),
            job_agent: None,
        }
    }

    fn seeded(agent: Option<&str>) -> (Store, Job) {
        let mut store = Store::new();
        let job = new_job(&release(agent), context(), Utc::now());
        store.insert_job(job.clone());
        (store, job)
    }

    #[test]
    fn missing_agent_creates_terminal_job() {
        let (_, job) = seeded(None);
        assert_eq!(job.status, JobStatus::InvalidJobAgent);
        assert!(job.completed_at.is_some());
        let (_, job) = seeded(Some("argo"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn partial_update_touches_only_listed_fields() {
        let (mut store, job) = seeded(Some("argo"));
        let mut incoming = job.clone();
        incoming.status = JobStatus::InProgress;
        incoming.message = Some("ignored".into());
        incoming.external_id = Some("run-42".into());
        let now = job.created_at + Duration::seconds(5);
        let transition = apply_update(
            &mut store,
            JobUpdate {
                job: incoming,
                fields_to_update: Some(vec![JobField::Status, JobField::ExternalId]),
            },
            now,
        )
        .unwrap();
        assert_eq!(transition.to, JobStatus::InProgress);
        let stored = store.jobs().get(&job.id).unwrap();
        assert_eq!(stored.message, None);
        assert_eq!(stored.external_id.as_deref(), Some("run-42"));
        assert_eq!(stored.started_at, Some(now));
        assert_eq!(stored.updated_at, now);
    }

    #[test]
    fn full_update_keeps_identity() {
        let (mut store, job) = seeded(Some("argo"));
        let mut incoming = job.clone();
        incoming.status = JobStatus::Successful;
        incoming.release_id = "forged".into();
        incoming.created_at = job.created_at - Duration::days(1);
        apply_update(&mut store, JobUpdate { job: incoming, fields_to_update: None }, job.created_at).unwrap();
        let stored = store.jobs().get(&job.id).unwrap();
        assert_eq!(stored.release_id, job.release_id);
        assert_eq!(stored.created_at, job.created_at);
        assert_eq!(stored.status, JobStatus::Successful);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn terminal_jobs_reject_updates_and_cancellation() {
        let (mut store, job) = seeded(None);
        let mut incoming = job.clone();
        incoming.status = JobStatus::InProgress;
        let err = apply_update(&mut store, JobUpdate { job: incoming, fields_to_update: None }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::JobState { .. }));
        assert!(!cancel(&mut store, &job.id, "retargeted", Utc::now()));
        assert_eq!(store.jobs().get(&job.id).unwrap(), &job);
    }

    #[test]
    fn cancel_processing_job() {
        let (mut store, job) = seeded(Some("argo"));
        assert!(cancel(&mut store, &job.id, "release target removed", Utc::now()));
        let stored = store.jobs().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.completed_at.is_some());
        assert!(processing_job(&store, &job.release_target).is_none());
    }
}
