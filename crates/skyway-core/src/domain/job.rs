//! Jobs and their status lifecycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Deployment, DeploymentVersion, Entity, EntityKind, Environment, JobAgent, Resource};
use super::release::ReleaseTarget;
use super::value::LiteralValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    ActionRequired,
    Successful,
    Failure,
    Cancelled,
    Skipped,
    InvalidJobAgent,
}

impl JobStatus {
    /// Terminal states are frozen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failure | Self::Cancelled | Self::Skipped | Self::InvalidJobAgent
        )
    }

    /// Processing states may still transition.
    pub fn is_processing(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal transitions. Re-asserting the same processing state is allowed
    /// so agents can update metadata without moving the job.
    ///
    /// | From                  | To                                    |
    /// |-----------------------|---------------------------------------|
    /// | Pending               | InProgress, ActionRequired            |
    /// | InProgress            | ActionRequired                        |
    /// | ActionRequired        | InProgress                            |
    /// | any processing        | Cancelled, Successful, Failure, Skipped |
    /// | any terminal          | (none)                                |
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Cancelled | Successful | Failure | Skipped) => true,
            (Pending, InProgress | ActionRequired) => true,
            (InProgress, ActionRequired) => true,
            (ActionRequired, InProgress) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::ActionRequired => "action_required",
            Self::Successful => "successful",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::InvalidJobAgent => "invalid_job_agent",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an agent needs to execute a job, captured at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub release_target: ReleaseTarget,
    pub version: DeploymentVersion,
    pub deployment: Deployment,
    pub environment: Environment,
    pub resource: Resource,
    pub variables: BTreeMap<String, LiteralValue>,
    #[serde(default)]
    pub job_agent: Option<JobAgent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub release_id: String,
    pub release_target: ReleaseTarget,
    #[serde(default)]
    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_context: Option<DispatchContext>,
}

impl Job {
    pub fn is_processing(&self) -> bool {
        self.status.is_processing()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Entity for Job {
    const KIND: EntityKind = EntityKind::Job;
    fn id(&self) -> String {
        self.id.clone()
    }
}

/// Agent-mutable job fields selectable in a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobField {
    Status,
    Message,
    ExternalId,
    Metadata,
    StartedAt,
    CompletedAt,
    JobAgentConfig,
}

impl JobField {
    pub const ALL: [JobField; 7] = [
        JobField::Status,
        JobField::Message,
        JobField::ExternalId,
        JobField::Metadata,
        JobField::StartedAt,
        JobField::CompletedAt,
        JobField::JobAgentConfig,
    ];
}

/// Payload of a job update event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job: Job,
    /// When present only these fields are copied onto the stored job.
    #[serde(default)]
    pub fields_to_update: Option<Vec<JobField>>,
}
