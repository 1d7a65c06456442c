//! Domain models for skyway.
//!
//! Canonical definitions for the entities a workspace owns:
//! - `System`, `Deployment`, `Environment`, `Resource`, `JobAgent`
//! - `DeploymentVersion` and the variable types
//! - `Policy`, `UserApprovalRecord`, `PolicyBypass`
//! - `RelationshipRule`
//! - derived `ReleaseTarget`, `Release` and `Job`

pub mod digest;
pub mod entity;
pub mod error;
pub mod job;
pub mod policy;
pub mod relationship;
pub mod release;
pub mod value;

pub use entity::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, Entity,
    EntityKind, Environment, JobAgent, Resource, ResourceVariable, System, VersionStatus,
};
pub use error::{EngineError, Result, ValidationError};
pub use job::{DispatchContext, Job, JobField, JobStatus, JobUpdate};
pub use policy::{
    ApprovalStatus, Policy, PolicyBypass, PolicyRule, PolicyTarget, RuleKind, UserApprovalRecord,
};
pub use relationship::{PropertyComparator, PropertyMatcher, RelatableType, RelationshipRule};
pub use release::{fingerprint, Release, ReleaseTarget};
pub use value::{LiteralValue, Value};
