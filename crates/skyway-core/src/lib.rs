//! Skyway Core Library
//!
//! Reactive workspace engine for continuous deployment: materializes release
//! targets from selectors, gates versions through policies, resolves
//! variables and emits jobs for external agents.

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod domain;
pub mod events;
pub mod jobs;
pub mod obs;
pub mod policy;
pub mod relationships;
pub mod releases;
pub mod runtime;
pub mod selector;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod variables;
pub mod views;
pub mod workspace;

pub use domain::{
    ApprovalStatus, Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion,
    DispatchContext, EngineError, Entity, EntityKind, Environment, Job, JobAgent, JobField,
    JobStatus, JobUpdate, LiteralValue, Policy, PolicyBypass, PolicyRule, PolicyTarget,
    PropertyComparator, PropertyMatcher, RelatableType, RelationshipRule, Release, ReleaseTarget,
    Resource, ResourceVariable, Result, RuleKind, System, UserApprovalRecord, ValidationError,
    Value, VersionStatus,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use dispatcher::{DispatchOutcome, WorkspaceNotification, WorkspaceState};
pub use events::{Event, Op};
pub use policy::{PolicyVerdict, Violation};
pub use releases::{Admission, ReconcileMode, ReconcileOutcome, ReleaseManager};
pub use runtime::{EventSender, WorkspaceRunner};
pub use selector::json::{DateOperator, JsonSelector, MatchOperator};
pub use selector::Selector;
pub use snapshot::StoreSnapshot;
pub use store::{Change, ChangeOp, Store};
pub use telemetry::{init_tracing, LogFormat};
pub use workspace::Workspace;

pub use skyway_state::{FsObjectStore, MemoryObjectStore, ObjectStore, StorageError};
