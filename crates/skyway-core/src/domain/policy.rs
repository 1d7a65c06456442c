//! Policies, approval records and bypasses.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use crate::selector::Selector;

/// Which `(environment, deployment, resource)` triples a policy governs.
/// A missing selector matches everything on that axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyTarget {
    #[serde(default)]
    pub environment_selector: Option<Selector>,
    #[serde(default)]
    pub deployment_selector: Option<Selector>,
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

/// Rule discriminant, used by bypasses and denial reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    AnyApproval,
    GradualRollout,
    VersionSelector,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AnyApproval => "any_approval",
            Self::GradualRollout => "gradual_rollout",
            Self::VersionSelector => "version_selector",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    /// At least `min_approvals` distinct users approved the version for the
    /// environment.
    AnyApproval { min_approvals: u32 },
    /// Successive targets of a deployment receive a version no faster than
    /// one per `interval_seconds`.
    GradualRollout { interval_seconds: i64 },
    /// Only versions the selector admits are deployable.
    VersionSelector { selector: Selector },
}

impl PolicyRule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::AnyApproval { .. } => RuleKind::AnyApproval,
            Self::GradualRollout { .. } => RuleKind::GradualRollout,
            Self::VersionSelector { .. } => RuleKind::VersionSelector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<PolicyTarget>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

/// A user's verdict on a version for an environment. Keyed by
/// `(version, environment, user)`; a newer record replaces an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserApprovalRecord {
    pub version_id: String,
    pub environment_id: String,
    pub user_id: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserApprovalRecord {
    pub fn key_for(version_id: &str, environment_id: &str, user_id: &str) -> String {
        format!("{version_id}/{environment_id}/{user_id}")
    }
}

/// Administrative override suppressing rule kinds for a version.
/// `None` scope fields are wildcards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBypass {
    pub id: String,
    pub version_id: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub policy_ids: Option<Vec<String>>,
    pub bypass_rule_kinds: BTreeSet<RuleKind>,
    pub justification: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicyBypass {
    /// Expired once `expires_at <= now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Whether this bypass suppresses `kind` of `policy_id` for the scope.
    pub fn covers(
        &self,
        version_id: &str,
        environment_id: &str,
        resource_id: &str,
        policy_id: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> bool {
        self.version_id == version_id
            && self.is_active_at(now)
            && self.bypass_rule_kinds.contains(&kind)
            && self
                .environment_id
                .as_deref()
                .map_or(true, |e| e == environment_id)
            && self
                .resource_id
                .as_deref()
                .map_or(true, |r| r == resource_id)
            && self
                .policy_ids
                .as_ref()
                .map_or(true, |ids| ids.iter().any(|p| p == policy_id))
    }
}

impl Entity for Policy {
    const KIND: EntityKind = EntityKind::Policy;
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for UserApprovalRecord {
    const KIND: EntityKind = EntityKind::UserApprovalRecord;
    fn id(&self) -> String {
        Self::key_for(&self.version_id, &self.environment_id, &self.user_id)
    }
}

impl Entity for PolicyBypass {
    const KIND: EntityKind = EntityKind::PolicyBypass;
    fn id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bypass() -> PolicyBypass {
        PolicyBypass {
            id: "b1".into(),
            version_id: "v1".into(),
            environment_id: None,
            resource_id: Some("r1".into()),
            policy_ids: None,
            bypass_rule_kinds: [RuleKind::AnyApproval].into_iter().collect(),
            justification: "hotfix".into(),
            created_by: "oncall".into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn wildcard_fields_match_anything() {
        let b = bypass();
        let now = Utc::now();
        assert!(b.covers("v1", "prod", "r1", "p1", RuleKind::AnyApproval, now));
        assert!(b.covers("v1", "staging", "r1", "p2", RuleKind::AnyApproval, now));
        assert!(!b.covers("v1", "prod", "r2", "p1", RuleKind::AnyApproval, now));
        assert!(!b.covers("v2", "prod", "r1", "p1", RuleKind::AnyApproval, now));
        assert!(!b.covers("v1", "prod", "r1", "p1", RuleKind::GradualRollout, now));
    }

    #[test]
    fn policy_id_list_restricts() {
        let mut b = bypass();
        b.policy_ids = Some(vec!["p1".into()]);
        let now = Utc::now();
        assert!(b.covers("v1", "prod", "r1", "p1", RuleKind::AnyApproval, now));
        assert!(!b.covers("v1", "prod", "r1", "p2", RuleKind::AnyApproval, now));
    }

    #[test]
    fn expiry_is_exclusive() {
        let now = Utc::now();
        let mut b = bypass();
        b.expires_at = Some(now);
        assert!(!b.is_active_at(now));
        b.expires_at = Some(now + Duration::seconds(1));
        assert!(b.is_active_at(now));
    }

    #[test]
    fn rule_json_shape() {
        let rule: PolicyRule =
            serde_json::from_value(serde_json::json!({"any_approval": {"min_approvals": 2}}))
                .expect("deserialize");
        assert_eq!(rule.kind(), RuleKind::AnyApproval);
    }
}
