//! Policy evaluation for a candidate `(release target, version)`.
//!
//! A policy applies when it is enabled and any of its target triples admits
//! the target's environment, deployment and resource. Every rule of every
//! applicable policy must admit the version unless an active bypass
//! suppresses that rule kind. Misconfigured rules deny.

pub mod approval;
pub mod bypass;
pub mod rollout;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticKind;
use crate::domain::{
    DeploymentVersion, Policy, PolicyRule, PolicyTarget, ReleaseTarget, RuleKind,
};
use crate::selector::{Matcher, Subject};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// A rule that denied the version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub policy_id: String,
    pub rule: RuleKind,
    pub reason: String,
}

/// A rule skipped because of a bypass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassedRule {
    pub policy_id: String,
    pub rule: RuleKind,
    pub bypass_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub violations: Vec<Violation>,
    pub bypassed: Vec<BypassedRule>,
}

impl PolicyVerdict {
    pub fn admitted(&self) -> bool {
        self.violations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine<'a> {
    store: &'a Store,
    matcher: Matcher<'a>,
    now: DateTime<Utc>,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(store: &'a Store, matcher: Matcher<'a>, now: DateTime<Utc>) -> Self {
        Self {
            store,
            matcher,
            now,
        }
    }

    /// Enabled policies governing `target`, highest priority first.
    pub fn applicable(&self, target: &ReleaseTarget) -> Vec<&'a Policy> {
        let mut policies: Vec<&Policy> = self
            .store
            .policies()
            .items()
            .filter(|p| p.enabled && p.targets.iter().any(|t| self.target_admits(p, t, target)))
            .collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    fn target_admits(&self, policy: &Policy, selector: &PolicyTarget, target: &ReleaseTarget) -> bool {
        let store = self.store;
        let (Some(env), Some(deployment), Some(resource)) = (
            store.environments().get(&target.environment_id),
            store.deployments().get(&target.deployment_id),
            store.resources().get(&target.resource_id),
        ) else {
            return false;
        };
        let owner = format!("policy/{}", policy.id);
        self.matcher.admits(
            selector.environment_selector.as_ref(),
            Subject::Environment(env),
            true,
            &owner,
        ) && self.matcher.admits(
            selector.deployment_selector.as_ref(),
            Subject::Deployment(deployment),
            true,
            &owner,
        ) && self.matcher.admits(
            selector.resource_selector.as_ref(),
            Subject::Resource(resource),
            true,
            &owner,
        )
    }

    /// Evaluate every applicable rule for `version` on `target`.
    pub fn evaluate(&self, target: &ReleaseTarget, version: &DeploymentVersion) -> PolicyVerdict {
        let mut verdict = PolicyVerdict::default();
        for policy in self.applicable(target) {
            for rule in &policy.rules {
                let kind = rule.kind();
                if let Some(b) =
                    bypass::find_bypass(self.store, target, &version.id, &policy.id, kind, self.now)
                {
                    verdict.bypassed.push(BypassedRule {
                        policy_id: policy.id.clone(),
                        rule: kind,
                        bypass_id: b.id.clone(),
                    });
                    continue;
                }
                if let Err(reason) = self.check_rule(policy, rule, target, version) {
                    tracing::debug!(
                        event = "policy.denied",
                        policy_id = %policy.id,
                        rule = %kind,
                        release_target = %target,
                        version_id = %version.id,
                        reason = %reason,
                    );
                    verdict.violations.push(Violation {
                        policy_id: policy.id.clone(),
                        rule: kind,
                        reason,
                    });
                }
            }
        }
        verdict
    }

    fn check_rule(
        &self,
        policy: &Policy,
        rule: &PolicyRule,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
    ) -> Result<(), String> {
        match rule {
            PolicyRule::AnyApproval { min_approvals } => approval::evaluate(
                self.store,
                &version.id,
                &target.environment_id,
                *min_approvals,
            ),
            PolicyRule::GradualRollout { interval_seconds } => {
                rollout::evaluate(self.store, target, &version.id, *interval_seconds, self.now)
                    .map_err(|e| match e {
                        rollout::RolloutError::Waiting(reason) => reason,
                        rollout::RolloutError::Misconfigured(reason) => {
                            self.matcher.diagnostics.record(
                                DiagnosticKind::PolicyEval,
                                &format!("policy/{}", policy.id),
                                reason.clone(),
                            );
                            reason
                        }
                    })
            }
            PolicyRule::VersionSelector { selector } => {
                if self.matcher.admits(
                    Some(selector),
                    Subject::Version(version),
                    true,
                    &format!("policy/{}", policy.id),
                ) {
                    Ok(())
                } else {
                    Err(format!("version {} rejected by version selector", version.tag))
                }
            }
        }
    }
}
