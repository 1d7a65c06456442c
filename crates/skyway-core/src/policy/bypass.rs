//! Policy bypass lookup.

use chrono::{DateTime, Utc};

use crate::domain::{PolicyBypass, ReleaseTarget, RuleKind};
use crate::store::Store;

/// First active bypass (by id) suppressing `kind` of `policy_id` for the
/// version on the target.
pub fn find_bypass<'a>(
    store: &'a Store,
    target: &ReleaseTarget,
    version_id: &str,
    policy_id: &str,
    kind: RuleKind,
    now: DateTime<Utc>,
) -> Option<&'a PolicyBypass> {
    store.bypasses().items().find(|b| {
        b.covers(
            version_id,
            &target.environment_id,
            &target.resource_id,
            policy_id,
            kind,
            now,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bypass(id: &str, expires_at: Option<DateTime<Utc>>) -> PolicyBypass {
        PolicyBypass {
            id: id.into(),
            version_id: "v1".into(),
            environment_id: Some("prod".into()),
            resource_id: None,
            policy_ids: None,
            bypass_rule_kinds: [RuleKind::AnyApproval].into_iter().collect(),
            justification: "incident".into(),
            created_by: "sre".into(),
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn expired_bypass_is_ignored() {
        let now = Utc::now();
        let mut store = Store::new();
        store.upsert_bypass(bypass("b1", Some(now - Duration::seconds(1))));
        let target = ReleaseTarget::new("d1", "prod", "r1");
        assert!(find_bypass(&store, &target, "v1", "p1", RuleKind::AnyApproval, now).is_none());

        store.upsert_bypass(bypass("b2", Some(now + Duration::hours(1))));
        let found = find_bypass(&store, &target, "v1", "p1", RuleKind::AnyApproval, now).unwrap();
        assert_eq!(found.id, "b2");

        let staging = ReleaseTarget::new("d1", "staging", "r1");
        assert!(find_bypass(&store, &staging, "v1", "p1", RuleKind::AnyApproval, now).is_none());
    }
}
