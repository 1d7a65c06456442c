//! `AnyApproval` rule.

use crate::domain::ApprovalStatus;
use crate::store::Store;

/// Distinct users whose latest record approves `version_id` for
/// `environment_id`. Records are keyed per user, so a later rejection
/// replaces an earlier approval.
pub fn approval_count(store: &Store, version_id: &str, environment_id: &str) -> u32 {
    let count = store
        .approvals()
        .items()
        .filter(|r| {
            r.version_id == version_id
                && r.environment_id == environment_id
                && r.status == ApprovalStatus::Approved
        })
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Admit iff enough approvals exist. Returns the denial reason otherwise.
pub fn evaluate(
    store: &Store,
    version_id: &str,
    environment_id: &str,
    min_approvals: u32,
) -> Result<(), String> {
    let approvals = approval_count(store, version_id, environment_id);
    if approvals >= min_approvals {
        Ok(())
    } else {
        Err(format!(
            "{approvals} of {min_approvals} required approvals for version {version_id} in environment {environment_id}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserApprovalRecord;
    use chrono::Utc;

    fn record(user: &str, env: &str, status: ApprovalStatus) -> UserApprovalRecord {
        UserApprovalRecord {
            version_id: "v1".into(),
            environment_id: env.into(),
            user_id: user.into(),
            status,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn latest_record_per_user_wins() {
        let mut store = Store::new();
        store.upsert_approval(record("alice", "prod", ApprovalStatus::Approved));
        store.upsert_approval(record("bob", "prod", ApprovalStatus::Approved));
        store.upsert_approval(record("carol", "staging", ApprovalStatus::Approved));
        assert_eq!(approval_count(&store, "v1", "prod"), 2);

        store.upsert_approval(record("bob", "prod", ApprovalStatus::Rejected));
        assert_eq!(approval_count(&store, "v1", "prod"), 1);
        assert!(evaluate(&store, "v1", "prod", 2).is_err());
        assert!(evaluate(&store, "v1", "prod", 1).is_ok());
        assert!(evaluate(&store, "v1", "qa", 0).is_ok());
    }
}
