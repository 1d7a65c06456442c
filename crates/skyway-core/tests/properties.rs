//! Property tests over selectors, fingerprints, variables, snapshots and
//! the job state machine.

mod common;

use std::collections::BTreeMap;

use common::{resource, Fixture};
use proptest::prelude::*;
use skyway_core::domain::fingerprint;
use skyway_core::selector::{Predicate, Subject};
use skyway_core::{
    snapshot, DeploymentVariableValue, Event, JobStatus, LiteralValue, Op, ReleaseTarget,
    ResourceVariable, Selector, StoreSnapshot, Value,
};

const SELECTORS: &[&str] = &[
    "resource.metadata.team == 'core'",
    "resource.kind == 'service' && resource.metadata.tier != 'gold'",
    "resource.name.startsWith('web')",
    "resource.metadata.missing == 'x'",
    "resource.kind ==",
];

const STATUSES: [JobStatus; 8] = [
    JobStatus::Pending,
    JobStatus::InProgress,
    JobStatus::ActionRequired,
    JobStatus::Successful,
    JobStatus::Failure,
    JobStatus::Cancelled,
    JobStatus::Skipped,
    JobStatus::InvalidJobAgent,
];

fn metadata() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["team", "tier", "region"]),
            prop::sample::select(vec!["core", "gold", "edge", "eu"]),
        ),
        0..4,
    )
    .prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn selector_evaluation_is_pure(
        name in "(web|api)-[a-z]{1,6}",
        kind in prop::sample::select(vec!["service", "database"]),
        pairs in metadata(),
        selector in prop::sample::select(SELECTORS.to_vec()),
    ) {
        let meta: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let mut r = resource("r1", kind, &meta);
        r.name = name;
        let selector = Selector::cel(selector);

        let first = Predicate::compile(&selector).map(|p| p.test(Subject::Resource(&r)));
        let second = Predicate::compile(&selector).map(|p| p.test(Subject::Resource(&r)));
        prop_assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(a), Ok(b)) = (first, second) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn fingerprint_is_deterministic(
        vars in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..6),
        version in "v[0-9]{1,3}",
        region in "[a-z]{2}-[a-z]{4}",
    ) {
        let target = ReleaseTarget::new("api", "prod", "r1");
        let variables: BTreeMap<String, LiteralValue> =
            vars.iter().map(|(k, v)| (k.clone(), LiteralValue::Int(*v))).collect();
        let config = serde_json::json!({"region": region, "replicas": 2});

        let a = fingerprint(&target, &version, &variables, Some("A"), &config).unwrap();
        let b = fingerprint(&target, &version, &variables.clone(), Some("A"), &config.clone()).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 64);

        let other = fingerprint(&target, &format!("{version}-rc"), &variables, Some("A"), &config).unwrap();
        prop_assert_ne!(a, other);
    }

    #[test]
    fn override_then_priority_precedence(
        priorities in prop::collection::vec(-5i64..5, 0..6),
        override_value in prop::option::of(100i64..200),
    ) {
        let fx = Fixture::new(true);
        fx.environment("prod", "true");
        fx.resource(resource("r1", "service", &[]));
        fx.variable("replicas", Some(Value::literal(1i64)));
        for (i, priority) in priorities.iter().enumerate() {
            fx.push(Event::DeploymentVariableValue(Op::Create(DeploymentVariableValue {
                id: format!("val-{i}"),
                variable_id: "var-replicas".into(),
                resource_selector: Some(Selector::all()),
                value: Value::literal(10 + i as i64),
                priority: *priority,
            })));
        }
        if let Some(v) = override_value {
            fx.push(Event::ResourceVariable(Op::Create(ResourceVariable {
                resource_id: "r1".into(),
                key: "replicas".into(),
                value: Value::literal(v),
                sensitive: false,
            })));
        }

        // Highest priority wins; the first inserted wins a tie.
        let best = priorities
            .iter()
            .enumerate()
            .fold(None::<(usize, i64)>, |best, (i, p)| match best {
                Some((_, bp)) if bp >= *p => best,
                _ => Some((i, *p)),
            });
        let expected = match (override_value, best) {
            (Some(v), _) => v,
            (None, Some((i, _))) => 10 + i as i64,
            (None, None) => 1,
        };
        let resolved = fx.ws.resolved_variables("api", "r1").unwrap();
        prop_assert_eq!(&resolved["replicas"], &LiteralValue::Int(expected));
    }

    #[test]
    fn snapshot_roundtrip_is_structural(
        resources in prop::collection::btree_set("[a-z]{1,6}", 1..5),
        pairs in metadata(),
        versions in 1usize..4,
    ) {
        let fx = Fixture::new(true);
        fx.environment("prod", "true");
        let meta: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        for id in &resources {
            fx.resource(resource(id, "service", &meta));
        }
        fx.variable("replicas", Some(Value::literal(3i64)));
        for n in 0..versions {
            fx.version(&format!("v{n}"));
        }

        let captured = fx.ws.read(|s| StoreSnapshot::capture(&s.id, &s.store));
        let bytes = snapshot::encode(&captured).unwrap();
        let decoded = snapshot::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &captured);

        let rebuilt = StoreSnapshot::capture(&decoded.workspace_id.clone(), &decoded.into_store());
        prop_assert_eq!(rebuilt, captured);
    }

    #[test]
    fn terminal_jobs_are_frozen(
        transitions in prop::collection::vec(prop::sample::select(STATUSES.to_vec()), 1..10),
    ) {
        let fx = Fixture::new(true);
        fx.environment("prod", "true");
        fx.resource(resource("r1", "service", &[]));
        fx.version("v1");

        let job_id = fx.jobs("r1", "prod")[0].id.clone();
        let mut frozen = None;
        for status in transitions {
            let current = fx.ws.job(&job_id).unwrap();
            fx.clock.advance(chrono::Duration::seconds(5));
            fx.set_status(&current, status);
            let after = fx.ws.job(&job_id).unwrap();
            if frozen.is_none() && after.status.is_terminal() {
                frozen = Some(after.clone());
            }
            if let Some(first) = &frozen {
                prop_assert_eq!(after.status, first.status);
                prop_assert_eq!(&after.message, &first.message);
                prop_assert_eq!(&after.completed_at, &first.completed_at);
                prop_assert!(after.updated_at >= first.updated_at);
            }
            let processing = fx
                .jobs("r1", "prod")
                .iter()
                .filter(|j| j.is_processing())
                .count();
            prop_assert!(processing <= 1);
        }
    }

    #[test]
    fn reconcile_is_idempotent(versions in 1usize..4, targets in 1usize..4) {
        let fx = Fixture::new(true);
        fx.environment("prod", "true");
        for i in 0..targets {
            fx.resource(resource(&format!("r{i}"), "service", &[]));
        }
        for n in 0..versions {
            fx.version(&format!("v{n}"));
        }

        let before = fx.ws.read(|s| s.store.jobs_in_order().cloned().collect::<Vec<_>>());
        let first = fx.ws.reconcile_all().unwrap();
        let second = fx.ws.reconcile_all().unwrap();
        let after = fx.ws.read(|s| s.store.jobs_in_order().cloned().collect::<Vec<_>>());
        prop_assert_eq!(before, after);
        prop_assert!(first.notifications.is_empty());
        prop_assert!(second.notifications.is_empty());
    }
}
