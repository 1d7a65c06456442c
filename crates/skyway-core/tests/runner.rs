//! The workspace runner's periodic reconcile, on paused tokio time.

mod common;

use std::time::Duration;

use common::{resource, Fixture};
use skyway_core::{EngineConfig, PolicyRule, WorkspaceNotification, WorkspaceRunner};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn jobs_created(rx: &mut broadcast::Receiver<WorkspaceNotification>) -> usize {
    let mut created = 0;
    while let Ok(notification) = rx.try_recv() {
        if matches!(notification, WorkspaceNotification::JobCreated { .. }) {
            created += 1;
        }
    }
    created
}

#[tokio::test(start_paused = true)]
async fn periodic_reconcile_opens_rollout_slots_without_events() {
    let fx = Fixture::with_config(
        true,
        EngineConfig {
            reconcile_interval: Some(Duration::from_secs(5)),
            ..EngineConfig::default()
        },
    );
    fx.environment("prod", "true");
    fx.resource(resource("r1", "service", &[]));
    fx.resource(resource("r2", "service", &[]));
    fx.policy(
        "p-rollout",
        vec![PolicyRule::GradualRollout {
            interval_seconds: 60,
        }],
    );
    fx.version("v1.0.0");
    assert_eq!(fx.all_jobs().len(), 1);

    let mut rx = fx.ws.subscribe();
    let cancel = CancellationToken::new();
    let (runner, _sender) = WorkspaceRunner::new(fx.ws.clone(), cancel.clone());
    let handle = tokio::spawn(runner.run());

    // 1. Ticks before the next slot leave the workspace alone
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(fx.all_jobs().len(), 1);
    assert_eq!(jobs_created(&mut rx), 0);

    // 2. Once the slot opens the next tick admits the second target
    fx.wait(61);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.all_jobs().len(), 2);
    assert_eq!(jobs_created(&mut rx), 1);

    cancel.cancel();
    handle.await.unwrap();
}
