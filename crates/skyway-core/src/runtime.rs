//! Single-writer event loop for one workspace.
//!
//! Events arrive on a bounded queue and are applied strictly in arrival
//! order; each caller gets the outcome of its own event back. The loop
//! stops when its cancellation token fires or every sender is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::DispatchOutcome;
use crate::domain::{EngineError, Result};
use crate::events::Event;
use crate::workspace::Workspace;

enum Command {
    Event {
        event: Event,
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
    ReconcileAll {
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
}

/// Cloneable handle for pushing events into a running [`WorkspaceRunner`].
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Command>,
}

impl EventSender {
    /// Enqueue an event and wait for it to be applied.
    pub async fn push(&self, event: Event) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Event { event, reply }, rx).await
    }

    pub async fn reconcile_all(&self) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReconcileAll { reply }, rx).await
    }

    async fn send(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<DispatchOutcome>>,
    ) -> Result<DispatchOutcome> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::Cancelled("workspace runner".into()))?;
        rx.await
            .map_err(|_| EngineError::Cancelled("workspace runner".into()))?
    }
}

pub struct WorkspaceRunner {
    workspace: Arc<Workspace>,
    rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl WorkspaceRunner {
    pub fn new(workspace: Arc<Workspace>, cancel: CancellationToken) -> (Self, EventSender) {
        let depth = workspace.config().event_queue_depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        (
            Self {
                workspace,
                rx,
                cancel,
            },
            EventSender { tx },
        )
    }

    pub async fn run(mut self) {
        let workspace_id = self.workspace.id();
        let mut ticker = self.workspace.config().reconcile_interval.map(periodic);
        info!(event = "runner.started", workspace_id = %workspace_id);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    if let Err(err) = self.workspace.reconcile_all() {
                        warn!(
                            event = "runner.reconcile_failed",
                            workspace_id = %workspace_id,
                            error = %err,
                        );
                    }
                }
            }
        }
        info!(event = "runner.stopped", workspace_id = %workspace_id);
    }

    fn handle(&self, command: Command) {
        match command {
            Command::Event { event, reply } => {
                deliver(reply, self.workspace.push_event(event), "event");
            }
            Command::ReconcileAll { reply } => {
                deliver(reply, self.workspace.reconcile_all(), "reconcile_all");
            }
        }
    }
}

/// Hand a result back to its caller; `false` when the caller stopped
/// waiting.
fn deliver(
    reply: oneshot::Sender<Result<DispatchOutcome>>,
    result: Result<DispatchOutcome>,
    command: &'static str,
) -> bool {
    let delivered = reply.send(result).is_ok();
    if !delivered {
        debug!(event = "runner.reply_dropped", command);
    }
    delivered
}

fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::System;
    use crate::events::Op;

    fn system(id: &str) -> Event {
        Event::System(Op::Create(System {
            id: id.into(),
            workspace_id: "ws".into(),
            name: id.into(),
            description: None,
        }))
    }

    #[tokio::test]
    async fn events_apply_in_order_and_report_errors() {
        let ws = Arc::new(Workspace::new("ws", EngineConfig::default()));
        let cancel = CancellationToken::new();
        let (runner, sender) = WorkspaceRunner::new(ws.clone(), cancel.clone());
        let handle = tokio::spawn(runner.run());

        sender.push(system("s1")).await.unwrap();
        let err = sender.push(system("s1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        sender.reconcile_all().await.unwrap();
        assert_eq!(ws.read(|s| s.store.systems().count()), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert!(matches!(
            sender.push(system("s2")).await,
            Err(EngineError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_replies_do_not_stop_the_runner() {
        let (reply, rx) = oneshot::channel();
        drop(rx);
        assert!(!deliver(reply, Ok(DispatchOutcome::default()), "reconcile_all"));

        let ws = Arc::new(Workspace::new("ws", EngineConfig::default()));
        let (runner, _sender) = WorkspaceRunner::new(ws.clone(), CancellationToken::new());
        let (reply, rx) = oneshot::channel();
        drop(rx);
        runner.handle(Command::ReconcileAll { reply });
        let (reply, rx) = oneshot::channel();
        drop(rx);
        runner.handle(Command::Event {
            event: system("s1"),
            reply,
        });
        assert_eq!(ws.read(|s| s.store.systems().count()), 1);
    }
}
